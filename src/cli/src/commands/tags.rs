//! `skillpack tags` command.

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::labels::SkillLabels;
use skillpack_runtime::oci::LocalStore;

use crate::output;

const HEADERS: [&str; 5] = ["TAG", "NAME", "VERSION", "DIGEST", "SIZE"];

#[derive(Args)]
pub struct TagsArgs {
    /// Only show tags (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Format output using placeholders: {{.Tag}}, {{.Name}}, {{.Version}},
    /// {{.Digest}}, {{.Size}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(args: TagsArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let tags = store.list_tags()?;

    if args.quiet {
        for tag in &tags {
            println!("{tag}");
        }
        return Ok(());
    }

    let rows = tags
        .iter()
        .map(|tag| TagRow::load(&store, tag))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for row in &rows {
        table.add_row(&[&row.tag, &row.name, &row.version, &row.digest, &row.size]);
    }
    println!("{table}");
    Ok(())
}

/// Pre-computed display fields for a single tag.
struct TagRow {
    tag: String,
    name: String,
    version: String,
    digest: String,
    size: String,
}

impl TagRow {
    fn load(store: &LocalStore, tag: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let digest = store.resolve(tag)?;
        let labels = super::skill_labels(store, &digest)?.unwrap_or_default();
        Ok(Self::new(tag, &digest.to_string(), store.blob_size(&digest)?, &labels))
    }

    fn new(tag: &str, digest: &str, size: u64, labels: &SkillLabels) -> Self {
        Self {
            tag: tag.to_string(),
            name: output::or_none(labels.name.as_deref()),
            version: output::or_none(labels.version.as_deref()),
            digest: output::short_digest(digest),
            size: output::format_bytes(size),
        }
    }

    /// Apply a format template, replacing `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.Tag}}", &self.tag)
            .replace("{{.Name}}", &self.name)
            .replace("{{.Version}}", &self.version)
            .replace("{{.Digest}}", &self.digest)
            .replace("{{.Size}}", &self.size)
    }
}
