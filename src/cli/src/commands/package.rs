//! `skillpack package` command: build a skill directory into the local store.

use std::path::PathBuf;

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::build::{PackageOptions, Packager};
use skillpack_runtime::oci::image::Platform;

use crate::output;

#[derive(Args)]
pub struct PackageArgs {
    /// Skill directory containing SKILL.md
    pub dir: PathBuf,

    /// Target platform as os/arch[/variant] (repeatable)
    #[arg(long)]
    pub platform: Vec<String>,

    /// Build timestamp as Unix seconds (default: SOURCE_DATE_EPOCH, else 0)
    #[arg(long)]
    pub epoch: Option<i64>,

    /// Tag the packaged skill in the local store
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only print the index digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PackageArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    let requested = if args.platform.is_empty() {
        &config.platforms
    } else {
        &args.platform
    };
    let platforms = parse_platforms(requested)?;

    let mut options = PackageOptions::default();
    if let Some(epoch) = args.epoch {
        options = options.with_epoch(epoch);
    }
    if !platforms.is_empty() {
        options = options.with_platforms(platforms);
    }

    let result = Packager::new(store.clone())?.package(&args.dir, &options)?;
    if let Some(ref tag) = args.tag {
        store.tag(&result.index_digest, tag)?;
    }

    if args.quiet {
        println!("{}", result.index_digest);
        return Ok(());
    }

    println!("Packaged {} ({})", result.config.name, result.index_digest);
    let mut table = output::new_table(&["PLATFORM", "MANIFEST", "LAYER"]);
    for stored in super::load_manifests(&store, &result.index_digest)? {
        table.add_row(vec![
            stored.platform.map(|p| p.to_string()).unwrap_or_default(),
            output::short_digest(&stored.digest.to_string()),
            output::short_digest(&result.layer_digest.to_string()),
        ]);
    }
    println!("{table}");
    if let Some(ref tag) = args.tag {
        println!("Tagged: {}", tag);
    }
    Ok(())
}

fn parse_platforms(values: &[String]) -> Result<Vec<Platform>, Box<dyn std::error::Error>> {
    let mut platforms = Vec::with_capacity(values.len());
    for value in values {
        platforms.push(value.parse::<Platform>()?);
    }
    Ok(platforms)
}
