//! `skillpack extract` command: unpack a stored skill into a directory.

use std::path::PathBuf;

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::image::Platform;
use skillpack_runtime::oci::layers::{unpack_layer, TarLimits};

#[derive(Args)]
pub struct ExtractArgs {
    /// Local tag or digest of the skill
    pub reference: String,

    /// Directory to unpack into
    pub dir: PathBuf,

    /// Platform to unpack (default: first in the index)
    #[arg(long)]
    pub platform: Option<String>,
}

pub async fn execute(args: ExtractArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let digest = super::resolve_local(&store, &args.reference)?;
    let wanted = args
        .platform
        .as_deref()
        .map(str::parse::<Platform>)
        .transpose()?;

    let manifests = super::load_manifests(&store, &digest)?;
    let selected = match wanted {
        Some(ref platform) => manifests
            .iter()
            .find(|m| m.platform.as_ref() == Some(platform))
            .ok_or_else(|| format!("No manifest for platform {} in {}", platform, args.reference))?,
        None => manifests
            .first()
            .ok_or_else(|| format!("No manifests in {}", args.reference))?,
    };

    std::fs::create_dir_all(&args.dir)?;
    let limits = TarLimits::default();
    let mut files = Vec::new();
    for layer in &selected.manifest.layers {
        let data = store.get_blob(&layer.digest)?;
        files.extend(unpack_layer(&data, &args.dir, &limits)?);
    }

    for file in &files {
        println!("{file}");
    }
    println!("Extracted {} file(s) to {}", files.len(), args.dir.display());
    Ok(())
}
