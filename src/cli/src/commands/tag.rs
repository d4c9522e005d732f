//! `skillpack tag` command: create a tag that refers to a stored skill.

use clap::Args;
use skillpack_core::SkillpackConfig;

#[derive(Args)]
pub struct TagArgs {
    /// Existing local tag or digest
    pub source: String,

    /// New tag
    pub target: String,
}

pub async fn execute(args: TagArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let digest = super::resolve_local(&store, &args.source)?;

    store.tag(&digest, &args.target)?;

    println!("{}", args.target);
    Ok(())
}
