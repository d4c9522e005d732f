//! `skillpack push` command: push a stored skill to a registry.

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::Reference;

#[derive(Args)]
pub struct PushArgs {
    /// Local tag or digest of the skill
    pub source: String,

    /// Target reference with a tag or digest (e.g., "ghcr.io/org/skill:v1")
    pub reference: String,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    // Validate the target before touching anything else
    let reference = Reference::parse(&args.reference)?;
    reference.require_tag_or_digest()?;

    let digest = super::resolve_local(&store, &args.source)?;

    if !args.quiet {
        println!("Pushing {} to {}...", args.source, reference);
    }

    let client = super::registry_client(config, &reference.registry);
    let result = client.push(&store, &digest, &args.reference).await?;

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!("Pushed: {}", result.reference);
    }
    Ok(())
}
