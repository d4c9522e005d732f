//! `skillpack pull` command.

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::Reference;

#[derive(Args)]
pub struct PullArgs {
    /// Reference with a tag or digest (e.g., "ghcr.io/org/skill:v1")
    pub reference: String,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;

    let reference = Reference::parse(&args.reference)?;
    reference.require_tag_or_digest()?;

    if !args.quiet {
        println!("Pulling {}...", reference);
    }

    let client = super::registry_client(config, &reference.registry);
    let result = client.pull(&store, &args.reference).await?;

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!(
            "Pulled: {} ({}, {} manifest(s))",
            result.reference,
            result.digest,
            result.manifests.len()
        );
    }
    Ok(())
}
