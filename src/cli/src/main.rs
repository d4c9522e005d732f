//! Skillpack CLI entry point.

use clap::Parser;
use skillpack_core::SkillpackConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use skillpack_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match SkillpackConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let level = LevelFilter::from_level(tracing::Level::from(config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into())),
        )
        .with_target(false)
        .init();

    if let Err(e) = dispatch(cli, &config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
