//! `skillpack logout` command: remove stored registry credentials.

use clap::Args;
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::credentials::CredentialStore;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,
}

pub async fn execute(args: LogoutArgs, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "docker.io".to_string());

    let store = CredentialStore::from_config(config);
    if store.remove(&server)? {
        println!("Removing login credentials for {server}");
    } else {
        println!("Not logged in to {server}");
    }
    Ok(())
}
