//! CLI command definitions and dispatch.

mod extract;
mod inspect;
mod login;
mod logout;
mod package;
mod pull;
mod push;
mod tag;
mod tags;
mod version;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use skillpack_core::SkillpackConfig;
use skillpack_runtime::oci::credentials::CredentialStore;
use skillpack_runtime::oci::image::{ImageConfig, ImageManifest, Platform};
use skillpack_runtime::oci::labels::SkillLabels;
use skillpack_runtime::oci::registry::{DistributionTransport, RegistryAuth, RegistryClient};
use skillpack_runtime::oci::{Digest, LocalStore};

/// Skillpack: package and distribute agent skills as OCI artifacts.
#[derive(Parser)]
#[command(name = "skillpack", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Package a skill directory into the local store
    Package(package::PackageArgs),
    /// Push a stored skill to a registry
    Push(push::PushArgs),
    /// Pull a skill from a registry into the local store
    Pull(pull::PullArgs),
    /// List tags in the local store
    Tags(tags::TagsArgs),
    /// Create a tag that refers to a stored skill
    Tag(tag::TagArgs),
    /// Display skill metadata as JSON
    Inspect(inspect::InspectArgs),
    /// Unpack a stored skill into a directory
    Extract(extract::ExtractArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: &SkillpackConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Package(args) => package::execute(args, config).await,
        Command::Push(args) => push::execute(args, config).await,
        Command::Pull(args) => pull::execute(args, config).await,
        Command::Tags(args) => tags::execute(args, config).await,
        Command::Tag(args) => tag::execute(args, config).await,
        Command::Inspect(args) => inspect::execute(args, config).await,
        Command::Extract(args) => extract::execute(args, config).await,
        Command::Login(args) => login::execute(args, config).await,
        Command::Logout(args) => logout::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Open the local store, creating it on first use.
pub(crate) fn open_store(config: &SkillpackConfig) -> Result<Arc<LocalStore>, Box<dyn std::error::Error>> {
    let dir = config.store_dir();
    tracing::debug!(path = %dir.display(), "Opening store");
    Ok(Arc::new(LocalStore::open(&dir)?))
}

/// Build a registry client for `registry` using stored credentials.
pub(crate) fn registry_client(config: &SkillpackConfig, registry: &str) -> RegistryClient {
    let credentials = CredentialStore::from_config(config);
    let auth = RegistryAuth::from_credential_store(&credentials, registry);
    let transport = DistributionTransport::with_protocol(auth, config.registry.insecure);

    let client = RegistryClient::new(Arc::new(transport));
    match config.registry.timeout_secs {
        0 => client,
        secs => client.with_timeout(Duration::from_secs(secs)),
    }
}

/// Resolve a local tag or digest to a stored digest.
pub(crate) fn resolve_local(store: &LocalStore, source: &str) -> Result<Digest, Box<dyn std::error::Error>> {
    if let Ok(digest) = source.parse::<Digest>() {
        if store.exists(&digest) {
            return Ok(digest);
        }
    }
    store
        .resolve(source)
        .map_err(|_| format!("Skill not found locally: {}", source).into())
}

/// A platform manifest with its config, as found in the store.
pub(crate) struct StoredManifest {
    pub digest: Digest,
    pub platform: Option<Platform>,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

/// Load every platform manifest reachable from `digest`.
pub(crate) fn load_manifests(store: &LocalStore, digest: &Digest) -> Result<Vec<StoredManifest>, Box<dyn std::error::Error>> {
    let entries = if store.is_index(digest)? {
        store
            .get_index(digest)?
            .manifests
            .into_iter()
            .map(|d| (d.digest, d.platform))
            .collect()
    } else {
        vec![(digest.clone(), None)]
    };

    let mut manifests = Vec::with_capacity(entries.len());
    for (digest, platform) in entries {
        let manifest = store.get_image_manifest(&digest)?;
        let config: ImageConfig = serde_json::from_slice(&store.get_blob(&manifest.config.digest)?)?;
        let platform = platform.or_else(|| {
            Some(Platform {
                os: config.os.clone(),
                architecture: config.architecture.clone(),
                variant: config.variant.clone(),
            })
        });
        manifests.push(StoredManifest {
            digest,
            platform,
            manifest,
            config,
        });
    }
    Ok(manifests)
}

/// Skill labels of the first platform manifest under `digest`.
pub(crate) fn skill_labels(store: &LocalStore, digest: &Digest) -> Result<Option<SkillLabels>, Box<dyn std::error::Error>> {
    let manifests = load_manifests(store, digest)?;
    let Some(first) = manifests.first() else {
        return Ok(None);
    };
    let labels = SkillLabels::from_labels(&first.config.config.labels)?;
    Ok(labels.is_skill().then_some(labels))
}
