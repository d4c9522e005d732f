//! Persistent credential store for skill registries.
//!
//! Stores per-registry basic credentials at `<home>/auth/credentials.json`,
//! rewriting the file atomically on every change.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skillpack_core::config::SkillpackConfig;
use skillpack_core::error::{PackError, Result};

/// Username and password for one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, Credential>,
}

/// Registry credential store backed by a JSON file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Credential store at the configured location.
    pub fn from_config(config: &SkillpackConfig) -> Self {
        Self::new(config.credentials_path())
    }

    /// Credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store credentials for a registry, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Err(PackError::InvalidInput("Username must not be empty".to_string()));
        }
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Credentials for a registry, if stored.
    pub fn get(&self, registry: &str) -> Result<Option<Credential>> {
        let file = self.load()?;
        Ok(file.registries.get(&normalize_registry(registry)).cloned())
    }

    /// Remove credentials for a registry. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    /// Registries with stored credentials, sorted.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        Ok(self.load()?.registries.into_keys().collect())
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            PackError::ConfigError(format!(
                "Invalid credential store path {}",
                self.path.display()
            ))
        })?;
        std::fs::create_dir_all(parent).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to create credential store directory {}: {}",
                parent.display(),
                e
            ))
        })?;

        let data = serde_json::to_vec_pretty(file)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&data)?;
        tmp.persist(&self.path).map_err(|e| {
            PackError::ConfigError(format!(
                "Failed to write credential store {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

/// Normalize a registry name so aliases share one entry.
///
/// Scheme and trailing slashes are dropped and Docker Hub aliases collapse
/// to `docker.io`.
pub fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(r.as_str())
        .trim_end_matches('/');
    match r {
        "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        other => other.to_string(),
    }
}
