//! Skillpack configuration.
//!
//! Configuration is read from `<home>/config.yaml` when present, where
//! `<home>` defaults to `~/.skillpack` and can be overridden with the
//! `SKILLPACK_HOME` environment variable. Every field has a default, so a
//! missing file is equivalent to an empty one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PackError, Result};

/// Environment variable overriding the skillpack home directory.
pub const HOME_ENV: &str = "SKILLPACK_HOME";

/// Environment variable selecting the default packaging epoch.
pub const SOURCE_DATE_EPOCH_ENV: &str = "SOURCE_DATE_EPOCH";

/// Skillpack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillpackConfig {
    /// Root directory for the store, credentials and config file
    pub home: PathBuf,

    /// Log level used when `RUST_LOG` is unset
    pub log_level: LogLevel,

    /// Registry client settings
    pub registry: RegistryConfig,

    /// Default packaging platforms (`os/arch[/variant]`); empty uses the
    /// built-in list
    pub platforms: Vec<String>,
}

impl Default for SkillpackConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            log_level: LogLevel::Warn,
            registry: RegistryConfig::default(),
            platforms: Vec::new(),
        }
    }
}

impl SkillpackConfig {
    /// Load configuration from the default home directory.
    pub fn load() -> Result<Self> {
        Self::load_from_home(&default_home())
    }

    /// Load configuration from `<home>/config.yaml`, falling back to defaults.
    ///
    /// The `home` field always reflects the directory the file was read from.
    pub fn load_from_home(home: &Path) -> Result<Self> {
        let path = home.join("config.yaml");
        let mut config = if path.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                PackError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_yaml::from_str::<SkillpackConfig>(&content).map_err(|e| {
                PackError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            SkillpackConfig::default()
        };
        config.home = home.to_path_buf();
        Ok(config)
    }

    /// Directory holding the OCI image layout store.
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }

    /// Path to the registry credential file.
    pub fn credentials_path(&self) -> PathBuf {
        self.home.join("auth").join("credentials.json")
    }
}

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS (local test registries)
    pub insecure: bool,

    /// Deadline for a single push or pull in seconds (0 = no deadline)
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout_secs: 300,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Read the packaging epoch from `SOURCE_DATE_EPOCH`.
///
/// Returns `None` when the variable is unset or not a non-negative integer.
pub fn source_date_epoch() -> Option<i64> {
    parse_epoch(std::env::var(SOURCE_DATE_EPOCH_ENV).ok().as_deref())
}

/// Parse a Unix timestamp in seconds.
pub fn parse_epoch(value: Option<&str>) -> Option<i64> {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|secs| *secs >= 0)
}

fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".skillpack"))
        .unwrap_or_else(|| PathBuf::from(".skillpack"))
}
