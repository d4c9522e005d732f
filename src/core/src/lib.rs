//! Skillpack Core - Foundational Types
//!
//! This crate provides the error type and configuration shared by the
//! skillpack runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{source_date_epoch, LogLevel, RegistryConfig, SkillpackConfig};
pub use error::{ErrorKind, PackError, Result};

/// Skillpack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
