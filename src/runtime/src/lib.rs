//! Skillpack runtime.
//!
//! Packages skill directories into reproducible OCI artifacts, keeps them in
//! a local OCI image layout and moves them to and from registries.

#![allow(clippy::result_large_err)]

pub mod oci;
pub mod skill;

pub use oci::{
    Digest, LocalStore, PackageOptions, PackageResult, Packager, Platform, PullResult, PushResult,
    Reference, RegistryClient, RegistryLimits,
};
pub use skill::{parse_frontmatter, SkillConfig};

/// Skillpack runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
