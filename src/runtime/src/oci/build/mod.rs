//! Skill packaging.
//!
//! Turns a skill directory into a multi-platform OCI artifact:
//!
//! ```text
//! index ─┬─ manifest (linux/amd64) ─┬─ config
//!        │                          └─ layer ─┐
//!        └─ manifest (linux/arm64) ─┬─ config │ (shared)
//!                                   └─ layer ─┘
//! ```

pub mod engine;
pub mod layer;

pub use engine::{PackageOptions, PackageResult, Packager, HISTORY_CREATED_BY};
pub use layer::{collect_files, create_layer, LayerInfo};
