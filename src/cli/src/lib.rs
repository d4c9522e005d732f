//! Skillpack CLI - package, push and pull agent skills as OCI artifacts.

pub mod commands;
pub mod output;
