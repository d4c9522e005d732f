//! Skill directory collection and content-layer creation.

use std::path::Path;

use skillpack_core::error::{PackError, Result};

use crate::oci::digest::Digest;
use crate::oci::layers::{compress, create_tar, TarEntry, DEFAULT_FILE_MODE};
use crate::skill::SKILL_FILE;

/// Mode recorded for files with any execute bit set.
const EXECUTABLE_FILE_MODE: u32 = 0o755;

/// A compressed content layer and the digests describing it.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Gzip-compressed tar bytes
    pub data: Vec<u8>,
    /// Digest of the compressed bytes (the layer blob digest)
    pub digest: Digest,
    /// Digest of the uncompressed tar (the config diff_id)
    pub diff_id: Digest,
}

impl LayerInfo {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Collect every regular file under a skill directory.
///
/// Dot-prefixed entries are skipped. Any symlink or non-regular file is
/// rejected. Paths are relative and use forward slashes.
pub fn collect_files(root: &Path) -> Result<Vec<TarEntry>> {
    let mut entries = Vec::new();
    walk_dir(root, "", &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn walk_dir(current: &Path, prefix: &str, entries: &mut Vec<TarEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        PackError::Other(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| PackError::Other(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();

        let name = entry.file_name();
        let name = name.to_str().ok_or_else(|| {
            PackError::InvalidInput(format!("File name is not valid UTF-8: {}", path.display()))
        })?;
        if name.starts_with('.') {
            continue;
        }
        let relative = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            PackError::Other(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            return Err(PackError::PolicyViolation(format!(
                "symlinks not allowed: {}",
                relative
            )));
        } else if file_type.is_dir() {
            walk_dir(&path, &relative, entries)?;
        } else if file_type.is_file() {
            let content = std::fs::read(&path).map_err(|e| {
                PackError::Other(format!("Failed to read {}: {}", path.display(), e))
            })?;
            entries.push(TarEntry::new(relative, content).with_mode(file_mode(&metadata)));
        } else {
            return Err(PackError::PolicyViolation(format!(
                "non-regular files not allowed: {}",
                relative
            )));
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        EXECUTABLE_FILE_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    DEFAULT_FILE_MODE
}

/// Paths as recorded in the `files` label: `SKILL.md` first, then the rest
/// in path order.
pub fn file_list(entries: &[TarEntry]) -> Vec<String> {
    let mut files = Vec::with_capacity(entries.len());
    if entries.iter().any(|e| e.path == SKILL_FILE) {
        files.push(SKILL_FILE.to_string());
    }
    let mut rest: Vec<String> = entries
        .iter()
        .filter(|e| e.path != SKILL_FILE)
        .map(|e| e.path.clone())
        .collect();
    rest.sort();
    files.extend(rest);
    files
}

/// Build the gzip-compressed tar layer for `entries`.
pub fn create_layer(entries: &[TarEntry], epoch: i64) -> Result<LayerInfo> {
    let tar = create_tar(entries, epoch)?;
    let diff_id = Digest::of(&tar);
    let data = compress(&tar, epoch)?;
    let digest = Digest::of(&data);

    tracing::debug!(
        digest = %digest,
        diff_id = %diff_id,
        files = entries.len(),
        size = data.len(),
        "Created content layer"
    );

    Ok(LayerInfo {
        data,
        digest,
        diff_id,
    })
}
