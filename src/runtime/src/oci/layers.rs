//! Deterministic tar + gzip layer codec.
//!
//! Packing produces byte-identical output for identical `(path, content,
//! mode, epoch)` sets regardless of insertion order. Unpacking treats the
//! archive as untrusted: traversal paths, links, special files, oversized
//! entries and decompression bombs are all rejected.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use skillpack_core::error::{PackError, Result};
use tar::{Archive, EntryType, Header};

/// Default per-file ceiling when extracting a tar archive: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default ceiling on decompressed layer size: 100 MiB.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: u64 = 100 * 1024 * 1024;

/// File mode used when an entry does not override it.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// gzip OS byte meaning "unknown".
const GZIP_OS_UNKNOWN: u8 = 255;

/// A regular file inside a layer archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Relative, forward-slash path
    pub path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

impl TarEntry {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: DEFAULT_FILE_MODE,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Resource limits applied while unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TarLimits {
    /// Largest single file accepted
    pub max_file_size: u64,
    /// Largest decompressed stream accepted
    pub max_decompressed_size: u64,
}

impl Default for TarLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

/// Build a tar archive from `entries`, sorted by path.
///
/// Every header carries uid/gid 0, empty owner names and `mtime = epoch`.
/// Duplicate or unsafe paths are rejected.
pub fn create_tar(entries: &[TarEntry], epoch: i64) -> Result<Vec<u8>> {
    let mut sorted: Vec<&TarEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    for pair in sorted.windows(2) {
        if pair[0].path == pair[1].path {
            return Err(PackError::InvalidInput(format!(
                "Duplicate archive path: {}",
                pair[0].path
            )));
        }
    }

    let mtime = epoch.max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    for entry in sorted {
        let path = clean_relative_path(Path::new(&entry.path)).ok_or_else(|| {
            PackError::PolicyViolation(format!("Unsafe archive path: {}", entry.path))
        })?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.content.len() as u64);
        header.set_mode(entry.mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(mtime);
        header.set_username("")?;
        header.set_groupname("")?;

        builder
            .append_data(&mut header, &path, entry.content.as_slice())
            .map_err(|e| {
                PackError::Other(format!("Failed to add {} to archive: {}", path, e))
            })?;
    }

    builder
        .into_inner()
        .map_err(|e| PackError::Other(format!("Failed to finalize archive: {}", e)))
}

/// Read every regular file from a tar archive.
///
/// Directory entries are traversed but not returned.
pub fn extract_tar(data: &[u8], limits: &TarLimits) -> Result<Vec<TarEntry>> {
    let mut archive = Archive::new(data);
    let mut files = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| PackError::InvalidInput(format!("Invalid tar archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| PackError::InvalidInput(format!("Invalid tar entry: {}", e)))?;

        let raw_path = entry
            .path()
            .map_err(|e| PackError::InvalidInput(format!("Invalid tar entry path: {}", e)))?
            .into_owned();
        let path = clean_relative_path(&raw_path).ok_or_else(|| {
            PackError::PolicyViolation(format!(
                "Path traversal in archive entry: {}",
                raw_path.display()
            ))
        })?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() {
            return Err(PackError::PolicyViolation(format!(
                "symlinks not allowed in archive: {}",
                path
            )));
        }
        if entry_type.is_hard_link() {
            return Err(PackError::PolicyViolation(format!(
                "hardlinks not allowed in archive: {}",
                path
            )));
        }
        if entry_type.is_dir() {
            continue;
        }
        if !(entry_type.is_file() || entry_type == EntryType::Continuous) {
            return Err(PackError::PolicyViolation(format!(
                "Unsupported entry type {:?} in archive: {}",
                entry_type, path
            )));
        }
        if path.is_empty() {
            return Err(PackError::InvalidInput(
                "Archive entry has an empty path".to_string(),
            ));
        }

        let declared = entry
            .header()
            .size()
            .map_err(|e| PackError::InvalidInput(format!("Invalid size for {}: {}", path, e)))?;
        if declared > limits.max_file_size {
            return Err(PackError::SizeLimitExceeded {
                what: format!("archive entry {}", path),
                size: declared,
                limit: limits.max_file_size,
            });
        }

        let mut content = Vec::new();
        (&mut entry)
            .take(limits.max_file_size + 1)
            .read_to_end(&mut content)?;
        if content.len() as u64 > limits.max_file_size {
            return Err(PackError::SizeLimitExceeded {
                what: format!("archive entry {}", path),
                size: content.len() as u64,
                limit: limits.max_file_size,
            });
        }

        let mode = entry.header().mode().unwrap_or(DEFAULT_FILE_MODE);
        files.push(TarEntry {
            path,
            content,
            mode,
        });
    }

    Ok(files)
}

/// Gzip-compress `data` with a fixed header.
///
/// The header carries `mtime = epoch`, no file name, no comment and OS byte
/// 255, so output depends only on the input bytes and the epoch. The
/// epoch must fit the header's 32-bit mtime field.
pub fn compress(data: &[u8], epoch: i64) -> Result<Vec<u8>> {
    let mtime = u32::try_from(epoch).map_err(|_| {
        PackError::InvalidInput(format!(
            "Epoch {} does not fit the gzip mtime field (0..={})",
            epoch,
            u32::MAX
        ))
    })?;
    let mut encoder = GzBuilder::new()
        .mtime(mtime)
        .operating_system(GZIP_OS_UNKNOWN)
        .write(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress gzip `data`, failing once the output exceeds `max_size`.
pub fn decompress(data: &[u8], max_size: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(max_size + 1)
        .read_to_end(&mut out)
        .map_err(|e| PackError::InvalidInput(format!("Invalid gzip stream: {}", e)))?;

    if out.len() as u64 > max_size {
        return Err(PackError::SizeLimitExceeded {
            what: "decompressed layer".to_string(),
            size: out.len() as u64,
            limit: max_size,
        });
    }
    Ok(out)
}

/// Unpack a gzip-compressed tar layer into `target_dir`.
///
/// Returns the relative paths written, in archive order.
pub fn unpack_layer(layer: &[u8], target_dir: &Path, limits: &TarLimits) -> Result<Vec<String>> {
    let tar_bytes = decompress(layer, limits.max_decompressed_size)?;
    let files = extract_tar(&tar_bytes, limits)?;

    std::fs::create_dir_all(target_dir).map_err(|e| {
        PackError::Other(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;
    let root = target_dir.canonicalize()?;

    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let dest = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
            // A pre-existing symlinked directory could redirect the write.
            if !parent.canonicalize()?.starts_with(&root) {
                return Err(PackError::PolicyViolation(format!(
                    "Refusing to write outside {}: {}",
                    root.display(),
                    file.path
                )));
            }
        }
        if std::fs::symlink_metadata(&dest)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            return Err(PackError::PolicyViolation(format!(
                "symlinks not allowed at destination: {}",
                dest.display()
            )));
        }

        std::fs::write(&dest, &file.content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(file.mode & 0o777))?;
        }
        written.push(file.path);
    }

    tracing::debug!(
        target = %target_dir.display(),
        files = written.len(),
        "Unpacked layer"
    );

    Ok(written)
}

/// Lexically clean a relative path into forward-slash form.
///
/// Returns `None` when the path is absolute or climbs above its root.
pub(crate) fn clean_relative_path(path: &Path) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

/// Whether `path` contains a `..` component after lexical cleaning.
pub(crate) fn has_traversal(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    false
}

/// Build a path buffer from a cleaned forward-slash path.
pub(crate) fn to_native_path(path: &str) -> PathBuf {
    path.split('/').collect()
}
