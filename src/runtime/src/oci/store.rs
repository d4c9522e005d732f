//! Digest-addressed content store backed by an OCI image layout.
//!
//! ```text
//! store/
//! ├── oci-layout            (layout marker)
//! ├── index.json            (tag index: one descriptor per tag)
//! └── blobs/
//!     └── sha256/
//!         └── <hex>         (layers, configs, manifests, indexes)
//! ```
//!
//! Blobs and manifests are immutable and written through a temp file that
//! is persisted without clobbering, so concurrent writers of the same
//! content converge on one file. Tags live in `index.json` as descriptors
//! annotated with `org.opencontainers.image.ref.name`.
//!
//! Tag updates are read-modify-write cycles on `index.json`, serialized
//! across handles and processes by an advisory lock on `index.json.lock`.
//! Reads always go to disk, so every handle sees the latest committed tags.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use skillpack_core::error::{PackError, Result};

use super::digest::Digest;
use super::image::{
    media_type_of, Descriptor, ImageIndex, ImageManifest, ManifestKind, OciLayout,
    ANNOTATION_REF_NAME, IMAGE_LAYOUT_VERSION,
};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const INDEX_LOCK_FILE: &str = "index.json.lock";
const BLOBS_DIR: &str = "blobs";

/// How long a tag update waits for another writer before giving up.
const INDEX_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const INDEX_LOCK_POLL: Duration = Duration::from_millis(50);

/// Local content store in OCI image layout format.
pub struct LocalStore {
    /// Root directory of the image layout
    root: PathBuf,
    /// Manifest media types seen by this process: digest → mediaType
    media_types: RwLock<HashMap<Digest, String>>,
}

impl LocalStore {
    /// Open the layout at `root`, creating it if it does not exist.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join(BLOBS_DIR).join("sha256")).map_err(|e| {
            PackError::Other(format!(
                "Failed to create store directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let layout_path = root.join(OCI_LAYOUT_FILE);
        if layout_path.is_file() {
            let data = std::fs::read(&layout_path)?;
            let layout: OciLayout = serde_json::from_slice(&data).map_err(|e| {
                PackError::InvalidInput(format!(
                    "Invalid {}: {}",
                    layout_path.display(),
                    e
                ))
            })?;
            if layout.image_layout_version != IMAGE_LAYOUT_VERSION {
                return Err(PackError::InvalidInput(format!(
                    "Unsupported image layout version {} in {}",
                    layout.image_layout_version,
                    root.display()
                )));
            }
        } else {
            write_atomic(root, &layout_path, &serde_json::to_vec(&OciLayout::default())?)?;
        }

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.is_file() {
            read_index(&index_path)?
        } else {
            let _lock = IndexLock::acquire(root)?;
            if index_path.is_file() {
                read_index(&index_path)?
            } else {
                let index = ImageIndex::empty();
                write_atomic(root, &index_path, &serde_json::to_vec_pretty(&index)?)?;
                index
            }
        };

        tracing::debug!(
            root = %root.display(),
            tags = index.manifests.len(),
            "Opened content store"
        );

        Ok(Self {
            root: root.to_path_buf(),
            media_types: RwLock::new(HashMap::new()),
        })
    }

    /// Get the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the layout marker is still present on disk.
    pub fn is_initialized(&self) -> bool {
        self.root.join(OCI_LAYOUT_FILE).is_file()
    }

    /// Store a blob, returning its digest. Storing existing content is a no-op.
    pub fn put_blob(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let path = self.blob_path(&digest);
        if path.is_file() {
            return Ok(digest);
        }

        let dir = path
            .parent()
            .ok_or_else(|| PackError::Other(format!("Invalid blob path {}", path.display())))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                tracing::debug!(digest = %digest, size = data.len(), "Wrote blob");
            }
            // Another writer stored the same content first.
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(PackError::Other(format!(
                    "Failed to persist blob {}: {}",
                    digest, e.error
                )))
            }
        }

        Ok(digest)
    }

    /// Read a blob by digest.
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PackError::NotFound(format!("blob {}", digest))
            } else {
                PackError::IoError(e)
            }
        })
    }

    /// Whether a blob or manifest with this digest is stored.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Size in bytes of a stored blob.
    pub fn blob_size(&self, digest: &Digest) -> Result<u64> {
        std::fs::metadata(self.blob_path(digest))
            .map(|m| m.len())
            .map_err(|_| PackError::NotFound(format!("blob {}", digest)))
    }

    /// Store a manifest or index document, recording its media type.
    pub fn put_manifest(&self, data: &[u8]) -> Result<Digest> {
        let media_type = media_type_of(data)?;
        let digest = self.put_blob(data)?;
        self.media_types.write().insert(digest.clone(), media_type);
        Ok(digest)
    }

    /// Read a manifest or index document by digest.
    pub fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        let data = self
            .get_blob(digest)
            .map_err(|e| match e {
                PackError::NotFound(_) => PackError::NotFound(format!("manifest {}", digest)),
                other => other,
            })?;
        let media_type = media_type_of(&data)?;
        self.media_types.write().insert(digest.clone(), media_type);
        Ok(data)
    }

    /// Media type of a stored manifest or index.
    pub fn manifest_media_type(&self, digest: &Digest) -> Result<String> {
        if let Some(media_type) = self.media_types.read().get(digest) {
            return Ok(media_type.clone());
        }
        let data = self.get_manifest(digest)?;
        media_type_of(&data)
    }

    /// Whether the digest names an image index.
    pub fn is_index(&self, digest: &Digest) -> Result<bool> {
        let media_type = self.manifest_media_type(digest)?;
        Ok(ManifestKind::from_media_type(&media_type) == Some(ManifestKind::Index))
    }

    /// Read and parse an image index.
    pub fn get_index(&self, digest: &Digest) -> Result<ImageIndex> {
        let data = self.get_manifest(digest)?;
        let index: ImageIndex = serde_json::from_slice(&data)?;
        if ManifestKind::from_media_type(&index.media_type) != Some(ManifestKind::Index) {
            return Err(PackError::InvalidInput(format!(
                "{} is not an image index (mediaType {})",
                digest, index.media_type
            )));
        }
        Ok(index)
    }

    /// Read and parse a single-platform image manifest.
    pub fn get_image_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        let data = self.get_manifest(digest)?;
        let manifest: ImageManifest = serde_json::from_slice(&data)?;
        if ManifestKind::from_media_type(&manifest.media_type) != Some(ManifestKind::Manifest) {
            return Err(PackError::InvalidInput(format!(
                "{} is not an image manifest (mediaType {})",
                digest, manifest.media_type
            )));
        }
        Ok(manifest)
    }

    /// Descriptor for a stored manifest or index.
    pub fn descriptor(&self, digest: &Digest) -> Result<Descriptor> {
        let media_type = self.manifest_media_type(digest)?;
        let size = self.blob_size(digest)?;
        Ok(Descriptor {
            media_type,
            digest: digest.clone(),
            size: size as i64,
            platform: None,
            artifact_type: None,
            annotations: Default::default(),
        })
    }

    /// Point `reference` at a stored manifest or index, replacing any
    /// previous mapping for that reference.
    pub fn tag(&self, digest: &Digest, reference: &str) -> Result<()> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PackError::InvalidInput("Empty tag reference".to_string()));
        }
        if !self.exists(digest) {
            return Err(PackError::NotFound(format!(
                "cannot tag {}: manifest {} not in store",
                reference, digest
            )));
        }

        let mut descriptor = self.descriptor(digest)?;
        descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());

        let _lock = IndexLock::acquire(&self.root)?;
        let mut index = self.load_index()?;
        index
            .manifests
            .retain(|d| d.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) != Some(reference));
        index.manifests.push(descriptor);
        index.manifests.sort_by(|a, b| {
            a.annotations
                .get(ANNOTATION_REF_NAME)
                .cmp(&b.annotations.get(ANNOTATION_REF_NAME))
        });
        self.save_index(&index)?;

        tracing::debug!(reference, digest = %digest, "Tagged manifest");
        Ok(())
    }

    /// Remove a tag. The tagged content itself is left in place.
    pub fn untag(&self, reference: &str) -> Result<()> {
        let _lock = IndexLock::acquire(&self.root)?;
        let mut index = self.load_index()?;
        let before = index.manifests.len();
        index
            .manifests
            .retain(|d| d.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) != Some(reference));
        if index.manifests.len() == before {
            return Err(PackError::NotFound(format!("tag {}", reference)));
        }
        self.save_index(&index)
    }

    /// Resolve a tag to the digest it points at.
    pub fn resolve(&self, reference: &str) -> Result<Digest> {
        self.load_index()?
            .manifests
            .into_iter()
            .find(|d| d.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) == Some(reference))
            .map(|d| d.digest)
            .ok_or_else(|| PackError::NotFound(format!("tag {}", reference)))
    }

    /// List all tags, sorted.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .load_index()?
            .manifests
            .into_iter()
            .filter_map(|mut d| d.annotations.remove(ANNOTATION_REF_NAME))
            .collect();
        tags.sort();
        Ok(tags)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(BLOBS_DIR)
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    fn load_index(&self) -> Result<ImageIndex> {
        read_index(&self.root.join(INDEX_FILE))
    }

    /// Callers must hold the [`IndexLock`].
    fn save_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.root, &self.root.join(INDEX_FILE), &data)
    }
}

fn read_index(path: &Path) -> Result<ImageIndex> {
    let data = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PackError::NotFound(format!("{} (store not initialized)", path.display()))
        } else {
            PackError::IoError(e)
        }
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| PackError::InvalidInput(format!("Invalid {}: {}", path.display(), e)))
}

/// Exclusive advisory lock on the tag index, released on drop.
///
/// Each acquisition opens its own file description, so two handles in the
/// same process exclude each other just like two processes do.
struct IndexLock {
    file: File,
}

impl IndexLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(INDEX_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            match try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= INDEX_LOCK_TIMEOUT {
                        return Err(PackError::TimeoutError(format!(
                            "Timed out after {:?} waiting for {}",
                            INDEX_LOCK_TIMEOUT,
                            path.display()
                        )));
                    }
                    if !warned {
                        tracing::warn!(path = %path.display(), "Tag index is locked by another writer, waiting");
                        warned = true;
                    }
                    std::thread::sleep(INDEX_LOCK_POLL);
                }
                Err(e) => return Err(PackError::IoError(e)),
            }
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor stays open for the lifetime of `file`.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above. Closing the file would release the lock anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// No advisory locking off unix.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

/// Write `data` to `path` via a temp file in `dir` and a rename.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        PackError::Other(format!("Failed to write {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
