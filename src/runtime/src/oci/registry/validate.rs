//! Validation boundary for content crossing to or from a registry.
//!
//! Every manifest and blob goes through the same checks, in order:
//!
//! 1. the declared size is not negative
//! 2. the declared size is within the ceiling for its kind
//! 3. at most `ceiling + 1` bytes are read and the actual size is within
//!    the ceiling, whatever the descriptor claimed
//! 4. the digest of the bytes read matches the descriptor
//! 5. manifests and indexes respect the fan-out limits

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use skillpack_core::error::{PackError, Result};
use tokio::io::AsyncWrite;

use super::transport::RegistryTransport;
use crate::oci::image::{media_type_of, Descriptor, ImageIndex, ImageManifest, ManifestKind};
use crate::oci::reference::Reference;

/// Ceiling for a single manifest or index: 1 MiB.
pub const DEFAULT_MAX_MANIFEST_SIZE: u64 = 1024 * 1024;
/// Ceiling for a single config or layer blob: 100 MiB.
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 100 * 1024 * 1024;
/// Most platform manifests accepted in one index.
pub const DEFAULT_MAX_INDEX_MANIFESTS: usize = 32;
/// Most layers accepted in one manifest.
pub const DEFAULT_MAX_MANIFEST_LAYERS: usize = 64;

/// Resource limits applied to registry content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    pub max_manifest_size: u64,
    pub max_blob_size: u64,
    pub max_index_manifests: usize,
    pub max_manifest_layers: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_index_manifests: DEFAULT_MAX_INDEX_MANIFESTS,
            max_manifest_layers: DEFAULT_MAX_MANIFEST_LAYERS,
        }
    }
}

/// What a descriptor points at, selecting the ceiling that applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Manifest,
    Blob,
}

impl ContentKind {
    fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Manifest => "manifest",
            ContentKind::Blob => "blob",
        }
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone)]
pub enum ParsedManifest {
    Index(ImageIndex),
    Image(ImageManifest),
}

/// Write sink that refuses to grow past `limit + 1` bytes.
///
/// Transports write fetched content here; once the limit is passed the
/// write fails and [`BoundedBuffer::exceeded`] reports it.
#[derive(Debug)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    limit: u64,
    exceeded: bool,
}

impl BoundedBuffer {
    pub fn new(limit: u64) -> Self {
        Self {
            data: Vec::new(),
            limit,
            exceeded: false,
        }
    }

    /// Append bytes, failing once more than `limit` bytes have been seen.
    pub fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        let room = (self.limit + 1).saturating_sub(self.data.len() as u64);
        if buf.len() as u64 > room {
            self.data.extend_from_slice(&buf[..room as usize]);
        } else {
            self.data.extend_from_slice(buf);
        }
        if self.data.len() as u64 > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("content exceeds {} bytes", self.limit),
            ));
        }
        Ok(())
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Most bytes this buffer accepts.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl AsyncWrite for BoundedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Poll::Ready(this.write_bytes(buf).map(|_| buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Applies [`RegistryLimits`] to descriptors and content.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: RegistryLimits,
}

impl Validator {
    pub fn new(limits: RegistryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    fn ceiling(&self, kind: ContentKind) -> u64 {
        match kind {
            ContentKind::Manifest => self.limits.max_manifest_size,
            ContentKind::Blob => self.limits.max_blob_size,
        }
    }

    /// Check a descriptor before any content is read. Returns the ceiling.
    pub fn check_descriptor(&self, descriptor: &Descriptor, kind: ContentKind) -> Result<u64> {
        if descriptor.size < 0 {
            return Err(PackError::InvalidInput(format!(
                "{} {} declares negative size {}",
                kind.as_str(),
                descriptor.digest,
                descriptor.size
            )));
        }
        let ceiling = self.ceiling(kind);
        if descriptor.size as u64 > ceiling {
            return Err(PackError::SizeLimitExceeded {
                what: format!("{} {}", kind.as_str(), descriptor.digest),
                size: descriptor.size as u64,
                limit: ceiling,
            });
        }
        Ok(ceiling)
    }

    /// Check content read for `descriptor`.
    ///
    /// Manifests are parsed and returned so callers can walk them.
    pub fn check_content(
        &self,
        descriptor: &Descriptor,
        data: &[u8],
        kind: ContentKind,
    ) -> Result<Option<ParsedManifest>> {
        let ceiling = self.check_descriptor(descriptor, kind)?;
        if data.len() as u64 > ceiling {
            return Err(PackError::SizeLimitExceeded {
                what: format!("{} {}", kind.as_str(), descriptor.digest),
                size: data.len() as u64,
                limit: ceiling,
            });
        }

        descriptor.digest.verify(data)?;

        if data.len() as u64 != descriptor.size as u64 {
            return Err(PackError::PolicyViolation(format!(
                "{} {} is {} bytes but its descriptor declares {}",
                kind.as_str(),
                descriptor.digest,
                data.len(),
                descriptor.size
            )));
        }

        match kind {
            ContentKind::Manifest => self.check_structure(descriptor, data).map(Some),
            ContentKind::Blob => Ok(None),
        }
    }

    /// Parse a manifest or index and enforce the fan-out limits.
    pub fn check_structure(&self, descriptor: &Descriptor, data: &[u8]) -> Result<ParsedManifest> {
        let media_type = media_type_of(data)?;
        if media_type != descriptor.media_type {
            return Err(PackError::InvalidInput(format!(
                "manifest {} has mediaType {} but its descriptor declares {}",
                descriptor.digest, media_type, descriptor.media_type
            )));
        }

        match ManifestKind::from_media_type(&media_type) {
            Some(ManifestKind::Index) => {
                let index: ImageIndex = serde_json::from_slice(data)?;
                if index.manifests.len() > self.limits.max_index_manifests {
                    return Err(PackError::PolicyViolation(format!(
                        "index {} references {} manifests (limit {})",
                        descriptor.digest,
                        index.manifests.len(),
                        self.limits.max_index_manifests
                    )));
                }
                Ok(ParsedManifest::Index(index))
            }
            Some(ManifestKind::Manifest) => {
                let manifest: ImageManifest = serde_json::from_slice(data)?;
                if manifest.layers.len() > self.limits.max_manifest_layers {
                    return Err(PackError::PolicyViolation(format!(
                        "manifest {} has {} layers (limit {})",
                        descriptor.digest,
                        manifest.layers.len(),
                        self.limits.max_manifest_layers
                    )));
                }
                Ok(ParsedManifest::Image(manifest))
            }
            None => Err(PackError::InvalidInput(format!(
                "Unsupported manifest media type {} for {}",
                media_type, descriptor.digest
            ))),
        }
    }

    /// Fetch content through `transport`, reading at most `ceiling + 1` bytes.
    pub async fn fetch(
        &self,
        transport: &dyn RegistryTransport,
        reference: &Reference,
        descriptor: &Descriptor,
        kind: ContentKind,
    ) -> Result<(Vec<u8>, Option<ParsedManifest>)> {
        let ceiling = self.check_descriptor(descriptor, kind)?;

        let mut buffer = BoundedBuffer::new(ceiling);
        let result = match kind {
            ContentKind::Manifest => {
                transport
                    .fetch_manifest(reference, descriptor, &mut buffer)
                    .await
            }
            ContentKind::Blob => transport.fetch_blob(reference, descriptor, &mut buffer).await,
        };
        if buffer.exceeded() {
            tracing::warn!(
                digest = %descriptor.digest,
                declared = descriptor.size,
                limit = ceiling,
                "Rejected oversized content from registry"
            );
            return Err(PackError::SizeLimitExceeded {
                what: format!("{} {}", kind.as_str(), descriptor.digest),
                size: buffer.len() as u64,
                limit: ceiling,
            });
        }
        result?;

        let data = buffer.into_inner();
        let parsed = self.check_content(descriptor, &data, kind).map_err(|e| {
            tracing::warn!(digest = %descriptor.digest, error = %e, "Rejected content from registry");
            e
        })?;
        Ok((data, parsed))
    }
}
