//! In-memory registry transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use skillpack_core::error::{PackError, Result};

use super::transport::RegistryTransport;
use super::validate::BoundedBuffer;
use crate::oci::digest::Digest;
use crate::oci::image::{media_type_of, Descriptor};
use crate::oci::reference::Reference;

/// A registry held entirely in memory.
///
/// Content is keyed by the digest it is stored under, which is normally
/// the digest of the content itself; the `insert_raw_*` helpers break
/// that on purpose to simulate a misbehaving registry.
#[derive(Default)]
pub struct MemoryRegistry {
    blobs: RwLock<HashMap<Digest, Vec<u8>>>,
    /// digest → (mediaType, bytes)
    manifests: RwLock<HashMap<Digest, (String, Vec<u8>)>>,
    /// `registry/repository:tag` → digest
    tags: RwLock<HashMap<String, Digest>>,
    requests: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transport calls served.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests.read().len()
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    /// Raw bytes stored for a manifest.
    pub fn manifest(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.manifests.read().get(digest).map(|(_, data)| data.clone())
    }

    /// Digest a tag points at.
    pub fn tag_digest(&self, reference: &Reference) -> Option<Digest> {
        let tag = reference.tag.as_ref()?;
        self.tags.read().get(&tag_key(reference, tag)).cloned()
    }

    /// Store a blob under an arbitrary digest.
    pub fn insert_raw_blob(&self, digest: Digest, data: Vec<u8>) {
        self.blobs.write().insert(digest, data);
    }

    /// Store a manifest under an arbitrary digest, tagging it when the
    /// reference has a tag.
    pub fn insert_raw_manifest(&self, reference: &Reference, digest: Digest, media_type: &str, data: Vec<u8>) {
        if let Some(ref tag) = reference.tag {
            self.tags.write().insert(tag_key(reference, tag), digest.clone());
        }
        self.manifests
            .write()
            .insert(digest, (media_type.to_string(), data));
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

fn tag_key(reference: &Reference, tag: &str) -> String {
    format!("{}:{}", reference.repository_name(), tag)
}

#[async_trait]
impl RegistryTransport for MemoryRegistry {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        self.count();
        let digest = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.clone(),
            (None, Some(tag)) => self
                .tags
                .read()
                .get(&tag_key(reference, tag))
                .cloned()
                .ok_or_else(|| PackError::NotFound(format!("manifest {}", reference)))?,
            (None, None) => {
                return Err(PackError::InvalidInput(format!(
                    "Reference '{}' must include a tag or digest",
                    reference
                )))
            }
        };

        let manifests = self.manifests.read();
        let (media_type, data) = manifests
            .get(&digest)
            .ok_or_else(|| PackError::NotFound(format!("manifest {}", reference)))?;
        Ok(Descriptor {
            media_type: media_type.clone(),
            digest,
            size: data.len() as i64,
            platform: None,
            artifact_type: None,
            annotations: Default::default(),
        })
    }

    async fn fetch_manifest(
        &self,
        _reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        self.count();
        let data = self
            .manifests
            .read()
            .get(&descriptor.digest)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| PackError::NotFound(format!("manifest {}", descriptor.digest)))?;
        out.write_bytes(&data)?;
        Ok(())
    }

    async fn fetch_blob(
        &self,
        _reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        self.count();
        let data = self
            .blobs
            .read()
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| PackError::NotFound(format!("blob {}", descriptor.digest)))?;
        out.write_bytes(&data)?;
        Ok(())
    }

    async fn push_blob(&self, _reference: &Reference, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        self.count();
        descriptor.digest.verify(data)?;
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&descriptor.digest) {
            return Err(PackError::AlreadyExists(format!("blob {}", descriptor.digest)));
        }
        blobs.insert(descriptor.digest.clone(), data.to_vec());
        Ok(())
    }

    async fn push_manifest(&self, target: &Reference, media_type: &str, data: &[u8]) -> Result<()> {
        self.count();
        if media_type_of(data)? != media_type {
            return Err(PackError::InvalidInput(format!(
                "manifest for {} does not declare mediaType {}",
                target, media_type
            )));
        }
        let digest = Digest::of(data);
        if let Some(ref expected) = target.digest {
            expected.verify(data)?;
        }
        if let Some(ref tag) = target.tag {
            self.tags.write().insert(tag_key(target, tag), digest.clone());
        }
        self.manifests
            .write()
            .insert(digest, (media_type.to_string(), data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::{ImageIndex, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_LAYER_TAR_GZIP};

    fn reference() -> Reference {
        Reference::parse("registry.test/org/skill:v1").unwrap()
    }

    #[tokio::test]
    async fn test_push_blob_twice_reports_already_exists() {
        let registry = MemoryRegistry::new();
        let desc = Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, b"layer");

        registry.push_blob(&reference(), &desc, b"layer").await.unwrap();
        let err = registry.push_blob(&reference(), &desc, b"layer").await.unwrap_err();
        assert!(matches!(err, PackError::AlreadyExists(_)));
        assert_eq!(registry.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_push_blob_verifies_digest() {
        let registry = MemoryRegistry::new();
        let desc = Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, b"layer");
        assert!(registry.push_blob(&reference(), &desc, b"other").await.is_err());
    }

    #[tokio::test]
    async fn test_push_manifest_and_resolve() {
        let registry = MemoryRegistry::new();
        let data = serde_json::to_vec(&ImageIndex::empty()).unwrap();

        registry
            .push_manifest(&reference(), MEDIA_TYPE_IMAGE_INDEX, &data)
            .await
            .unwrap();
        let desc = registry.resolve(&reference()).await.unwrap();
        assert_eq!(desc.digest, Digest::of(&data));
        assert_eq!(desc.media_type, MEDIA_TYPE_IMAGE_INDEX);
        assert_eq!(desc.size, data.len() as i64);

        let mut out = BoundedBuffer::new(1024);
        registry.fetch_manifest(&reference(), &desc, &mut out).await.unwrap();
        assert_eq!(out.into_inner(), data);
        assert_eq!(registry.request_count(), 3);
    }

    #[tokio::test]
    async fn test_resolve_unknown_tag() {
        let registry = MemoryRegistry::new();
        assert!(registry.resolve(&reference()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_respects_buffer_limit() {
        let registry = MemoryRegistry::new();
        let data = vec![1u8; 64];
        let desc = Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, &data);
        registry.insert_raw_blob(desc.digest.clone(), data);

        let mut out = BoundedBuffer::new(16);
        assert!(registry.fetch_blob(&reference(), &desc, &mut out).await.is_err());
        assert!(out.exceeded());
    }
}
