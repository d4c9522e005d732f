//! Registry transfer for skill artifacts.
//!
//! [`RegistryClient`] copies an artifact graph between a [`LocalStore`] and a
//! remote repository. Remote content is untrusted: everything read from the
//! transport passes through the [`Validator`] before it is accepted, and the
//! same checks run over local content before it is pushed.
//!
//! A pull stages the whole graph in memory and only writes to the store once
//! every manifest and blob has been validated, so a rejected pull leaves the
//! store exactly as it was.

mod memory;
mod transport;
mod validate;

pub use memory::MemoryRegistry;
pub use transport::{
    DistributionTransport, RegistryAuth, RegistryTransport, REGISTRY_PASSWORD_ENV,
    REGISTRY_USERNAME_ENV,
};
pub use validate::{
    BoundedBuffer, ContentKind, ParsedManifest, RegistryLimits, Validator,
    DEFAULT_MAX_BLOB_SIZE, DEFAULT_MAX_INDEX_MANIFESTS, DEFAULT_MAX_MANIFEST_LAYERS,
    DEFAULT_MAX_MANIFEST_SIZE,
};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use skillpack_core::error::{PackError, Result};

use super::digest::Digest;
use super::image::{Descriptor, ImageManifest, ManifestKind};
use super::reference::Reference;
use super::store::LocalStore;

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// Digest of the root manifest or index pushed
    pub digest: Digest,
    /// Target reference, pinned to the pushed digest
    pub reference: Reference,
}

/// Outcome of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Digest of the root manifest or index pulled
    pub digest: Digest,
    /// Reference as requested
    pub reference: Reference,
    /// Media type of the root
    pub media_type: String,
    /// Platform manifests pulled; the root itself for a single manifest
    pub manifests: Vec<Digest>,
}

/// Content staged for upload or ingestion, in dependency order.
#[derive(Default)]
struct StagedGraph {
    blobs: Vec<(Descriptor, Vec<u8>)>,
    manifests: Vec<(Descriptor, Vec<u8>)>,
    seen: HashSet<Digest>,
}

impl StagedGraph {
    /// Record a blob, returning false if it is already staged.
    fn add_blob(&mut self, descriptor: &Descriptor, data: Vec<u8>) -> bool {
        if !self.seen.insert(descriptor.digest.clone()) {
            return false;
        }
        self.blobs.push((descriptor.clone(), data));
        true
    }

    fn needs_blob(&self, digest: &Digest) -> bool {
        !self.seen.contains(digest)
    }
}

/// Client moving skill artifacts to and from a registry.
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    validator: Validator,
    timeout: Option<Duration>,
}

impl RegistryClient {
    /// Create a client over `transport` with default limits and no deadline.
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            transport,
            validator: Validator::default(),
            timeout: None,
        }
    }

    /// Replace the resource limits.
    pub fn with_limits(mut self, limits: RegistryLimits) -> Self {
        self.validator = Validator::new(limits);
        self
    }

    /// Abort push and pull operations that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn limits(&self) -> &RegistryLimits {
        self.validator.limits()
    }

    /// Push the artifact stored under `digest` to `reference`.
    ///
    /// The reference must carry a tag or digest. If it carries a digest, it
    /// must be the digest being pushed.
    pub async fn push(&self, store: &LocalStore, digest: &Digest, reference: &str) -> Result<PushResult> {
        let reference = Reference::parse(reference)?;
        reference.require_tag_or_digest()?;
        if let Some(ref pinned) = reference.digest {
            if pinned != digest {
                return Err(PackError::InvalidInput(format!(
                    "Reference '{}' pins {} but the artifact is {}",
                    reference, pinned, digest
                )));
            }
        }

        self.with_deadline("push", &reference, self.push_graph(store, digest, &reference))
            .await
    }

    async fn push_graph(&self, store: &LocalStore, digest: &Digest, reference: &Reference) -> Result<PushResult> {
        let root = store.descriptor(digest)?;
        let root_data = store.get_manifest(digest)?;
        let graph = self.stage_local(store, &root, &root_data)?;

        let mut uploaded = 0usize;
        for (descriptor, data) in &graph.blobs {
            match self.transport.push_blob(reference, descriptor, data).await {
                Ok(()) => {
                    uploaded += 1;
                    tracing::debug!(digest = %descriptor.digest, size = data.len(), "Pushed blob");
                }
                Err(PackError::AlreadyExists(_)) => {
                    tracing::debug!(digest = %descriptor.digest, "Blob already present in registry");
                }
                Err(e) => return Err(e),
            }
        }

        for (descriptor, data) in &graph.manifests {
            let target = reference.at_digest(descriptor.digest.clone());
            self.transport
                .push_manifest(&target, &descriptor.media_type, data)
                .await?;
            tracing::debug!(digest = %descriptor.digest, "Pushed manifest");
        }

        let target = match reference.tag {
            Some(_) => Reference {
                digest: None,
                ..reference.clone()
            },
            None => reference.at_digest(digest.clone()),
        };
        self.transport
            .push_manifest(&target, &root.media_type, &root_data)
            .await?;

        tracing::info!(
            reference = %reference,
            digest = %digest,
            blobs = graph.blobs.len(),
            uploaded,
            "Pushed skill artifact"
        );
        Ok(PushResult {
            digest: digest.clone(),
            reference: reference.with_digest(digest.clone()),
        })
    }

    /// Validate and collect the local graph rooted at `root`.
    fn stage_local(&self, store: &LocalStore, root: &Descriptor, root_data: &[u8]) -> Result<StagedGraph> {
        let mut graph = StagedGraph::default();
        match self.validator.check_content(root, root_data, ContentKind::Manifest)? {
            Some(ParsedManifest::Index(index)) => {
                for child in &index.manifests {
                    let data = store.get_manifest(&child.digest)?;
                    let manifest = match self.validator.check_content(child, &data, ContentKind::Manifest)? {
                        Some(ParsedManifest::Image(manifest)) => manifest,
                        _ => return Err(nested_index(&root.digest, &child.digest)),
                    };
                    self.stage_local_blobs(store, &manifest, &mut graph)?;
                    graph.manifests.push((child.clone(), data));
                }
            }
            Some(ParsedManifest::Image(manifest)) => self.stage_local_blobs(store, &manifest, &mut graph)?,
            None => {
                return Err(PackError::InvalidInput(format!(
                    "{} is not a manifest",
                    root.digest
                )))
            }
        }
        Ok(graph)
    }

    fn stage_local_blobs(&self, store: &LocalStore, manifest: &ImageManifest, graph: &mut StagedGraph) -> Result<()> {
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if !graph.needs_blob(&descriptor.digest) {
                continue;
            }
            let data = store.get_blob(&descriptor.digest)?;
            self.validator.check_content(descriptor, &data, ContentKind::Blob)?;
            graph.add_blob(descriptor, data);
        }
        Ok(())
    }

    /// Pull `reference` into `store`.
    ///
    /// On success the root is tagged both under the reference's tag (or
    /// digest) and under the full canonical reference.
    pub async fn pull(&self, store: &LocalStore, reference: &str) -> Result<PullResult> {
        let reference = Reference::parse(reference)?;
        reference.require_tag_or_digest()?;

        self.with_deadline("pull", &reference, self.pull_graph(store, &reference))
            .await
    }

    async fn pull_graph(&self, store: &LocalStore, reference: &Reference) -> Result<PullResult> {
        let root = self.transport.resolve(reference).await?;
        if let Some(ref pinned) = reference.digest {
            if *pinned != root.digest {
                return Err(PackError::DigestMismatch {
                    expected: pinned.to_string(),
                    actual: root.digest.to_string(),
                });
            }
        }

        let (root_data, parsed) = self
            .validator
            .fetch(self.transport.as_ref(), reference, &root, ContentKind::Manifest)
            .await?;

        let mut graph = StagedGraph::default();
        let manifests = match parsed {
            Some(ParsedManifest::Index(index)) => {
                let mut children = Vec::with_capacity(index.manifests.len());
                for child in &index.manifests {
                    if ManifestKind::from_media_type(&child.media_type) != Some(ManifestKind::Manifest) {
                        return Err(nested_index(&root.digest, &child.digest));
                    }
                    let (data, parsed) = self
                        .validator
                        .fetch(self.transport.as_ref(), reference, child, ContentKind::Manifest)
                        .await?;
                    let manifest = match parsed {
                        Some(ParsedManifest::Image(manifest)) => manifest,
                        _ => return Err(nested_index(&root.digest, &child.digest)),
                    };
                    self.stage_remote_blobs(reference, &manifest, &mut graph).await?;
                    graph.manifests.push((child.clone(), data));
                    children.push(child.digest.clone());
                }
                children
            }
            Some(ParsedManifest::Image(manifest)) => {
                self.stage_remote_blobs(reference, &manifest, &mut graph).await?;
                vec![root.digest.clone()]
            }
            None => {
                return Err(PackError::InvalidInput(format!(
                    "{} did not resolve to a manifest",
                    reference
                )))
            }
        };

        // Everything is validated; only now does the store change.
        for (_, data) in &graph.blobs {
            store.put_blob(data)?;
        }
        for (_, data) in &graph.manifests {
            store.put_manifest(data)?;
        }
        let digest = store.put_manifest(&root_data)?;

        if let Some(short) = reference.tag_or_digest() {
            store.tag(&digest, &short)?;
        }
        store.tag(&digest, &reference.full_reference())?;

        tracing::info!(
            reference = %reference,
            digest = %digest,
            manifests = manifests.len(),
            blobs = graph.blobs.len(),
            "Pulled skill artifact"
        );
        Ok(PullResult {
            digest,
            reference: reference.clone(),
            media_type: root.media_type,
            manifests,
        })
    }

    async fn stage_remote_blobs(
        &self,
        reference: &Reference,
        manifest: &ImageManifest,
        graph: &mut StagedGraph,
    ) -> Result<()> {
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if !graph.needs_blob(&descriptor.digest) {
                continue;
            }
            let (data, _) = self
                .validator
                .fetch(self.transport.as_ref(), reference, descriptor, ContentKind::Blob)
                .await?;
            tracing::debug!(digest = %descriptor.digest, size = data.len(), "Fetched blob");
            graph.add_blob(descriptor, data);
        }
        Ok(())
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        reference: &Reference,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                PackError::TimeoutError(format!(
                    "{} {} did not finish within {:?}",
                    operation, reference, limit
                ))
            })?,
            None => fut.await,
        }
    }
}

fn nested_index(root: &Digest, child: &Digest) -> PackError {
    PackError::PolicyViolation(format!(
        "index {} references {} which is not a platform manifest",
        root, child
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::build::{PackageOptions, Packager};
    use crate::oci::image::Platform;
    use tempfile::TempDir;

    fn package(dir: &TempDir) -> (Arc<LocalStore>, Digest) {
        let skill = dir.path().join("skill");
        std::fs::create_dir_all(&skill).unwrap();
        std::fs::write(
            skill.join("SKILL.md"),
            "---\nname: lint\ndescription: Lints things\n---\nBody\n",
        )
        .unwrap();

        let store = Arc::new(LocalStore::open(&dir.path().join("store")).unwrap());
        let packager = Packager::new(store.clone()).unwrap();
        let result = packager
            .package(
                &skill,
                &PackageOptions::default()
                    .with_epoch(0)
                    .with_platforms(vec![Platform::new("linux", "amd64")]),
            )
            .unwrap();
        (store, result.index_digest)
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let dir = TempDir::new().unwrap();
        let (store, digest) = package(&dir);
        let registry = Arc::new(MemoryRegistry::new());
        let client = RegistryClient::new(registry.clone());

        let pushed = client.push(&store, &digest, "registry.test/org/lint:v1").await.unwrap();
        assert_eq!(pushed.digest, digest);
        assert_eq!(pushed.reference.digest, Some(digest.clone()));
        assert_eq!(registry.blob_count(), 2);

        let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
        let pulled = client.pull(&fresh, "registry.test/org/lint:v1").await.unwrap();
        assert_eq!(pulled.digest, digest);
        assert_eq!(pulled.manifests.len(), 1);
        assert_eq!(fresh.resolve("v1").unwrap(), digest);
        assert_eq!(fresh.resolve("registry.test/org/lint:v1").unwrap(), digest);
    }

    #[tokio::test]
    async fn test_push_twice_dedupes_blobs() {
        let dir = TempDir::new().unwrap();
        let (store, digest) = package(&dir);
        let registry = Arc::new(MemoryRegistry::new());
        let client = RegistryClient::new(registry.clone());

        client.push(&store, &digest, "registry.test/org/lint:v1").await.unwrap();
        client.push(&store, &digest, "registry.test/org/lint:v2").await.unwrap();
        assert_eq!(registry.blob_count(), 2);
    }

    #[tokio::test]
    async fn test_push_rejects_mismatched_digest_reference() {
        let dir = TempDir::new().unwrap();
        let (store, digest) = package(&dir);
        let registry = Arc::new(MemoryRegistry::new());
        let client = RegistryClient::new(registry.clone());

        let other = Digest::of(b"other");
        let err = client
            .push(&store, &digest, &format!("registry.test/org/lint@{}", other))
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));
        assert_eq!(registry.request_count(), 0);
    }

    #[tokio::test]
    async fn test_push_by_digest() {
        let dir = TempDir::new().unwrap();
        let (store, digest) = package(&dir);
        let registry = Arc::new(MemoryRegistry::new());
        let client = RegistryClient::new(registry.clone());

        let reference = format!("registry.test/org/lint@{}", digest);
        client.push(&store, &digest, &reference).await.unwrap();
        assert!(registry.manifest(&digest).is_some());
    }

    #[tokio::test]
    async fn test_pull_unknown_tag() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));

        let err = client.pull(&store, "registry.test/org/none:v1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.list_tags().unwrap().is_empty());
    }

    #[test]
    fn test_limits() {
        let limits = RegistryLimits {
            max_index_manifests: 4,
            ..Default::default()
        };
        let client = RegistryClient::new(Arc::new(MemoryRegistry::new())).with_limits(limits);
        assert_eq!(client.limits().max_index_manifests, 4);
        assert_eq!(client.limits().max_blob_size, DEFAULT_MAX_BLOB_SIZE);
    }
}
