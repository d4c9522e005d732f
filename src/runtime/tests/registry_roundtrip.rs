//! Integration test: package a skill, push it to a registry and pull it
//! back into a fresh store.
//!
//! Runs entirely in memory through `MemoryRegistry`, so no network access
//! is needed:
//!
//! ```bash
//! cargo test -p skillpack-runtime --test registry_roundtrip
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skillpack_core::error::{ErrorKind, PackError, Result};
use skillpack_runtime::oci::image::{
    Descriptor, ImageIndex, ImageManifest, Platform, ARTIFACT_TYPE_SKILL, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_TAR_GZIP,
};
use skillpack_runtime::oci::registry::{
    BoundedBuffer, MemoryRegistry, RegistryClient, RegistryLimits, RegistryTransport,
};
use skillpack_runtime::oci::{Digest, LocalStore, PackageOptions, PackageResult, Packager, Reference};
use tempfile::TempDir;

const REFERENCE: &str = "registry.test/org/lint:v1";

fn write_skill(root: &Path) -> PathBuf {
    let skill = root.join("lint");
    std::fs::create_dir_all(skill.join("scripts")).unwrap();
    std::fs::write(
        skill.join("SKILL.md"),
        "---\nname: lint\ndescription: Lint source files\nversion: 1.2.0\n---\n# Lint\n",
    )
    .unwrap();
    std::fs::write(skill.join("scripts/run.sh"), "#!/bin/sh\necho lint\n").unwrap();
    skill
}

fn package(root: &Path, platforms: Vec<Platform>) -> (Arc<LocalStore>, PackageResult) {
    let skill = write_skill(root);
    let store = Arc::new(LocalStore::open(&root.join("store")).unwrap());
    let packager = Packager::new(store.clone()).unwrap();
    let options = PackageOptions::default()
        .with_epoch(1_700_000_000)
        .with_platforms(platforms);
    let result = packager.package(&skill, &options).unwrap();
    (store, result)
}

fn blob_files(store: &LocalStore) -> usize {
    std::fs::read_dir(store.root().join("blobs").join("sha256"))
        .unwrap()
        .count()
}

fn manifest_with_layers(config: &Descriptor, layers: Vec<Descriptor>) -> Vec<u8> {
    let manifest = ImageManifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
        artifact_type: Some(ARTIFACT_TYPE_SKILL.to_string()),
        config: config.clone(),
        layers,
        annotations: Default::default(),
    };
    serde_json::to_vec(&manifest).unwrap()
}

#[tokio::test]
async fn test_index_roundtrip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(
        dir.path(),
        vec![Platform::new("linux", "amd64"), Platform::new("linux", "arm64")],
    );
    let registry = Arc::new(MemoryRegistry::new());
    let client = RegistryClient::new(registry.clone());

    let pushed = client
        .push(&store, &packaged.index_digest, REFERENCE)
        .await
        .unwrap();
    assert_eq!(pushed.digest, packaged.index_digest);
    // Shared layer plus one config per platform.
    assert_eq!(registry.blob_count(), 3);

    let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
    let pulled = client.pull(&fresh, REFERENCE).await.unwrap();

    assert_eq!(pulled.digest, packaged.index_digest);
    assert_eq!(pulled.media_type, MEDIA_TYPE_IMAGE_INDEX);
    assert_eq!(pulled.manifests.len(), 2);
    assert_eq!(
        fresh.get_manifest(&pulled.digest).unwrap(),
        store.get_manifest(&packaged.index_digest).unwrap()
    );

    for child in &pulled.manifests {
        assert_eq!(
            fresh.get_manifest(child).unwrap(),
            store.get_manifest(child).unwrap()
        );
        let manifest = fresh.get_image_manifest(child).unwrap();
        assert!(fresh.exists(&manifest.config.digest));
        assert!(fresh.exists(&manifest.layers[0].digest));
    }
    assert!(pulled.manifests.contains(&packaged.manifest_digest));

    assert_eq!(fresh.resolve("v1").unwrap(), packaged.index_digest);
    assert_eq!(fresh.resolve(REFERENCE).unwrap(), packaged.index_digest);
}

#[tokio::test]
async fn test_single_manifest_roundtrip() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(dir.path(), vec![Platform::new("linux", "amd64")]);
    let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));

    client
        .push(&store, &packaged.manifest_digest, "registry.test/org/lint:amd64")
        .await
        .unwrap();

    let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
    let pulled = client
        .pull(&fresh, "registry.test/org/lint:amd64")
        .await
        .unwrap();
    assert_eq!(pulled.digest, packaged.manifest_digest);
    assert_eq!(pulled.media_type, MEDIA_TYPE_IMAGE_MANIFEST);
    assert_eq!(pulled.manifests, vec![packaged.manifest_digest.clone()]);
    assert_eq!(
        fresh.get_manifest(&pulled.digest).unwrap(),
        store.get_manifest(&packaged.manifest_digest).unwrap()
    );
    assert!(fresh.exists(&packaged.layer_digest));
    assert!(fresh.exists(&packaged.config_digest));
}

#[tokio::test]
async fn test_pull_by_digest() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(dir.path(), vec![Platform::new("linux", "amd64")]);
    let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
    client
        .push(&store, &packaged.index_digest, REFERENCE)
        .await
        .unwrap();

    let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
    let by_digest = format!("registry.test/org/lint@{}", packaged.index_digest);
    let pulled = client.pull(&fresh, &by_digest).await.unwrap();

    assert_eq!(pulled.digest, packaged.index_digest);
    assert_eq!(
        fresh.resolve(&packaged.index_digest.to_string()).unwrap(),
        packaged.index_digest
    );
    assert_eq!(fresh.resolve(&by_digest).unwrap(), packaged.index_digest);
}

#[tokio::test]
async fn test_reference_without_tag_fails_before_io() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(dir.path(), vec![Platform::new("linux", "amd64")]);
    let registry = Arc::new(MemoryRegistry::new());
    let client = RegistryClient::new(registry.clone());
    let tags_before = store.list_tags().unwrap();

    let err = client
        .push(&store, &packaged.index_digest, "ghcr.io/org/skill")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    let err = client.pull(&store, "ghcr.io/org/skill").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    assert_eq!(registry.request_count(), 0);
    assert_eq!(store.list_tags().unwrap(), tags_before);
}

#[tokio::test]
async fn test_pull_rejects_index_fan_out() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    let reference = Reference::parse(REFERENCE).unwrap();

    let mut index = ImageIndex::empty();
    for i in 0..33 {
        let data = format!("manifest-{}", i);
        index
            .manifests
            .push(Descriptor::for_content(MEDIA_TYPE_IMAGE_MANIFEST, data.as_bytes()));
    }
    let data = serde_json::to_vec(&index).unwrap();
    registry.insert_raw_manifest(&reference, Digest::of(&data), MEDIA_TYPE_IMAGE_INDEX, data);

    let client = RegistryClient::new(registry.clone());
    let err = client.pull(&store, REFERENCE).await.unwrap_err();
    assert!(matches!(err, PackError::PolicyViolation(_)), "{}", err);
    assert!(store.list_tags().unwrap().is_empty());
    assert_eq!(blob_files(&store), 0);
}

#[tokio::test]
async fn test_pull_rejects_layer_fan_out() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    let reference = Reference::parse(REFERENCE).unwrap();

    let config = Descriptor::for_content(MEDIA_TYPE_IMAGE_CONFIG, b"{}");
    let layers = (0..65)
        .map(|i| Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, format!("layer-{}", i).as_bytes()))
        .collect();
    let data = manifest_with_layers(&config, layers);
    registry.insert_raw_manifest(&reference, Digest::of(&data), MEDIA_TYPE_IMAGE_MANIFEST, data);

    let client = RegistryClient::new(registry.clone());
    let err = client.pull(&store, REFERENCE).await.unwrap_err();
    assert!(matches!(err, PackError::PolicyViolation(_)), "{}", err);
    assert!(store.list_tags().unwrap().is_empty());
}

#[tokio::test]
async fn test_push_rejects_layer_fan_out() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let config = Descriptor::for_content(MEDIA_TYPE_IMAGE_CONFIG, b"{}");
    let layers = (0..65)
        .map(|i| Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, format!("layer-{}", i).as_bytes()))
        .collect();
    let digest = store.put_manifest(&manifest_with_layers(&config, layers)).unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let client = RegistryClient::new(registry.clone());
    let err = client.push(&store, &digest, REFERENCE).await.unwrap_err();
    assert!(matches!(err, PackError::PolicyViolation(_)), "{}", err);
    assert_eq!(registry.request_count(), 0);
}

#[tokio::test]
async fn test_push_rejects_lying_descriptor() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();

    let config_data = b"{}".to_vec();
    store.put_blob(&config_data).unwrap();
    let config = Descriptor::for_content(MEDIA_TYPE_IMAGE_CONFIG, &config_data);

    let layer_data = vec![7u8; 1024];
    store.put_blob(&layer_data).unwrap();
    let mut layer = Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, &layer_data);
    layer.size = 10;

    let digest = store
        .put_manifest(&manifest_with_layers(&config, vec![layer]))
        .unwrap();

    let registry = Arc::new(MemoryRegistry::new());
    let client = RegistryClient::new(registry.clone()).with_limits(RegistryLimits {
        max_blob_size: 100,
        ..Default::default()
    });
    let err = client.push(&store, &digest, REFERENCE).await.unwrap_err();
    assert!(matches!(err, PackError::SizeLimitExceeded { .. }), "{}", err);
    assert_eq!(registry.request_count(), 0);
    assert_eq!(registry.blob_count(), 0);
}

#[tokio::test]
async fn test_pull_rejects_lying_descriptor() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    let reference = Reference::parse(REFERENCE).unwrap();

    let config_data = b"{}".to_vec();
    let config = Descriptor::for_content(MEDIA_TYPE_IMAGE_CONFIG, &config_data);
    registry.insert_raw_blob(config.digest.clone(), config_data);

    let layer_data = vec![7u8; 1024];
    let mut layer = Descriptor::for_content(MEDIA_TYPE_LAYER_TAR_GZIP, &layer_data);
    layer.size = 10;
    registry.insert_raw_blob(layer.digest.clone(), layer_data);

    let data = manifest_with_layers(&config, vec![layer]);
    registry.insert_raw_manifest(&reference, Digest::of(&data), MEDIA_TYPE_IMAGE_MANIFEST, data);

    let client = RegistryClient::new(registry.clone()).with_limits(RegistryLimits {
        max_blob_size: 100,
        ..Default::default()
    });
    let err = client.pull(&store, REFERENCE).await.unwrap_err();
    assert!(matches!(err, PackError::SizeLimitExceeded { .. }), "{}", err);
    assert!(store.list_tags().unwrap().is_empty());
    assert_eq!(blob_files(&store), 0);
}

#[tokio::test]
async fn test_tampered_blob_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(dir.path(), vec![Platform::new("linux", "amd64")]);
    let registry = Arc::new(MemoryRegistry::new());
    let client = RegistryClient::new(registry.clone());
    client
        .push(&store, &packaged.index_digest, REFERENCE)
        .await
        .unwrap();

    // The registry now serves different bytes under the layer's digest.
    registry.insert_raw_blob(packaged.layer_digest.clone(), b"substituted".to_vec());

    let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
    let err = client.pull(&fresh, REFERENCE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PolicyViolation, "{}", err);
    assert!(fresh.list_tags().unwrap().is_empty());
    assert_eq!(blob_files(&fresh), 0);
    assert!(!fresh.exists(&packaged.index_digest));
}

/// Transport that stalls before answering.
struct StalledTransport {
    inner: MemoryRegistry,
    delay: Duration,
}

#[async_trait]
impl RegistryTransport for StalledTransport {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        tokio::time::sleep(self.delay).await;
        self.inner.resolve(reference).await
    }

    async fn fetch_manifest(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        self.inner.fetch_manifest(reference, descriptor, out).await
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        self.inner.fetch_blob(reference, descriptor, out).await
    }

    async fn push_blob(&self, reference: &Reference, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.push_blob(reference, descriptor, data).await
    }

    async fn push_manifest(&self, target: &Reference, media_type: &str, data: &[u8]) -> Result<()> {
        self.inner.push_manifest(target, media_type, data).await
    }
}

#[tokio::test]
async fn test_timeout_aborts_transfer() {
    let dir = TempDir::new().unwrap();
    let (store, packaged) = package(dir.path(), vec![Platform::new("linux", "amd64")]);
    let transport = Arc::new(StalledTransport {
        inner: MemoryRegistry::new(),
        delay: Duration::from_secs(30),
    });
    let client = RegistryClient::new(transport.clone()).with_timeout(Duration::from_millis(50));

    let err = client
        .push(&store, &packaged.index_digest, REFERENCE)
        .await
        .unwrap_err();
    assert!(matches!(err, PackError::TimeoutError(_)), "{}", err);
    assert_eq!(transport.inner.blob_count(), 0);

    let fresh = LocalStore::open(&dir.path().join("fresh")).unwrap();
    let err = client.pull(&fresh, REFERENCE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(fresh.list_tags().unwrap().is_empty());
}
