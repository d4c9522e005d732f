//! Packaging engine for turning skill directories into OCI artifacts.
//!
//! Validates the directory, parses `SKILL.md`, builds one content layer,
//! writes a config and manifest per platform, and assembles an image index.
//! Every timestamp comes from the packaging epoch, so identical input and
//! options yield identical digests in any store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use skillpack_core::config::source_date_epoch;
use skillpack_core::error::{PackError, Result};

use super::layer::{collect_files, create_layer, file_list, LayerInfo};
use crate::oci::digest::Digest;
use crate::oci::image::{
    ConfigSection, Descriptor, History, ImageConfig, ImageIndex, ImageManifest, Platform, RootFs,
    ARTIFACT_TYPE_SKILL, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_TAR_GZIP,
};
use crate::oci::labels::{skill_annotations, SkillLabels};
use crate::oci::layers::has_traversal;
use crate::oci::store::LocalStore;
use crate::skill::{parse_frontmatter, SkillConfig, SKILL_FILE};

/// `created_by` recorded in the single history entry of each config.
pub const HISTORY_CREATED_BY: &str = "toolhive package";

/// Options for a packaging run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOptions {
    /// Unix timestamp baked into every artifact
    pub epoch: i64,
    /// Target platforms; empty means the default list
    pub platforms: Vec<Platform>,
}

impl Default for PackageOptions {
    /// Epoch from `SOURCE_DATE_EPOCH`, else 0; default platforms.
    fn default() -> Self {
        Self {
            epoch: source_date_epoch().unwrap_or(0),
            platforms: Platform::defaults(),
        }
    }
}

impl PackageOptions {
    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }
}

/// Result of a successful packaging run.
#[derive(Debug, Clone)]
pub struct PackageResult {
    /// Digest of the multi-platform image index
    pub index_digest: Digest,
    /// Manifest digest for the first platform
    pub manifest_digest: Digest,
    /// Config digest for the first platform
    pub config_digest: Digest,
    /// Digest of the shared content layer
    pub layer_digest: Digest,
    /// Parsed skill metadata
    pub config: SkillConfig,
    /// Platforms packaged, in order
    pub platforms: Vec<Platform>,
}

/// Builds skill artifacts into a local store.
pub struct Packager {
    store: Arc<LocalStore>,
}

impl Packager {
    /// Create a packager writing into `store`.
    ///
    /// Fails immediately if the store's layout is missing on disk.
    pub fn new(store: Arc<LocalStore>) -> Result<Self> {
        if !store.is_initialized() {
            return Err(PackError::InvalidInput(format!(
                "Content store at {} is not an initialized image layout",
                store.root().display()
            )));
        }
        Ok(Self { store })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Package the skill directory at `dir`.
    pub fn package(&self, dir: &Path, options: &PackageOptions) -> Result<PackageResult> {
        let platforms = resolve_platforms(options)?;
        let created = format_epoch(options.epoch)?;

        if has_traversal(dir) {
            return Err(PackError::InvalidInput(format!(
                "Skill path must not contain '..': {}",
                dir.display()
            )));
        }
        let metadata = std::fs::metadata(dir).map_err(|e| {
            PackError::InvalidInput(format!("Cannot access {}: {}", dir.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(PackError::InvalidInput(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let skill_path = dir.join(SKILL_FILE);
        if !skill_path.is_file() {
            return Err(PackError::NotFound(format!(
                "{} not found in {}",
                SKILL_FILE,
                dir.display()
            )));
        }
        let content = std::fs::read_to_string(&skill_path).map_err(|e| {
            PackError::Frontmatter(format!("Failed to read {}: {}", skill_path.display(), e))
        })?;
        let (config, _) = parse_frontmatter(&content)?;

        let entries = collect_files(dir)?;
        let files = file_list(&entries);
        let layer = create_layer(&entries, options.epoch)?;
        let layer_digest = self.store.put_blob(&layer.data)?;

        let labels = SkillLabels::new(&config, &files).to_labels()?;
        let annotations = skill_annotations(&config)?;

        let mut built: HashMap<Platform, (Descriptor, Digest)> = HashMap::new();
        for platform in &platforms {
            let image_config = ImageConfig {
                created: created.clone(),
                architecture: platform.architecture.clone(),
                os: platform.os.clone(),
                variant: platform.variant.clone(),
                config: ConfigSection {
                    labels: labels.clone(),
                },
                rootfs: RootFs {
                    fs_type: "layers".to_string(),
                    diff_ids: vec![layer.diff_id.clone()],
                },
                history: vec![History {
                    created: created.clone(),
                    created_by: HISTORY_CREATED_BY.to_string(),
                }],
            };
            let config_bytes = serde_json::to_vec(&image_config)?;
            let config_digest = self.store.put_blob(&config_bytes)?;

            let manifest = ImageManifest {
                schema_version: 2,
                media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                artifact_type: Some(ARTIFACT_TYPE_SKILL.to_string()),
                config: Descriptor::for_content(MEDIA_TYPE_IMAGE_CONFIG, &config_bytes),
                layers: vec![layer_descriptor(&layer)],
                annotations: annotations.clone(),
            };
            let manifest_bytes = serde_json::to_vec(&manifest)?;
            self.store.put_manifest(&manifest_bytes)?;

            let mut descriptor = Descriptor::for_content(MEDIA_TYPE_IMAGE_MANIFEST, &manifest_bytes);
            descriptor.platform = Some(platform.clone());
            descriptor.artifact_type = Some(ARTIFACT_TYPE_SKILL.to_string());

            tracing::debug!(
                platform = %platform,
                manifest = %descriptor.digest,
                config = %config_digest,
                "Wrote platform manifest"
            );
            built.insert(platform.clone(), (descriptor, config_digest));
        }

        let mut manifests = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            let (descriptor, _) = built.get(platform).ok_or_else(|| {
                PackError::Other(format!("No manifest was built for platform {}", platform))
            })?;
            manifests.push(descriptor.clone());
        }
        let (primary, primary_config) = built
            .remove(&platforms[0])
            .ok_or_else(|| PackError::Other("No primary platform manifest".to_string()))?;

        let index = ImageIndex {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_INDEX.to_string(),
            artifact_type: Some(ARTIFACT_TYPE_SKILL.to_string()),
            manifests,
            annotations,
        };
        let index_digest = self.store.put_manifest(&serde_json::to_vec(&index)?)?;
        self.store.tag(&index_digest, &index_digest.to_string())?;

        tracing::info!(
            name = %config.name,
            index = %index_digest,
            layer = %layer_digest,
            platforms = platforms.len(),
            "Packaged skill"
        );

        Ok(PackageResult {
            index_digest,
            manifest_digest: primary.digest,
            config_digest: primary_config,
            layer_digest,
            config,
            platforms,
        })
    }
}

fn resolve_platforms(options: &PackageOptions) -> Result<Vec<Platform>> {
    let platforms = if options.platforms.is_empty() {
        Platform::defaults()
    } else {
        options.platforms.clone()
    };
    for (i, platform) in platforms.iter().enumerate() {
        if platforms[..i].contains(platform) {
            return Err(PackError::InvalidInput(format!(
                "Duplicate platform {}",
                platform
            )));
        }
    }
    Ok(platforms)
}

/// `created` timestamp for an epoch. The same epoch becomes the layer's
/// gzip mtime, which is 32 bits wide.
fn format_epoch(epoch: i64) -> Result<String> {
    if epoch < 0 {
        return Err(PackError::InvalidInput(format!(
            "Epoch must not be negative: {}",
            epoch
        )));
    }
    if epoch > i64::from(u32::MAX) {
        return Err(PackError::InvalidInput(format!(
            "Epoch {} is past {}, the latest gzip mtime",
            epoch,
            u32::MAX
        )));
    }
    let created = DateTime::<Utc>::from_timestamp(epoch, 0)
        .ok_or_else(|| PackError::InvalidInput(format!("Epoch out of range: {}", epoch)))?;
    Ok(created.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn layer_descriptor(layer: &LayerInfo) -> Descriptor {
    Descriptor {
        media_type: MEDIA_TYPE_LAYER_TAR_GZIP.to_string(),
        digest: layer.digest.clone(),
        size: layer.size() as i64,
        platform: None,
        artifact_type: None,
        annotations: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::labels::{ANNOTATION_NAME, ANNOTATION_REQUIRES, LABEL_FILES};
    use crate::oci::layers::{decompress, extract_tar, TarLimits};
    use tempfile::TempDir;

    fn skill_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("SKILL.md"),
            "---\nname: pdf-tools\ndescription: Read PDFs\nversion: 1.0.0\nallowed-tools: Read Bash\nmetadata:\n  toolhive.requires: |\n    ghcr.io/org/base:v1\n---\n# PDF tools\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/extract.py"), "print('hi')").unwrap();
        dir
    }

    fn packager(dir: &TempDir) -> Packager {
        let store = Arc::new(LocalStore::open(&dir.path().join("store")).unwrap());
        Packager::new(store).unwrap()
    }

    fn options() -> PackageOptions {
        PackageOptions {
            epoch: 0,
            platforms: Platform::defaults(),
        }
    }

    #[test]
    fn test_package_writes_graph() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let packager = packager(&tmp);
        let store = packager.store().clone();

        let result = packager.package(skill.path(), &options()).unwrap();
        assert_eq!(result.config.name, "pdf-tools");
        assert_eq!(result.platforms, Platform::defaults());

        assert!(store.is_index(&result.index_digest).unwrap());
        let index = store.get_index(&result.index_digest).unwrap();
        assert_eq!(index.manifests.len(), 2);
        assert_eq!(index.manifests[0].digest, result.manifest_digest);
        assert_eq!(
            index.manifests[1].platform,
            Some(Platform::new("linux", "arm64"))
        );
        assert_eq!(index.artifact_type.as_deref(), Some(ARTIFACT_TYPE_SKILL));

        let manifest = store.get_image_manifest(&result.manifest_digest).unwrap();
        assert_eq!(manifest.config.digest, result.config_digest);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].digest, result.layer_digest);
        assert_eq!(manifest.annotations, index.annotations);
        assert_eq!(manifest.annotations.get(ANNOTATION_NAME).unwrap(), "pdf-tools");
        assert_eq!(
            manifest.annotations.get(ANNOTATION_REQUIRES).unwrap(),
            r#"["ghcr.io/org/base:v1"]"#
        );

        assert_eq!(
            store.resolve(&result.index_digest.to_string()).unwrap(),
            result.index_digest
        );
    }

    #[test]
    fn test_config_contents() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let packager = packager(&tmp);
        let store = packager.store().clone();

        let result = packager
            .package(skill.path(), &options().with_epoch(1_700_000_000))
            .unwrap();
        let config: ImageConfig =
            serde_json::from_slice(&store.get_blob(&result.config_digest).unwrap()).unwrap();

        assert_eq!(config.created, "2023-11-14T22:13:20Z");
        assert_eq!(config.os, "linux");
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.history.len(), 1);
        assert_eq!(config.history[0].created_by, HISTORY_CREATED_BY);
        assert_eq!(
            config.config.labels.get(LABEL_FILES).unwrap(),
            r#"["SKILL.md","scripts/extract.py"]"#
        );

        let layer = store.get_blob(&result.layer_digest).unwrap();
        let tar = decompress(&layer, 1 << 20).unwrap();
        assert_eq!(config.rootfs.diff_ids, vec![Digest::of(&tar)]);
        let entries = extract_tar(&tar, &TarLimits::default()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_reproducible_across_stores() {
        let skill = skill_dir();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        let first = packager(&a).package(skill.path(), &options()).unwrap();
        let second = packager(&b).package(skill.path(), &options()).unwrap();

        assert_eq!(first.index_digest, second.index_digest);
        assert_eq!(first.manifest_digest, second.manifest_digest);
        assert_eq!(first.config_digest, second.config_digest);
        assert_eq!(first.layer_digest, second.layer_digest);
    }

    #[test]
    fn test_repackage_same_store_is_idempotent() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let packager = packager(&tmp);

        let first = packager.package(skill.path(), &options()).unwrap();
        let second = packager.package(skill.path(), &options()).unwrap();
        assert_eq!(first.index_digest, second.index_digest);
    }

    #[test]
    fn test_single_platform_with_variant() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let platform = Platform::new("linux", "arm").with_variant("v7");
        let result = packager(&tmp)
            .package(skill.path(), &options().with_platforms(vec![platform.clone()]))
            .unwrap();
        assert_eq!(result.platforms, vec![platform]);
    }

    #[test]
    fn test_empty_platforms_use_defaults() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let result = packager(&tmp)
            .package(skill.path(), &options().with_platforms(vec![]))
            .unwrap();
        assert_eq!(result.platforms, Platform::defaults());
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let dup = vec![Platform::new("linux", "amd64"), Platform::new("linux", "amd64")];
        let err = packager(&tmp)
            .package(skill.path(), &options().with_platforms(dup))
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_skill_file() {
        let skill = TempDir::new().unwrap();
        std::fs::write(skill.path().join("README.md"), "x").unwrap();
        let tmp = TempDir::new().unwrap();
        let err = packager(&tmp).package(skill.path(), &options()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_a_directory() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let err = packager(&tmp)
            .package(&skill.path().join("SKILL.md"), &options())
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));

        let err = packager(&tmp)
            .package(&skill.path().join("missing"), &options())
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));
    }

    #[test]
    fn test_traversal_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = packager(&tmp)
            .package(Path::new("../skill"), &options())
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_name_rejected() {
        let skill = TempDir::new().unwrap();
        std::fs::write(skill.path().join("SKILL.md"), "---\ndescription: x\n---\n").unwrap();
        let tmp = TempDir::new().unwrap();
        let err = packager(&tmp).package(skill.path(), &options()).unwrap_err();
        assert!(matches!(err, PackError::Frontmatter(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_rejected() {
        let skill = skill_dir();
        std::os::unix::fs::symlink("/etc/hosts", skill.path().join("hosts")).unwrap();
        let tmp = TempDir::new().unwrap();
        let err = packager(&tmp).package(skill.path(), &options()).unwrap_err();
        assert!(err.to_string().contains("symlinks not allowed"));
    }

    #[test]
    fn test_negative_epoch_rejected() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        assert!(packager(&tmp)
            .package(skill.path(), &options().with_epoch(-1))
            .is_err());
    }

    #[test]
    fn test_epoch_past_gzip_mtime_rejected() {
        let skill = skill_dir();
        let tmp = TempDir::new().unwrap();
        let packager = packager(&tmp);
        let err = packager
            .package(skill.path(), &options().with_epoch(10_000_000_000))
            .unwrap_err();
        assert!(matches!(err, PackError::InvalidInput(_)));

        let last = packager
            .package(skill.path(), &options().with_epoch(u32::MAX as i64))
            .unwrap();
        let config: ImageConfig =
            serde_json::from_slice(&packager.store().get_blob(&last.config_digest).unwrap()).unwrap();
        assert_eq!(config.created, "2106-02-07T06:28:15Z");
    }

    #[test]
    fn test_new_rejects_missing_layout() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(tmp.path()).unwrap());
        std::fs::remove_file(tmp.path().join("oci-layout")).unwrap();
        assert!(Packager::new(store).is_err());
    }
}
