//! OCI artifact support for skills.
//!
//! Skills are stored and shipped as OCI artifacts:
//!
//! ```text
//! store/
//! ├── oci-layout           (layout marker)
//! ├── index.json           (tags → manifests)
//! └── blobs/
//!     └── sha256/
//!         ├── <index>      (one entry per platform)
//!         ├── <manifest>   (per platform)
//!         ├── <config>     (per platform, skill labels)
//!         └── <layer>      (gzip tar of the skill directory, shared)
//! ```

pub mod build;
pub mod credentials;
pub mod digest;
pub mod image;
pub mod labels;
pub mod layers;
pub mod reference;
pub mod registry;
pub mod store;

pub use build::{PackageOptions, PackageResult, Packager};
pub use credentials::{Credential, CredentialStore};
pub use digest::{Algorithm, Digest};
pub use image::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, ManifestKind, Platform,
    ARTIFACT_TYPE_SKILL, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_LAYER_TAR_GZIP,
};
pub use labels::{skill_annotations, SkillLabels};
pub use layers::{compress, create_tar, decompress, extract_tar, unpack_layer, TarEntry, TarLimits};
pub use reference::Reference;
pub use registry::{
    DistributionTransport, MemoryRegistry, PullResult, PushResult, RegistryAuth, RegistryClient,
    RegistryLimits, RegistryTransport,
};
pub use store::LocalStore;
