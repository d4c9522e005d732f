//! Skill metadata carried in OCI config labels and manifest annotations.
//!
//! # Config labels
//!
//! - `dev.toolhive.skills.name` - Skill name
//! - `dev.toolhive.skills.description` - Description
//! - `dev.toolhive.skills.version` - Version
//! - `dev.toolhive.skills.allowedTools` - JSON array of tool names
//! - `dev.toolhive.skills.license` - License identifier
//! - `dev.toolhive.skills.files` - JSON array of packaged file paths
//!
//! # Manifest annotations
//!
//! - `dev.toolhive.skills.name`, `.description`, `.version` mirror the labels
//! - `dev.toolhive.skills.requires` - JSON array of dependency references

use std::collections::BTreeMap;

use skillpack_core::error::{PackError, Result};

use crate::skill::SkillConfig;

pub const LABEL_NAME: &str = "dev.toolhive.skills.name";
pub const LABEL_DESCRIPTION: &str = "dev.toolhive.skills.description";
pub const LABEL_VERSION: &str = "dev.toolhive.skills.version";
pub const LABEL_ALLOWED_TOOLS: &str = "dev.toolhive.skills.allowedTools";
pub const LABEL_LICENSE: &str = "dev.toolhive.skills.license";
pub const LABEL_FILES: &str = "dev.toolhive.skills.files";

pub const ANNOTATION_NAME: &str = "dev.toolhive.skills.name";
pub const ANNOTATION_DESCRIPTION: &str = "dev.toolhive.skills.description";
pub const ANNOTATION_VERSION: &str = "dev.toolhive.skills.version";
pub const ANNOTATION_REQUIRES: &str = "dev.toolhive.skills.requires";

/// Skill metadata read back from image config labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillLabels {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub allowed_tools: Vec<String>,
    pub license: Option<String>,
    pub files: Vec<String>,
}

impl SkillLabels {
    /// Build labels for a packaged skill. Empty fields are omitted;
    /// `files` is always present.
    pub fn new(config: &SkillConfig, files: &[String]) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            name: Some(config.name.clone()),
            description: non_empty(&config.description),
            version: non_empty(&config.version),
            allowed_tools: config.allowed_tools.clone(),
            license: non_empty(&config.license),
            files: files.to_vec(),
        }
    }

    /// Encode as config labels; list fields are JSON arrays.
    pub fn to_labels(&self) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        if let Some(ref name) = self.name {
            labels.insert(LABEL_NAME.to_string(), name.clone());
        }
        if let Some(ref description) = self.description {
            labels.insert(LABEL_DESCRIPTION.to_string(), description.clone());
        }
        if let Some(ref version) = self.version {
            labels.insert(LABEL_VERSION.to_string(), version.clone());
        }
        if !self.allowed_tools.is_empty() {
            labels.insert(
                LABEL_ALLOWED_TOOLS.to_string(),
                serde_json::to_string(&self.allowed_tools)?,
            );
        }
        if let Some(ref license) = self.license {
            labels.insert(LABEL_LICENSE.to_string(), license.clone());
        }
        labels.insert(LABEL_FILES.to_string(), serde_json::to_string(&self.files)?);
        Ok(labels)
    }

    /// Parse skill metadata from config labels, ignoring unrelated keys.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Result<Self> {
        let mut parsed = Self::default();

        for (key, value) in labels {
            match key.as_str() {
                LABEL_NAME => parsed.name = Some(value.clone()),
                LABEL_DESCRIPTION => parsed.description = Some(value.clone()),
                LABEL_VERSION => parsed.version = Some(value.clone()),
                LABEL_LICENSE => parsed.license = Some(value.clone()),
                LABEL_ALLOWED_TOOLS => parsed.allowed_tools = json_list(key, value)?,
                LABEL_FILES => parsed.files = json_list(key, value)?,
                _ => {}
            }
        }

        Ok(parsed)
    }

    /// Whether the labels describe a skill.
    pub fn is_skill(&self) -> bool {
        self.name.is_some()
    }
}

fn json_list(key: &str, value: &str) -> Result<Vec<String>> {
    serde_json::from_str(value)
        .map_err(|e| PackError::InvalidInput(format!("Label {} is not a JSON list: {}", key, e)))
}

/// Manifest annotations for a skill.
pub fn skill_annotations(config: &SkillConfig) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_NAME.to_string(), config.name.clone());
    if !config.description.is_empty() {
        annotations.insert(ANNOTATION_DESCRIPTION.to_string(), config.description.clone());
    }
    if !config.version.is_empty() {
        annotations.insert(ANNOTATION_VERSION.to_string(), config.version.clone());
    }
    let requires = config.requires();
    if !requires.is_empty() {
        annotations.insert(ANNOTATION_REQUIRES.to_string(), serde_json::to_string(&requires)?);
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::REQUIRES_METADATA_KEY;

    fn config() -> SkillConfig {
        SkillConfig {
            name: "pdf-tools".to_string(),
            description: "Read PDFs".to_string(),
            version: "1.0.0".to_string(),
            allowed_tools: vec!["Read".to_string(), "Bash".to_string()],
            license: String::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_to_labels() {
        let files = vec!["SKILL.md".to_string(), "scripts/run.sh".to_string()];
        let labels = SkillLabels::new(&config(), &files).to_labels().unwrap();

        assert_eq!(labels.get(LABEL_NAME).unwrap(), "pdf-tools");
        assert_eq!(labels.get(LABEL_ALLOWED_TOOLS).unwrap(), r#"["Read","Bash"]"#);
        assert_eq!(
            labels.get(LABEL_FILES).unwrap(),
            r#"["SKILL.md","scripts/run.sh"]"#
        );
        assert!(!labels.contains_key(LABEL_LICENSE));
    }

    #[test]
    fn test_labels_roundtrip() {
        let files = vec!["SKILL.md".to_string()];
        let original = SkillLabels::new(&config(), &files);
        let parsed = SkillLabels::from_labels(&original.to_labels().unwrap()).unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.is_skill());
    }

    #[test]
    fn test_from_labels_ignores_unrelated() {
        let mut labels = BTreeMap::new();
        labels.insert("org.opencontainers.image.title".to_string(), "x".to_string());
        let parsed = SkillLabels::from_labels(&labels).unwrap();
        assert!(!parsed.is_skill());
        assert!(parsed.files.is_empty());
    }

    #[test]
    fn test_from_labels_rejects_bad_list() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_FILES.to_string(), "not json".to_string());
        assert!(matches!(
            SkillLabels::from_labels(&labels),
            Err(PackError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_annotations() {
        let mut config = config();
        let annotations = skill_annotations(&config).unwrap();
        assert_eq!(annotations.get(ANNOTATION_NAME).unwrap(), "pdf-tools");
        assert_eq!(annotations.get(ANNOTATION_VERSION).unwrap(), "1.0.0");
        assert!(!annotations.contains_key(ANNOTATION_REQUIRES));

        config.metadata.insert(
            REQUIRES_METADATA_KEY.to_string(),
            "ghcr.io/a/b:v1\n\nghcr.io/c/d:v2\n".to_string(),
        );
        let annotations = skill_annotations(&config).unwrap();
        assert_eq!(
            annotations.get(ANNOTATION_REQUIRES).unwrap(),
            r#"["ghcr.io/a/b:v1","ghcr.io/c/d:v2"]"#
        );
    }
}
