//! SKILL.md frontmatter.
//!
//! A skill directory carries a `SKILL.md` whose leading YAML block, fenced by
//! `---` lines, describes the skill:
//!
//! ```text
//! ---
//! name: pdf-tools
//! description: Read and fill PDF forms
//! version: 1.2.0
//! allowed-tools: Read Write, Bash
//! metadata:
//!   toolhive.requires: |
//!     ghcr.io/org/base-skill:v1
//! ---
//! # Body
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{de, Deserialize, Deserializer, Serialize};
use skillpack_core::error::{PackError, Result};

/// File name of the skill definition at the root of a skill directory.
pub const SKILL_FILE: &str = "SKILL.md";

/// Largest frontmatter block accepted, in bytes.
pub const MAX_FRONTMATTER_SIZE: usize = 64 * 1024;

/// Metadata key listing skill dependencies, one reference per line.
pub const REQUIRES_METADATA_KEY: &str = "toolhive.requires";

const DELIMITER: &str = "---";

/// Parsed skill metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillConfig {
    /// Skill name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Version
    #[serde(default)]
    pub version: String,

    /// Tools the skill may call, in declaration order
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// License identifier
    #[serde(default)]
    pub license: String,

    /// Free-form compatibility note
    #[serde(default)]
    pub compatibility: String,

    /// Open metadata map
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SkillConfig {
    /// Read and parse `SKILL.md` from a skill directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SKILL_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PackError::NotFound(format!("{} not found in {}", SKILL_FILE, dir.display()))
            } else {
                PackError::IoError(e)
            }
        })?;
        let (config, _) = parse_frontmatter(&content)?;
        Ok(config)
    }

    /// Dependency references from the `toolhive.requires` metadata entry.
    pub fn requires(&self) -> Vec<String> {
        self.metadata
            .get(REQUIRES_METADATA_KEY)
            .map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Frontmatter as written in YAML.
#[derive(Debug, Default, Deserialize)]
struct RawFrontmatter {
    #[serde(default, deserialize_with = "scalar_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    version: Option<String>,
    #[serde(default, rename = "allowed-tools")]
    allowed_tools: Option<AllowedTools>,
    #[serde(default, deserialize_with = "scalar_string")]
    license: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    compatibility: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_yaml::Value>,
}

/// `allowed-tools` accepts a YAML list or a delimited string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AllowedTools {
    List(Vec<String>),
    Text(String),
}

impl AllowedTools {
    fn normalize(self) -> Vec<String> {
        match self {
            AllowedTools::List(items) => items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            AllowedTools::Text(text) => text
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(value) => scalar_to_string(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a string value")),
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Split `SKILL.md` into parsed frontmatter and the markdown body.
pub fn parse_frontmatter(content: &str) -> Result<(SkillConfig, &str)> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let first_line_end = content.find('\n').unwrap_or(content.len());
    if content[..first_line_end].trim_end() != DELIMITER {
        return Err(PackError::Frontmatter(format!(
            "{} must start with a '{}' line",
            SKILL_FILE, DELIMITER
        )));
    }
    let rest = content.get(first_line_end + 1..).unwrap_or("");

    let mut offset = 0;
    let mut closing = None;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            closing = Some((offset, offset + line.len()));
            break;
        }
        offset += line.len();
        if offset > MAX_FRONTMATTER_SIZE {
            return Err(PackError::SizeLimitExceeded {
                what: format!("{} frontmatter", SKILL_FILE),
                size: offset as u64,
                limit: MAX_FRONTMATTER_SIZE as u64,
            });
        }
    }
    let (yaml_end, body_start) = closing.ok_or_else(|| {
        PackError::Frontmatter(format!(
            "{} frontmatter is missing its closing '{}' line",
            SKILL_FILE, DELIMITER
        ))
    })?;

    let yaml = &rest[..yaml_end];
    let raw: RawFrontmatter = if yaml.trim().is_empty() {
        RawFrontmatter::default()
    } else {
        serde_yaml::from_str(yaml)
            .map_err(|e| PackError::Frontmatter(format!("Failed to parse frontmatter: {}", e)))?
    };

    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PackError::Frontmatter("skill name is required".to_string()))?;

    let mut metadata = BTreeMap::new();
    for (key, value) in raw.metadata {
        if value.is_null() {
            continue;
        }
        let value = match scalar_to_string(&value) {
            Some(s) => s,
            None => serde_json::to_string(&value).map_err(|e| {
                PackError::Frontmatter(format!("Invalid metadata value for '{}': {}", key, e))
            })?,
        };
        metadata.insert(key, value);
    }

    let config = SkillConfig {
        name,
        description: raw.description.unwrap_or_default(),
        version: raw.version.unwrap_or_default(),
        allowed_tools: raw.allowed_tools.map(AllowedTools::normalize).unwrap_or_default(),
        license: raw.license.unwrap_or_default(),
        compatibility: raw.compatibility.unwrap_or_default(),
        metadata,
    };

    Ok((config, &rest[body_start..]))
}
