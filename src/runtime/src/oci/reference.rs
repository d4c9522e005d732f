//! Registry reference parsing.
//!
//! Parses references like `ghcr.io/org/skill:v1.0.0` or
//! `ghcr.io/org/skill@sha256:…` into structured components. Unlike image
//! pulls in most tools, no `latest` tag is implied: a reference naming
//! neither a tag nor a digest is representable but rejected by push and pull.

use std::fmt;
use std::str::FromStr;

use skillpack_core::error::{PackError, Result};

use super::digest::Digest;

/// Registry used when the reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

const MAX_TAG_LEN: usize = 128;

/// Parsed registry reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host, with optional port (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "org/skill", "library/skill")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest, if any
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// - `skill` → docker.io/library/skill
    /// - `org/skill:v1` → docker.io/org/skill:v1
    /// - `ghcr.io/org/skill:v1` → ghcr.io/org/skill:v1
    /// - `localhost:5000/skill@sha256:…` → localhost:5000/skill@sha256:…
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PackError::InvalidInput("Empty reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| {
                    PackError::InvalidInput(format!("Invalid reference '{}': {}", reference, e))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A tag separator must come after the last path separator, otherwise
        // the colon belongs to a registry port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether the reference pins a tag or a digest.
    pub fn has_tag_or_digest(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }

    /// Fail unless the reference pins a tag or a digest.
    pub fn require_tag_or_digest(&self) -> Result<()> {
        if !self.has_tag_or_digest() {
            return Err(PackError::InvalidInput(format!(
                "Reference '{}' must include a tag or digest",
                self
            )));
        }
        Ok(())
    }

    /// The tag, or the digest string when no tag is set.
    pub fn tag_or_digest(&self) -> Option<String> {
        self.tag
            .clone()
            .or_else(|| self.digest.as_ref().map(|d| d.to_string()))
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The same repository pinned to `digest`, keeping the tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// The same repository addressed only by `digest`.
    pub fn at_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// Full canonical reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with('.')
        && !tag.starts_with('-')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if !valid {
        return Err(PackError::InvalidInput(format!(
            "Invalid tag '{}' in reference '{}'",
            tag, reference
        )));
    }
    Ok(())
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    let (registry, repository) = match name.split_once('/') {
        // The first component is a registry host if it looks like one.
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    let valid_component = |c: &str| {
        !c.is_empty()
            && c.chars().all(|ch| {
                ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '_' || ch == '-'
            })
    };
    if registry.is_empty() || !repository.split('/').all(valid_component) {
        return Err(PackError::InvalidInput(format!(
            "Invalid repository in reference '{}'",
            reference
        )));
    }

    Ok((registry, repository))
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl FromStr for Reference {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}
