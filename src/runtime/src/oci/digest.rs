//! Content digests.
//!
//! A digest is `<algorithm>:<hex>` computed over raw bytes. All content
//! written by skillpack is addressed by SHA-256; SHA-512 digests are accepted
//! for verification of remote content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use skillpack_core::error::{PackError, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Name used in the `algo:hex` form and the `blobs/<algo>/` directory.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Sha256 => hex::encode(Sha256::digest(data)),
            Algorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: Algorithm::Sha256.hash(data),
        }
    }

    /// Parse an `algo:hex` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| {
            PackError::InvalidInput(format!("Invalid digest '{}': expected algorithm:hex", s))
        })?;

        let algorithm = match algo {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => {
                return Err(PackError::InvalidInput(format!(
                    "Unsupported digest algorithm '{}' in '{}'",
                    other, s
                )))
            }
        };

        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(PackError::InvalidInput(format!(
                "Invalid {} digest '{}': expected {} lowercase hex characters",
                algorithm.as_str(),
                s,
                algorithm.hex_len()
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Hex-encoded hash without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether `data` hashes to this digest under the digest's own algorithm.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.hash(data) == self.hex
    }

    /// Recompute the digest of `data` and fail with `DigestMismatch` if it differs.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = self.algorithm.hash(data);
        if actual != self.hex {
            return Err(PackError::DigestMismatch {
                expected: self.to_string(),
                actual: format!("{}:{}", self.algorithm.as_str(), actual),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_of_known_value() {
        assert_eq!(Digest::of(b"hello").to_string(), HELLO_SHA256);
    }

    #[test]
    fn test_of_is_deterministic() {
        assert_eq!(Digest::of(b"same bytes"), Digest::of(b"same bytes"));
        assert_ne!(Digest::of(b"a"), Digest::of(b"b"));
    }

    #[test]
    fn test_parse_roundtrips_display() {
        let d = Digest::parse(HELLO_SHA256).unwrap();
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.to_string(), HELLO_SHA256);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Digest::parse("nocolon").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:abc").is_err());
        assert!(Digest::parse(&HELLO_SHA256.to_uppercase().replace("SHA256", "sha256")).is_err());
    }

    #[test]
    fn test_verify() {
        let d = Digest::of(b"hello");
        assert!(d.verify(b"hello").is_ok());
        assert!(d.matches(b"hello"));

        let err = d.verify(b"tampered").unwrap_err();
        assert!(matches!(err, PackError::DigestMismatch { .. }));
    }

    #[test]
    fn test_sha512_verify() {
        let hex = hex::encode(Sha512::digest(b"hello"));
        let d = Digest::parse(&format!("sha512:{}", hex)).unwrap();
        assert!(d.verify(b"hello").is_ok());
        assert!(d.verify(b"world").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::of(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_SHA256));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"sha256:xyz\"").is_err());
    }
}
