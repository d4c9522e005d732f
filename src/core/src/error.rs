use thiserror::Error;

/// Coarse classification of a [`PackError`].
///
/// Callers use this to tell missing data apart from bad input without
/// matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A blob, manifest, tag or file is absent.
    NotFound,
    /// Input could not be parsed or is structurally invalid.
    Malformed,
    /// Input parsed but violates a security or resource policy.
    PolicyViolation,
    /// Network or registry failure.
    Transport,
    /// Local I/O or other internal failure.
    Internal,
}

/// Skillpack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// Blob, manifest, tag or required file is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input (bad reference, platform string, JSON, digest)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// SKILL.md frontmatter could not be parsed or is incomplete
    #[error("Frontmatter error: {0}")]
    Frontmatter(String),

    /// Content rejected by a security policy (symlinks, traversal, limits)
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Content exceeds a configured size ceiling
    #[error("Size limit exceeded: {what} is {size} bytes (limit {limit})")]
    SizeLimitExceeded { what: String, size: u64, limit: u64 },

    /// Recomputed digest does not match the claimed one
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Content is already present at the destination
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackError::NotFound(_) => ErrorKind::NotFound,
            PackError::InvalidInput(_)
            | PackError::Frontmatter(_)
            | PackError::SerializationError(_)
            | PackError::ConfigError(_) => ErrorKind::Malformed,
            PackError::PolicyViolation(_)
            | PackError::SizeLimitExceeded { .. }
            | PackError::DigestMismatch { .. } => ErrorKind::PolicyViolation,
            PackError::RegistryError { .. } | PackError::TimeoutError(_) => ErrorKind::Transport,
            PackError::AlreadyExists(_) | PackError::IoError(_) | PackError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this error reports missing data.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for PackError {
    fn from(err: serde_json::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PackError {
    fn from(err: serde_yaml::Error) -> Self {
        PackError::SerializationError(err.to_string())
    }
}

/// Result type alias for skillpack operations
pub type Result<T> = std::result::Result<T, PackError>;
