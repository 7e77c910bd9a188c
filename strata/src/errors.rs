//! Error types used across the strata store.

use thiserror::Error;

/// Result type for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store id mappings do not match: {0}")]
    ConfigMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("layers exceed disk quota: {0}")]
    QuotaExceeded(String),

    #[error("registry refused credentials: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("blob digest mismatch: {0}")]
    Checksum(String),

    #[error("{0}")]
    Unpackable(String),

    #[error("base directory not found in parent layer: {0}")]
    BaseDirectoryMissing(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl StrataError {
    /// Whether a retry against the same endpoint may succeed. Checksum and
    /// auth failures are deterministic and must not be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::Network(_))
    }

    /// Prefix the message with `context`, keeping the error kind intact so
    /// callers up the stack can still match on it.
    pub fn wrap(self, context: &str) -> StrataError {
        use StrataError::*;
        match self {
            Config(m) => Config(format!("{}: {}", context, m)),
            ConfigMismatch(m) => ConfigMismatch(format!("{}: {}", context, m)),
            NotFound(m) => NotFound(format!("{}: {}", context, m)),
            Conflict(m) => Conflict(format!("{}: {}", context, m)),
            QuotaExceeded(m) => QuotaExceeded(format!("{}: {}", context, m)),
            Unauthorized(m) => Unauthorized(format!("{}: {}", context, m)),
            Network(m) => Network(format!("{}: {}", context, m)),
            Checksum(m) => Checksum(format!("{}: {}", context, m)),
            Unpackable(m) => Unpackable(format!("{}: {}", context, m)),
            BaseDirectoryMissing(m) => BaseDirectoryMissing(format!("{}: {}", context, m)),
            Backend(m) => Backend(format!("{}: {}", context, m)),
            Invalid(m) => Invalid(format!("{}: {}", context, m)),
        }
    }
}

// Enable `?` on the common error sources.
impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::Backend(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Backend(format!("JSON error: {}", err))
    }
}
