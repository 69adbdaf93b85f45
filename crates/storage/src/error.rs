//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether this is an ordinary cache miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<bazel_cache_core::Error> for StorageError {
    fn from(err: bazel_cache_core::Error) -> Self {
        match err {
            bazel_cache_core::Error::InvalidNamespace(namespace) => Self::InvalidPath(namespace),
            bazel_cache_core::Error::Config(msg) => Self::Config(msg),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_namespace_becomes_invalid_path() {
        let err: StorageError = bazel_cache_core::Error::InvalidNamespace("foo".into()).into();
        assert!(matches!(err, StorageError::InvalidPath(ref ns) if ns == "foo"));
        assert_eq!(err.to_string(), "invalid path: foo");
    }

    #[test]
    fn only_not_found_is_a_miss() {
        assert!(StorageError::NotFound("cas/x".into()).is_not_found());
        assert!(!StorageError::InvalidPath("x".into()).is_not_found());
        assert!(!StorageError::Config("x".into()).is_not_found());
    }
}
