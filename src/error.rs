//! Error types for cache operations
//!
//! This module defines the error surface of the depcache library, covering
//! context misuse, key generation, storage failures and payload decoding.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// A context operation was used outside any cached call
    #[error("no active cache operation")]
    NoActiveOperation,

    /// A cache key could not be derived from the call description
    #[error("cache key generation failed: {0}")]
    KeyGeneration(String),

    /// The storage backend could not be reached or failed an operation
    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    /// A value could not be encoded for storage
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored payload could not be decoded
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A stored failure marker was read back; callers revive it into their
    /// own error type via [`CacheableError::reconstruct`](crate::serialize::CacheableError::reconstruct)
    #[error("cached failure ({kind}): {message}")]
    CachedFailure { kind: String, message: String },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::StorageUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::NoActiveOperation;
        assert_eq!(error.to_string(), "no active cache operation");

        let error = CacheError::StorageUnavailable("connection refused".to_string());
        assert!(error.to_string().contains("connection refused"));

        let error = CacheError::CachedFailure {
            kind: "NotFound".to_string(),
            message: "user 42 missing".to_string(),
        };
        assert!(error.to_string().contains("NotFound"));
        assert!(error.to_string().contains("user 42 missing"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "boom".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "boom".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));
    }
}
