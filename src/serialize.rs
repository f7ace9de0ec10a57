//! Serialization port and payload envelope
//!
//! Stored payloads are wrapped in an [`Envelope`]: either a successful value
//! or a failure marker recording what went wrong, so that a cached failure can
//! be replayed to later callers without re-executing the computation. The
//! [`Serializer`] trait is the pluggable codec boundary; [`JsonSerializer`] is
//! the default text codec.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stored payload: a value or a failure marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A successfully computed value.
    Value {
        /// JSON rendering of the value.
        data: serde_json::Value,
    },

    /// A failure captured at compute time.
    Failure {
        /// Stable identifier of the failure kind, used for reconstruction.
        kind: String,
        /// Manager name the failure was stored under, kept for diagnostics.
        scope: String,
        /// Human-readable message.
        message: String,
    },
}

impl Envelope {
    /// Wrap a serializable value.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        let data =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(Envelope::Value { data })
    }

    /// Whether this envelope holds a failure marker.
    pub fn is_failure(&self) -> bool {
        matches!(self, Envelope::Failure { .. })
    }
}

/// Pluggable codec for stored envelopes.
pub trait Serializer: Send + Sync {
    /// Encode an envelope to bytes.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    /// Decode bytes back into an envelope.
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Default JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

/// Application errors that can be cached and later revived.
///
/// On a cache hit over a failure marker, [`reconstruct`](Self::reconstruct)
/// rebuilds the error from its recorded kind and message. Implementations
/// return the matching variant when the kind is recognized, or a catch-all
/// variant otherwise; the degraded case is still a successful reconstruction,
/// not an error.
pub trait CacheableError: std::error::Error + From<CacheError> + Sized {
    /// Stable identifier for this error, recorded in the failure marker.
    fn failure_kind(&self) -> String {
        short_type_name(std::any::type_name::<Self>()).to_string()
    }

    /// Message recorded in the failure marker.
    fn failure_message(&self) -> String {
        self.to_string()
    }

    /// Rebuild the error from a stored failure marker.
    fn reconstruct(kind: &str, message: &str) -> Self;
}

fn short_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

/// Generic revived failure, used when no richer error type is available.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CachedFailure {
    /// Recorded failure kind.
    pub kind: String,
    /// Recorded message.
    pub message: String,
}

impl CachedFailure {
    /// Create a failure marker value.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<CacheError> for CachedFailure {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::CachedFailure { kind, message } => Self { kind, message },
            other => Self {
                kind: "cache_error".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl CacheableError for CachedFailure {
    fn failure_kind(&self) -> String {
        self.kind.clone()
    }

    fn failure_message(&self) -> String {
        self.message.clone()
    }

    fn reconstruct(kind: &str, message: &str) -> Self {
        Self::new(kind, message)
    }
}
