//! Storage backend ports
//!
//! A backend stores opaque payload bytes under string keys and maintains the
//! reverse index from dependency tags to the keys they cover. Two traits cover
//! the two execution models: [`StorageBackend`] for blocking callers and
//! [`AsyncStorageBackend`] for async callers. Both speak the same contract:
//!
//! - `set` attaches the entry to every given tag in the reverse index
//! - `invalidate_dependency` deletes every key attached to a tag, then the
//!   tag's index itself, and reports how many entries were removed
//! - an invalidation that races a concurrent `set` of the same key may evict
//!   the freshly written entry; eviction winning over the write is the
//!   accepted outcome
//!
//! Backends namespace their storage with a prefix so several applications can
//! share one store.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::{AsyncMemoryBackend, MemoryBackend};
#[cfg(feature = "redis-backend")]
pub use redis::{AsyncRedisBackend, RedisBackend};

/// Storage key for a cache entry.
pub(crate) fn cache_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Storage key for a dependency tag's reverse index.
pub(crate) fn deps_key(prefix: &str, tag: &str) -> String {
    format!("{}:deps:{}", prefix, tag)
}

/// Remaining lifetime of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// No entry stored under the key.
    Missing,
    /// Entry stored without an expiry.
    Persistent,
    /// Entry expires after this duration.
    Remaining(Duration),
}

/// Blocking storage port.
pub trait StorageBackend: Send + Sync {
    /// Store a payload, optionally expiring, attached to dependency tags.
    fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()>;

    /// Fetch a payload; `None` when absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete entries by key; returns how many existed.
    fn delete(&self, keys: &[&str]) -> Result<u64>;

    /// Delete entries whose un-prefixed key matches a glob pattern; returns
    /// how many were removed.
    fn clear(&self, pattern: &str) -> Result<u64>;

    /// Evict every entry attached to a tag and drop the tag's index;
    /// returns how many entries were removed.
    fn invalidate_dependency(&self, tag: &str) -> Result<u64>;

    /// Whether a live entry exists under the key.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime of the entry under the key.
    fn ttl(&self, key: &str) -> Result<KeyTtl>;
}

/// Non-blocking storage port; same contract as [`StorageBackend`].
#[async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    /// Store a payload, optionally expiring, attached to dependency tags.
    async fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()>;

    /// Fetch a payload; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete entries by key; returns how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64>;

    /// Delete entries whose un-prefixed key matches a glob pattern; returns
    /// how many were removed.
    async fn clear(&self, pattern: &str) -> Result<u64>;

    /// Evict every entry attached to a tag and drop the tag's index;
    /// returns how many entries were removed.
    async fn invalidate_dependency(&self, tag: &str) -> Result<u64>;

    /// Whether a live entry exists under the key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime of the entry under the key.
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Release held connections. Default is a no-op.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Glob-style pattern match supporting `*` and `?`, used by in-memory `clear`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // Iterative wildcard matching with single-star backtracking.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_composition() {
        assert_eq!(cache_key("app", "abc"), "app:abc");
        assert_eq!(deps_key("app", "user:1"), "app:deps:user:1");
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("user:*", "user:42"));
        assert!(!glob_match("user:*", "session:42"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*:42", "user:42"));
        assert!(glob_match("u*r:*", "user:42"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }
}
