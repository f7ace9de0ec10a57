//! In-memory storage backend
//!
//! Process-local backend used in tests and single-process deployments. TTL
//! enforcement is lazy: expired entries are purged when a read touches them,
//! not by a background sweeper.

use super::{cache_key, deps_key, glob_match, AsyncStorageBackend, KeyTtl, StorageBackend};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, StoredEntry>,
    dependencies: HashMap<String, HashSet<String>>,
}

/// Blocking in-memory backend.
#[derive(Debug)]
pub struct MemoryBackend {
    prefix: String,
    store: Mutex<Store>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("cache")
    }
}

impl MemoryBackend {
    /// Create a backend namespaced by the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            store: Mutex::new(Store::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live entries, for tests and diagnostics.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the backend holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_if_expired(store: &mut Store, storage_key: &str, now: DateTime<Utc>) {
        let expired = store
            .entries
            .get(storage_key)
            .is_some_and(|e| e.is_expired(now));
        if expired {
            store.entries.remove(storage_key);
            Self::detach_from_index(store, storage_key);
        }
    }

    /// Drop a removed entry's key from every tag set, and drop emptied sets.
    fn detach_from_index(store: &mut Store, storage_key: &str) {
        store.dependencies.retain(|_, keys| {
            keys.remove(storage_key);
            !keys.is_empty()
        });
    }
}

impl StorageBackend for MemoryBackend {
    fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        let storage_key = cache_key(&self.prefix, key);
        let expires_at = ttl.and_then(|d| {
            chrono::TimeDelta::from_std(d)
                .ok()
                .map(|delta| Utc::now() + delta)
        });

        let mut store = self.lock();
        store.entries.insert(
            storage_key.clone(),
            StoredEntry {
                payload: payload.to_vec(),
                expires_at,
            },
        );
        for tag in dependencies {
            store
                .dependencies
                .entry(tag.clone())
                .or_default()
                .insert(storage_key.clone());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let storage_key = cache_key(&self.prefix, key);
        let now = Utc::now();

        let mut store = self.lock();
        Self::purge_if_expired(&mut store, &storage_key, now);
        Ok(store.entries.get(&storage_key).map(|e| e.payload.clone()))
    }

    fn delete(&self, keys: &[&str]) -> Result<u64> {
        let mut store = self.lock();
        let mut removed = 0u64;
        for key in keys {
            let storage_key = cache_key(&self.prefix, key);
            if store.entries.remove(&storage_key).is_some() {
                Self::detach_from_index(&mut store, &storage_key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn clear(&self, pattern: &str) -> Result<u64> {
        let full_pattern = cache_key(&self.prefix, pattern);
        let mut store = self.lock();
        let matching: Vec<String> = store
            .entries
            .keys()
            .filter(|k| glob_match(&full_pattern, k))
            .cloned()
            .collect();
        for key in &matching {
            store.entries.remove(key);
            Self::detach_from_index(&mut store, key);
        }
        Ok(matching.len() as u64)
    }

    fn invalidate_dependency(&self, tag: &str) -> Result<u64> {
        let mut store = self.lock();
        let Some(keys) = store.dependencies.remove(tag) else {
            return Ok(0);
        };
        let mut removed = 0u64;
        for storage_key in keys {
            if store.entries.remove(&storage_key).is_some() {
                removed += 1;
            }
            // The key may still sit in other tags' sets.
            Self::detach_from_index(&mut store, &storage_key);
        }
        Ok(removed)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = cache_key(&self.prefix, key);
        let now = Utc::now();

        let mut store = self.lock();
        Self::purge_if_expired(&mut store, &storage_key, now);
        Ok(store.entries.contains_key(&storage_key))
    }

    fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let storage_key = cache_key(&self.prefix, key);
        let now = Utc::now();

        let mut store = self.lock();
        Self::purge_if_expired(&mut store, &storage_key, now);
        let Some(entry) = store.entries.get(&storage_key) else {
            return Ok(KeyTtl::Missing);
        };
        match entry.expires_at {
            None => Ok(KeyTtl::Persistent),
            Some(at) => {
                let remaining = (at - now).to_std().unwrap_or(Duration::ZERO);
                Ok(KeyTtl::Remaining(remaining))
            }
        }
    }
}

/// Async facade over [`MemoryBackend`].
///
/// Operations are in-memory and never block meaningfully, so the async
/// methods simply delegate to the blocking implementation.
#[derive(Debug, Clone)]
pub struct AsyncMemoryBackend {
    inner: Arc<MemoryBackend>,
}

impl Default for AsyncMemoryBackend {
    fn default() -> Self {
        Self::new("cache")
    }
}

impl AsyncMemoryBackend {
    /// Create a backend namespaced by the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryBackend::new(prefix)),
        }
    }

    /// Share an existing blocking backend's storage.
    pub fn from_backend(inner: Arc<MemoryBackend>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AsyncStorageBackend for AsyncMemoryBackend {
    async fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        self.inner.set(key, payload, ttl, dependencies)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64> {
        self.inner.delete(keys)
    }

    async fn clear(&self, pattern: &str) -> Result<u64> {
        self.inner.clear(pattern)
    }

    async fn invalidate_dependency(&self, tag: &str) -> Result<u64> {
        self.inner.invalidate_dependency(tag)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.ttl(key)
    }
}
