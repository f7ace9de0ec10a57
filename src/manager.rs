//! Cache manager
//!
//! A [`CacheManager`] binds a name, a configuration, a storage backend and a
//! serializer into one invalidation scope. Managers are cheap to share behind
//! an `Arc` and expose a blocking and an async surface over the same storage;
//! when only a blocking backend is configured, the async surface falls back to
//! it with a warning so callers keep working.
//!
//! Managers deal in typed values; the envelope wrapping and failure markers
//! from [`crate::serialize`] are an internal concern of this module.

use crate::backend::{AsyncStorageBackend, KeyTtl, StorageBackend};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, CacheEventKind, EventEmitter};
use crate::serialize::{Envelope, JsonSerializer, Serializer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One named invalidation scope over a storage backend.
pub struct CacheManager {
    config: CacheConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    async_backend: Option<Arc<dyn AsyncStorageBackend>>,
    serializer: Arc<dyn Serializer>,
    events: EventEmitter,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("name", &self.config.name)
            .field("enabled", &self.config.enabled)
            .field("has_backend", &self.backend.is_some())
            .field("has_async_backend", &self.async_backend.is_some())
            .finish()
    }
}

impl CacheManager {
    /// Create a manager. At least one backend must be supplied.
    pub fn new(
        config: CacheConfig,
        backend: Option<Arc<dyn StorageBackend>>,
        async_backend: Option<Arc<dyn AsyncStorageBackend>>,
    ) -> Result<Self> {
        config.validate().map_err(CacheError::Config)?;
        if backend.is_none() && async_backend.is_none() {
            return Err(CacheError::Config(
                "cache manager requires a storage backend".to_string(),
            ));
        }

        let events = EventEmitter::new(config.callback_error_silent);
        Ok(Self {
            config,
            backend,
            async_backend,
            serializer: Arc::new(JsonSerializer),
            events,
        })
    }

    /// Replace the payload codec.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Manager name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Manager configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Event emitter for subscribing to this manager's activity.
    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn sync_backend(&self) -> Result<&Arc<dyn StorageBackend>> {
        self.backend.as_ref().ok_or_else(|| {
            CacheError::Config("no blocking storage backend configured".to_string())
        })
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.config.default_ttl)
            .map(|base| self.config.ttl_with_jitter(base))
    }

    /// Decode stored bytes; undecodable payloads degrade to a miss.
    fn decode(&self, key: &str, bytes: &[u8]) -> Option<Envelope> {
        match self.serializer.decode(bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache payload");
                None
            }
        }
    }

    /// Turn a decoded envelope into the caller's value.
    ///
    /// A failure marker surfaces as [`CacheError::CachedFailure`]; a stored
    /// value that no longer matches the requested type degrades to a miss.
    fn open_envelope<T: DeserializeOwned>(&self, key: &str, envelope: Envelope) -> Result<Option<T>> {
        match envelope {
            Envelope::Failure { kind, message, .. } => {
                self.events
                    .emit(&CacheEvent::new(CacheEventKind::Hit, key));
                Err(CacheError::CachedFailure { kind, message })
            }
            Envelope::Value { data } => match serde_json::from_value(data) {
                Ok(value) => {
                    self.events
                        .emit(&CacheEvent::new(CacheEventKind::Hit, key));
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(key, error = %e, "cached value does not match requested type");
                    self.events
                        .emit(&CacheEvent::new(CacheEventKind::Miss, key));
                    Ok(None)
                }
            },
        }
    }

    fn emit_miss(&self, key: &str) {
        self.events
            .emit(&CacheEvent::new(CacheEventKind::Miss, key));
    }

    // ==================== Blocking surface ====================

    /// Look up a typed value. `Ok(None)` is a miss; a stored failure marker
    /// surfaces as [`CacheError::CachedFailure`].
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let Some(bytes) = self.sync_backend()?.get(key)? else {
            self.emit_miss(key);
            return Ok(None);
        };
        let Some(envelope) = self.decode(key, &bytes) else {
            self.emit_miss(key);
            return Ok(None);
        };
        self.open_envelope(key, envelope)
    }

    /// Store a typed value with optional TTL and dependency tags.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let envelope = Envelope::from_value(value)?;
        self.store(key, &envelope, ttl, dependencies)
    }

    /// Store a failure marker so later lookups replay the error.
    pub fn set_failure(
        &self,
        key: &str,
        kind: &str,
        message: &str,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let envelope = Envelope::Failure {
            kind: kind.to_string(),
            scope: self.config.name.clone(),
            message: message.to_string(),
        };
        self.store(key, &envelope, ttl, dependencies)
    }

    fn store(
        &self,
        key: &str,
        envelope: &Envelope,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        let bytes = self.serializer.encode(envelope)?;
        let ttl = self.effective_ttl(ttl);
        self.sync_backend()?.set(key, &bytes, ttl, dependencies)?;

        debug!(
            manager = %self.config.name,
            key,
            dependencies = dependencies.len(),
            "stored cache entry"
        );
        self.events.emit(
            &CacheEvent::new(CacheEventKind::Set, key)
                .with_dependencies(dependencies.clone())
                .with_ttl(ttl),
        );
        Ok(())
    }

    /// Delete entries by key; returns how many existed.
    pub fn delete(&self, keys: &[&str]) -> Result<u64> {
        let removed = self.sync_backend()?.delete(keys)?;
        for key in keys {
            self.events
                .emit(&CacheEvent::new(CacheEventKind::Delete, *key).with_count(removed));
        }
        Ok(removed)
    }

    /// Delete entries matching a glob pattern; returns how many were removed.
    pub fn clear(&self, pattern: &str) -> Result<u64> {
        let removed = self.sync_backend()?.clear(pattern)?;
        self.events
            .emit(&CacheEvent::new(CacheEventKind::Clear, pattern).with_count(removed));
        Ok(removed)
    }

    /// Evict every entry attached to a dependency tag.
    pub fn invalidate_dependency(&self, tag: &str) -> Result<u64> {
        let removed = self.sync_backend()?.invalidate_dependency(tag)?;
        info!(manager = %self.config.name, tag, removed, "invalidated dependency");
        self.events
            .emit(&CacheEvent::new(CacheEventKind::Invalidate, tag).with_count(removed));
        Ok(removed)
    }

    /// Whether a live entry exists under the key.
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.sync_backend()?.exists(key)
    }

    /// Remaining lifetime of the entry under the key.
    pub fn entry_ttl(&self, key: &str) -> Result<KeyTtl> {
        self.sync_backend()?.ttl(key)
    }

    // ==================== Async surface ====================

    fn fallback_to_sync(&self) -> Result<&Arc<dyn StorageBackend>> {
        warn!(
            manager = %self.config.name,
            "no async backend configured, falling back to blocking backend"
        );
        self.sync_backend()
    }

    /// Async counterpart of [`get`](Self::get).
    pub async fn get_async<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let bytes = match &self.async_backend {
            Some(backend) => backend.get(key).await?,
            None => self.fallback_to_sync()?.get(key)?,
        };
        let Some(bytes) = bytes else {
            self.emit_miss(key);
            return Ok(None);
        };
        let Some(envelope) = self.decode(key, &bytes) else {
            self.emit_miss(key);
            return Ok(None);
        };
        self.open_envelope(key, envelope)
    }

    /// Async counterpart of [`set`](Self::set).
    pub async fn set_async<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let envelope = Envelope::from_value(value)?;
        self.store_async(key, &envelope, ttl, dependencies).await
    }

    /// Async counterpart of [`set_failure`](Self::set_failure).
    pub async fn set_failure_async(
        &self,
        key: &str,
        kind: &str,
        message: &str,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let envelope = Envelope::Failure {
            kind: kind.to_string(),
            scope: self.config.name.clone(),
            message: message.to_string(),
        };
        self.store_async(key, &envelope, ttl, dependencies).await
    }

    async fn store_async(
        &self,
        key: &str,
        envelope: &Envelope,
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        let bytes = self.serializer.encode(envelope)?;
        let ttl = self.effective_ttl(ttl);
        match &self.async_backend {
            Some(backend) => backend.set(key, &bytes, ttl, dependencies).await?,
            None => self.fallback_to_sync()?.set(key, &bytes, ttl, dependencies)?,
        }

        debug!(
            manager = %self.config.name,
            key,
            dependencies = dependencies.len(),
            "stored cache entry"
        );
        self.events.emit(
            &CacheEvent::new(CacheEventKind::Set, key)
                .with_dependencies(dependencies.clone())
                .with_ttl(ttl),
        );
        Ok(())
    }

    /// Async counterpart of [`delete`](Self::delete).
    pub async fn delete_async(&self, keys: &[&str]) -> Result<u64> {
        let removed = match &self.async_backend {
            Some(backend) => backend.delete(keys).await?,
            None => self.fallback_to_sync()?.delete(keys)?,
        };
        for key in keys {
            self.events
                .emit(&CacheEvent::new(CacheEventKind::Delete, *key).with_count(removed));
        }
        Ok(removed)
    }

    /// Async counterpart of [`clear`](Self::clear).
    pub async fn clear_async(&self, pattern: &str) -> Result<u64> {
        let removed = match &self.async_backend {
            Some(backend) => backend.clear(pattern).await?,
            None => self.fallback_to_sync()?.clear(pattern)?,
        };
        self.events
            .emit(&CacheEvent::new(CacheEventKind::Clear, pattern).with_count(removed));
        Ok(removed)
    }

    /// Async counterpart of [`invalidate_dependency`](Self::invalidate_dependency).
    pub async fn invalidate_dependency_async(&self, tag: &str) -> Result<u64> {
        let removed = match &self.async_backend {
            Some(backend) => backend.invalidate_dependency(tag).await?,
            None => self.fallback_to_sync()?.invalidate_dependency(tag)?,
        };
        info!(manager = %self.config.name, tag, removed, "invalidated dependency");
        self.events
            .emit(&CacheEvent::new(CacheEventKind::Invalidate, tag).with_count(removed));
        Ok(removed)
    }

    /// Async counterpart of [`exists`](Self::exists).
    pub async fn exists_async(&self, key: &str) -> Result<bool> {
        match &self.async_backend {
            Some(backend) => backend.exists(key).await,
            None => self.fallback_to_sync()?.exists(key),
        }
    }

    /// Async counterpart of [`entry_ttl`](Self::entry_ttl).
    pub async fn entry_ttl_async(&self, key: &str) -> Result<KeyTtl> {
        match &self.async_backend {
            Some(backend) => backend.ttl(key).await,
            None => self.fallback_to_sync()?.ttl(key),
        }
    }

    /// Release backend connections, if the async backend holds any.
    pub async fn close(&self) -> Result<()> {
        if let Some(backend) = &self.async_backend {
            backend.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn manager(config: CacheConfig) -> CacheManager {
        let backend = Arc::new(MemoryBackend::new(config.name.clone()));
        CacheManager::new(config, Some(backend), None).unwrap()
    }

    fn deps(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_requires_backend() {
        let result = CacheManager::new(CacheConfig::default(), None, None);
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_typed_round_trip() {
        let m = manager(CacheConfig::new("t-roundtrip"));
        m.set("k", &vec![1u32, 2, 3], None, &HashSet::new()).unwrap();

        let value: Option<Vec<u32>> = m.get("k").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));

        let missing: Option<Vec<u32>> = m.get("absent").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_type_mismatch_is_miss() {
        let m = manager(CacheConfig::new("t-mismatch"));
        m.set("k", &"text", None, &HashSet::new()).unwrap();

        let value: Option<u64> = m.get("k").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_failure_marker_replays() {
        let m = manager(CacheConfig::new("t-failure"));
        m.set_failure("k", "NotFound", "user 42 missing", None, &HashSet::new())
            .unwrap();

        let result: Result<Option<String>> = m.get("k");
        let Err(CacheError::CachedFailure { kind, message }) = result else {
            panic!("expected cached failure");
        };
        assert_eq!(kind, "NotFound");
        assert_eq!(message, "user 42 missing");
    }

    #[test]
    fn test_invalidate_dependency() {
        let m = manager(CacheConfig::new("t-invalidate"));
        m.set("a", &1u32, None, &deps(&["user:1"])).unwrap();
        m.set("b", &2u32, None, &deps(&["user:1"])).unwrap();
        m.set("c", &3u32, None, &deps(&["user:2"])).unwrap();

        assert_eq!(m.invalidate_dependency("user:1").unwrap(), 2);
        assert_eq!(m.get::<u32>("a").unwrap(), None);
        assert_eq!(m.get::<u32>("c").unwrap(), Some(3));
    }

    #[test]
    fn test_disabled_manager() {
        let config = CacheConfig::builder().name("t-disabled").enabled(false).build();
        let m = manager(config);

        m.set("k", &1u32, None, &HashSet::new()).unwrap();
        assert_eq!(m.get::<u32>("k").unwrap(), None);
    }

    #[test]
    fn test_default_ttl_applied() {
        let config = CacheConfig::builder()
            .name("t-ttl")
            .default_ttl(Duration::from_secs(60))
            .build();
        let m = manager(config);

        m.set("k", &1u32, None, &HashSet::new()).unwrap();
        assert!(matches!(m.entry_ttl("k").unwrap(), KeyTtl::Remaining(_)));

        m.set("explicit", &1u32, Some(Duration::from_secs(600)), &HashSet::new())
            .unwrap();
        let KeyTtl::Remaining(remaining) = m.entry_ttl("explicit").unwrap() else {
            panic!("expected remaining ttl");
        };
        assert!(remaining > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_async_falls_back_to_blocking_backend() {
        let m = manager(CacheConfig::new("t-fallback"));
        m.set_async("k", &7u32, None, &HashSet::new()).await.unwrap();
        assert_eq!(m.get_async::<u32>("k").await.unwrap(), Some(7));
        assert_eq!(m.get::<u32>("k").unwrap(), Some(7));
    }

    #[test]
    fn test_events_emitted() {
        use crate::events::StatsCollector;

        let m = manager(CacheConfig::new("t-events"));
        let stats = StatsCollector::new();
        m.events().on_all(stats.callback());

        m.set("k", &1u32, None, &HashSet::new()).unwrap();
        let _: Option<u32> = m.get("k").unwrap();
        let _: Option<u32> = m.get("absent").unwrap();
        m.invalidate_dependency("tag").unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.invalidations, 1);
    }
}
