//! Redis storage backend
//!
//! Entries live under `"{prefix}:{key}"`; each dependency tag owns a set at
//! `"{prefix}:deps:{tag}"` listing the storage keys it covers. Tag sets are
//! given an expiry at least as long as the longest entry attached to them, so
//! the reverse index never outlives its last useful entry by much.
//!
//! [`RedisBackend`] opens a short-lived connection per operation off a shared
//! [`redis::Client`]; [`AsyncRedisBackend`] multiplexes over a
//! [`ConnectionManager`] that reconnects transparently.

use super::{cache_key, deps_key, AsyncStorageBackend, KeyTtl, StorageBackend};
use crate::config::RedisConfig;
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Commands};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

const SCAN_BATCH: usize = 100;

/// SETEX rejects a zero expiry, so sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn ttl_from_seconds(seconds: i64) -> KeyTtl {
    match seconds {
        -2 => KeyTtl::Missing,
        -1 => KeyTtl::Persistent,
        n => KeyTtl::Remaining(Duration::from_secs(n.max(0) as u64)),
    }
}

/// Blocking Redis backend.
pub struct RedisBackend {
    prefix: String,
    client: redis::Client,
}

impl RedisBackend {
    /// Connect settings are validated lazily; this only parses the URL.
    pub fn new(prefix: impl Into<String>, config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())?;
        Ok(Self {
            prefix: prefix.into(),
            client,
        })
    }

    /// Build from `REDIS_*` environment variables.
    pub fn from_env(prefix: impl Into<String>) -> Result<Self> {
        Self::new(prefix, &RedisConfig::from_env())
    }

    fn connection(&self) -> Result<redis::Connection> {
        Ok(self.client.get_connection()?)
    }

    fn scan_keys(con: &mut redis::Connection, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(con)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

impl StorageBackend for RedisBackend {
    fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.connection()?;

        match ttl {
            Some(ttl) => con.set_ex::<_, _, ()>(&storage_key, payload, ttl_seconds(ttl))?,
            None => con.set::<_, _, ()>(&storage_key, payload)?,
        }

        for tag in dependencies {
            let index_key = deps_key(&self.prefix, tag);
            con.sadd::<_, _, ()>(&index_key, &storage_key)?;
            if let Some(ttl) = ttl {
                // Keep the index alive at least as long as its longest entry.
                let secs = ttl_seconds(ttl) as i64;
                let current: i64 = con.ttl(&index_key)?;
                if current < secs {
                    con.expire::<_, ()>(&index_key, secs)?;
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.connection()?;
        Ok(con.get(&storage_key)?)
    }

    fn delete(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let storage_keys: Vec<String> = keys.iter().map(|k| cache_key(&self.prefix, k)).collect();
        let mut con = self.connection()?;
        Ok(con.del(&storage_keys)?)
    }

    fn clear(&self, pattern: &str) -> Result<u64> {
        let full_pattern = cache_key(&self.prefix, pattern);
        let mut con = self.connection()?;

        let keys = Self::scan_keys(&mut con, &full_pattern)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = con.del(&keys)?;
        debug!(pattern = %full_pattern, removed, "cleared cache entries");
        Ok(removed)
    }

    fn invalidate_dependency(&self, tag: &str) -> Result<u64> {
        let index_key = deps_key(&self.prefix, tag);
        let mut con = self.connection()?;

        let keys: Vec<String> = con.smembers(&index_key)?;
        let removed = if keys.is_empty() {
            0
        } else {
            con.del(&keys)?
        };
        con.del::<_, ()>(&index_key)?;
        debug!(tag, removed, "invalidated dependency");
        Ok(removed)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.connection()?;
        Ok(con.exists(&storage_key)?)
    }

    fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.connection()?;
        let seconds: i64 = con.ttl(&storage_key)?;
        Ok(ttl_from_seconds(seconds))
    }
}

/// Async Redis backend over a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct AsyncRedisBackend {
    prefix: String,
    manager: ConnectionManager,
}

impl AsyncRedisBackend {
    /// Establish the managed connection.
    pub async fn connect(prefix: impl Into<String>, config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            prefix: prefix.into(),
            manager,
        })
    }

    /// Build from `REDIS_*` environment variables.
    pub async fn connect_from_env(prefix: impl Into<String>) -> Result<Self> {
        Self::connect(prefix, &RedisConfig::from_env()).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl AsyncStorageBackend for AsyncRedisBackend {
    async fn set(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        dependencies: &HashSet<String>,
    ) -> Result<()> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.manager.clone();

        match ttl {
            Some(ttl) => {
                con.set_ex::<_, _, ()>(&storage_key, payload, ttl_seconds(ttl))
                    .await?
            }
            None => con.set::<_, _, ()>(&storage_key, payload).await?,
        }

        for tag in dependencies {
            let index_key = deps_key(&self.prefix, tag);
            con.sadd::<_, _, ()>(&index_key, &storage_key).await?;
            if let Some(ttl) = ttl {
                let secs = ttl_seconds(ttl) as i64;
                let current: i64 = con.ttl(&index_key).await?;
                if current < secs {
                    con.expire::<_, ()>(&index_key, secs).await?;
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.manager.clone();
        Ok(con.get(&storage_key).await?)
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let storage_keys: Vec<String> = keys.iter().map(|k| cache_key(&self.prefix, k)).collect();
        let mut con = self.manager.clone();
        Ok(con.del(&storage_keys).await?)
    }

    async fn clear(&self, pattern: &str) -> Result<u64> {
        let full_pattern = cache_key(&self.prefix, pattern);
        let keys = self.scan_keys(&full_pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.manager.clone();
        let removed: u64 = con.del(&keys).await?;
        debug!(pattern = %full_pattern, removed, "cleared cache entries");
        Ok(removed)
    }

    async fn invalidate_dependency(&self, tag: &str) -> Result<u64> {
        let index_key = deps_key(&self.prefix, tag);
        let mut con = self.manager.clone();

        let keys: Vec<String> = con.smembers(&index_key).await?;
        let removed = if keys.is_empty() {
            0
        } else {
            con.del(&keys).await?
        };
        con.del::<_, ()>(&index_key).await?;
        debug!(tag, removed, "invalidated dependency");
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.manager.clone();
        Ok(con.exists(&storage_key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let storage_key = cache_key(&self.prefix, key);
        let mut con = self.manager.clone();
        let seconds: i64 = con.ttl(&storage_key).await?;
        Ok(ttl_from_seconds(seconds))
    }
}
