//! Redis backend integration tests
//!
//! Require a running Redis reachable through `REDIS_URL` (default
//! `redis://localhost:6379/0`); run with `--ignored` when one is available.

#![cfg(feature = "redis-backend")]

use depcache::backend::{AsyncRedisBackend, RedisBackend};
use depcache::{AsyncStorageBackend, KeyTtl, RedisConfig, StorageBackend};
use std::collections::HashSet;
use std::time::Duration;

fn test_config() -> RedisConfig {
    RedisConfig::from_env()
}

fn deps(tags: &[&str]) -> HashSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

#[test]
#[ignore = "requires a running Redis"]
fn redis_set_get_invalidate() {
    let backend = RedisBackend::new("rt-sync", &test_config()).unwrap();
    backend.clear("*").unwrap();

    backend
        .set("a", b"1", Some(Duration::from_secs(60)), &deps(&["user:1"]))
        .unwrap();
    backend
        .set("b", b"2", Some(Duration::from_secs(60)), &deps(&["user:1"]))
        .unwrap();

    assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));
    assert!(backend.exists("b").unwrap());
    assert!(matches!(backend.ttl("a").unwrap(), KeyTtl::Remaining(_)));

    assert_eq!(backend.invalidate_dependency("user:1").unwrap(), 2);
    assert_eq!(backend.get("a").unwrap(), None);
    assert_eq!(backend.invalidate_dependency("user:1").unwrap(), 0);
}

#[test]
#[ignore = "requires a running Redis"]
fn redis_clear_pattern() {
    let backend = RedisBackend::new("rt-clear", &test_config()).unwrap();
    backend.clear("*").unwrap();

    backend
        .set("user:1", b"a", Some(Duration::from_secs(60)), &HashSet::new())
        .unwrap();
    backend
        .set("user:2", b"b", Some(Duration::from_secs(60)), &HashSet::new())
        .unwrap();
    backend
        .set("org:1", b"c", Some(Duration::from_secs(60)), &HashSet::new())
        .unwrap();

    assert_eq!(backend.clear("user:*").unwrap(), 2);
    assert!(backend.exists("org:1").unwrap());
    assert_eq!(backend.clear("*").unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redis_async_round_trip() {
    let backend = AsyncRedisBackend::connect("rt-async", &test_config())
        .await
        .unwrap();
    backend.clear("*").await.unwrap();

    backend
        .set("k", b"v", Some(Duration::from_secs(60)), &deps(&["tag"]))
        .await
        .unwrap();
    assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

    assert_eq!(backend.invalidate_dependency("tag").await.unwrap(), 1);
    assert_eq!(backend.get("k").await.unwrap(), None);
    backend.close().await.unwrap();
}

#[test]
#[ignore = "requires a running Redis"]
fn redis_dependency_index_outlives_shorter_entries() {
    let backend = RedisBackend::new("rt-ttl", &test_config()).unwrap();
    backend.clear("*").unwrap();

    backend
        .set("short", b"1", Some(Duration::from_secs(10)), &deps(&["t"]))
        .unwrap();
    backend
        .set("long", b"2", Some(Duration::from_secs(120)), &deps(&["t"]))
        .unwrap();

    // Both entries are still covered by the tag.
    assert_eq!(backend.invalidate_dependency("t").unwrap(), 2);
}
