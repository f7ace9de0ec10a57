//! Process-wide manager registry
//!
//! Cached calls refer to managers by name; the registry resolves those names
//! to shared [`CacheManager`] instances. Creation is idempotent: the first
//! registration under a name wins and later lookups return the same instance,
//! so call sites never race to configure the same scope twice.

use crate::config::{CacheConfig, DEFAULT_MANAGER_NAME};
use crate::error::Result;
use crate::manager::CacheManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<CacheManager>>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, HashMap<String, Arc<CacheManager>>> {
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[cfg(feature = "redis-backend")]
fn create_default(name: &str) -> Result<CacheManager> {
    use crate::backend::RedisBackend;

    let config = CacheConfig {
        name: name.to_string(),
        ..CacheConfig::from_env()
    };
    let backend = Arc::new(RedisBackend::from_env(name)?);
    CacheManager::new(config, Some(backend), None)
}

#[cfg(not(feature = "redis-backend"))]
fn create_default(name: &str) -> Result<CacheManager> {
    use crate::backend::MemoryBackend;

    let config = CacheConfig {
        name: name.to_string(),
        ..CacheConfig::from_env()
    };
    let backend = Arc::new(MemoryBackend::new(name));
    CacheManager::new(config, Some(backend), None)
}

/// Look up a manager by name, creating it with default settings on first use.
///
/// The default manager reads its configuration from the environment and
/// stores through Redis when the `redis-backend` feature is enabled, an
/// in-process map otherwise.
pub fn get_or_create(name: &str) -> Result<Arc<CacheManager>> {
    let mut managers = registry();
    if let Some(existing) = managers.get(name) {
        return Ok(existing.clone());
    }

    debug!(name, "creating cache manager with default settings");
    let manager = Arc::new(create_default(name)?);
    managers.insert(name.to_string(), manager.clone());
    Ok(manager)
}

/// The manager named [`DEFAULT_MANAGER_NAME`].
pub fn default_manager() -> Result<Arc<CacheManager>> {
    get_or_create(DEFAULT_MANAGER_NAME)
}

/// Register a fully configured manager under its own name.
///
/// If a manager with that name already exists, the existing one is kept and
/// returned; the first registration wins.
pub fn register(manager: CacheManager) -> Arc<CacheManager> {
    let mut managers = registry();
    if let Some(existing) = managers.get(manager.name()) {
        debug!(name = manager.name(), "manager already registered, keeping existing");
        return existing.clone();
    }

    let name = manager.name().to_string();
    let manager = Arc::new(manager);
    managers.insert(name, manager.clone());
    manager
}

/// Already-registered manager, if any. Never creates.
pub fn registered(name: &str) -> Option<Arc<CacheManager>> {
    registry().get(name).cloned()
}

/// Drop a manager from the registry; in-flight clones stay usable.
pub fn remove(name: &str) -> Option<Arc<CacheManager>> {
    registry().remove(name)
}

/// Drop every registered manager.
pub fn reset() {
    registry().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn memory_manager(name: &str) -> CacheManager {
        let backend = Arc::new(MemoryBackend::new(name));
        CacheManager::new(CacheConfig::new(name), Some(backend), None).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let name = "reg-lookup";
        let registered_manager = register(memory_manager(name));
        let found = registered(name).unwrap();
        assert!(Arc::ptr_eq(&registered_manager, &found));
        remove(name);
    }

    #[test]
    fn test_first_registration_wins() {
        let name = "reg-first-wins";
        let first = register(memory_manager(name));
        let second = register(memory_manager(name));
        assert!(Arc::ptr_eq(&first, &second));
        remove(name);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let name = "reg-idempotent";
        register(memory_manager(name));

        let a = get_or_create(name).unwrap();
        let b = get_or_create(name).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        remove(name);
    }

    #[test]
    fn test_remove() {
        let name = "reg-remove";
        register(memory_manager(name));
        assert!(remove(name).is_some());
        assert!(registered(name).is_none());
    }
}
