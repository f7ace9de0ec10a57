//! # depcache
//!
//! Function-result caching with logical dependency tracking. Results are
//! stored under deterministic keys derived from the function identity and its
//! arguments, tagged with opaque dependency strings, and evicted in bulk when
//! a tag is invalidated; there is no need to know which keys a piece of data
//! ended up under.
//!
//! ## Features
//!
//! - **Dependency tags**: attach tags while computing, invalidate by tag later
//! - **Automatic collection**: nested cached calls fold their tags into the
//!   enclosing call's entry
//! - **Multiple scopes**: named managers isolate invalidation domains, with
//!   cross-manager tag targeting
//! - **Failure caching**: selected errors are stored and replayed instead of
//!   recomputed
//! - **Sync and async**: the same protocol over blocking and async storage
//!   backends, with Redis and in-memory implementations
//! - **Events**: subscribe to hits, misses, sets and invalidations, or plug in
//!   the bundled stats collector
//!
//! ## Example
//!
//! ```
//! use depcache::{
//!     CacheConfig, CacheContext, CachedCall, CacheManager, KeySpec, MemoryBackend,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(MemoryBackend::new("app"));
//! let manager = depcache::registry::register(CacheManager::new(
//!     CacheConfig::new("app"),
//!     Some(backend),
//!     None,
//! )?);
//!
//! let ctx = CacheContext::new();
//! let fetch_user: CachedCall = CachedCall::new("app::fetch_user").manager("app");
//!
//! let name: String = fetch_user.run(&ctx, KeySpec::new().arg(&42u64), |ctx| {
//!     ctx.record_dependency("user:42")?;
//!     Ok("Ada".to_string())
//! })?;
//! assert_eq!(name, "Ada");
//!
//! // Editing user 42 evicts every entry tagged with it.
//! manager.invalidate_dependency("user:42")?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cached;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod key;
pub mod manager;
pub mod registry;
pub mod serialize;

pub use backend::{AsyncMemoryBackend, AsyncStorageBackend, KeyTtl, MemoryBackend, StorageBackend};
#[cfg(feature = "redis-backend")]
pub use backend::{AsyncRedisBackend, RedisBackend};
pub use cached::{CachedCall, CallOutcome};
pub use config::{CacheConfig, RedisConfig, DEFAULT_MANAGER_NAME};
pub use context::{CacheContext, ClosedFrame, DependencyMap, FrameGuard};
pub use error::{CacheError, Result};
pub use events::{
    CacheEvent, CacheEventKind, CacheStats, EventEmitter, StatsCollector, SubscriptionId,
};
pub use key::{generate as generate_key, KeyPart, KeySpec};
pub use manager::CacheManager;
pub use serialize::{CacheableError, CachedFailure, Envelope, JsonSerializer, Serializer};
