//! Cache event emission and statistics
//!
//! Features:
//! - Typed events for hits, misses, sets, deletes, invalidations and clears
//! - Callback subscription per event kind or for all kinds
//! - Panicking callbacks are contained and never disturb cache operations
//! - [`StatsCollector`] as a ready-made subscriber for hit-ratio tracking

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Kind of cache event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// A lookup found a stored entry
    Hit,
    /// A lookup found nothing usable
    Miss,
    /// An entry was written
    Set,
    /// One or more entries were deleted by key
    Delete,
    /// A dependency tag was invalidated
    Invalidate,
    /// A pattern clear removed entries
    Clear,
}

impl fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheEventKind::Hit => "hit",
            CacheEventKind::Miss => "miss",
            CacheEventKind::Set => "set",
            CacheEventKind::Delete => "delete",
            CacheEventKind::Invalidate => "invalidate",
            CacheEventKind::Clear => "clear",
        };
        write!(f, "{}", name)
    }
}

/// A single cache event
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// What happened.
    pub kind: CacheEventKind,
    /// Cache key, dependency tag or pattern the event refers to.
    pub key: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Dependency tags attached to a set.
    pub dependencies: Option<HashSet<String>>,
    /// TTL attached to a set.
    pub ttl: Option<Duration>,
    /// Number of entries affected by a delete, invalidate or clear.
    pub count: Option<u64>,
}

impl CacheEvent {
    /// Create an event for the given kind and key, stamped now.
    pub fn new(kind: CacheEventKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            timestamp: Utc::now(),
            dependencies: None,
            ttl: None,
            count: None,
        }
    }

    /// Attach dependency tags.
    pub fn with_dependencies(mut self, dependencies: HashSet<String>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    /// Attach a TTL.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Attach an affected-entry count.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }
}

/// Identifier of a registered callback, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Dispatches cache events to registered callbacks.
///
/// Callbacks run synchronously on the emitting thread. A panicking callback
/// is caught so the cache operation that triggered it still completes; the
/// panic is logged unless the emitter is silent.
pub struct EventEmitter {
    silent: bool,
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<CacheEventKind, Vec<(SubscriptionId, Callback)>>>,
    global: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EventEmitter {
    /// Create an emitter; `silent` controls whether callback panics are logged.
    pub fn new(silent: bool) -> Self {
        Self {
            silent,
            next_id: AtomicU64::new(1),
            by_kind: Mutex::new(HashMap::new()),
            global: Mutex::new(Vec::new()),
        }
    }

    fn lock_by_kind(
        &self,
    ) -> MutexGuard<'_, HashMap<CacheEventKind, Vec<(SubscriptionId, Callback)>>> {
        self.by_kind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_global(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to a single event kind.
    pub fn on(
        &self,
        kind: CacheEventKind,
        callback: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.lock_by_kind()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Subscribe to every event kind.
    pub fn on_all(&self, callback: impl Fn(&CacheEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.allocate_id();
        self.lock_global().push((id, Arc::new(callback)));
        id
    }

    /// Remove a kind-scoped subscription. Returns whether it existed.
    pub fn off(&self, kind: CacheEventKind, id: SubscriptionId) -> bool {
        let mut by_kind = self.lock_by_kind();
        let Some(callbacks) = by_kind.get_mut(&kind) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    /// Remove a global subscription. Returns whether it existed.
    pub fn off_all(&self, id: SubscriptionId) -> bool {
        let mut global = self.lock_global();
        let before = global.len();
        global.retain(|(cb_id, _)| *cb_id != id);
        global.len() != before
    }

    /// Drop every subscription.
    pub fn clear_all(&self) {
        self.lock_by_kind().clear();
        self.lock_global().clear();
    }

    /// Dispatch an event to matching subscribers.
    pub fn emit(&self, event: &CacheEvent) {
        // Clone the callbacks out so user code never runs under our locks.
        let mut callbacks: Vec<Callback> = self
            .lock_by_kind()
            .get(&event.kind)
            .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        callbacks.extend(self.lock_global().iter().map(|(_, cb)| cb.clone()));

        for callback in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
            if outcome.is_err() && !self.silent {
                warn!(kind = %event.kind, key = %event.key, "cache event callback panicked");
            }
        }
    }
}

/// Aggregate counters maintained by [`StatsCollector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,
    pub clears: u64,
}

/// Event subscriber that counts cache activity.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    stats: Arc<Mutex<CacheStats>>,
}

impl StatsCollector {
    /// Create a collector with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callback to register with [`EventEmitter::on_all`].
    pub fn callback(&self) -> impl Fn(&CacheEvent) + Send + Sync + 'static {
        let stats = self.stats.clone();
        move |event: &CacheEvent| {
            let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
            match event.kind {
                CacheEventKind::Hit => stats.hits += 1,
                CacheEventKind::Miss => stats.misses += 1,
                CacheEventKind::Set => stats.sets += 1,
                CacheEventKind::Delete => stats.deletes += 1,
                CacheEventKind::Invalidate => stats.invalidations += 1,
                CacheEventKind::Clear => stats.clears += 1,
            }
        }
    }

    /// Current counter values.
    pub fn snapshot(&self) -> CacheStats {
        *self.lock()
    }

    /// Hits divided by total lookups, or 0.0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let stats = self.snapshot();
        let total = stats.hits + stats.misses;
        if total == 0 {
            0.0
        } else {
            stats.hits as f64 / total as f64
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        *self.lock() = CacheStats::default();
    }
}
