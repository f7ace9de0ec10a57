//! Call context for dependency collection
//!
//! Each logical thread of execution owns one [`CacheContext`]: a strict stack
//! of operation frames, one per in-flight cached call. The context is passed
//! explicitly by reference through the call chain rather than living in
//! thread-local storage, so the same code serves both the blocking path (one
//! context per OS thread) and the async path (one context per task).
//!
//! Frame operations are synchronous and in-memory; they never suspend. The
//! interior mutex exists only to satisfy `Send + Sync` for async bodies and
//! is never contended, because a context is never shared across concurrent
//! units of execution.

use crate::error::{CacheError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Dependency tags accumulated per target manager name.
pub type DependencyMap = HashMap<String, HashSet<String>>;

/// Bookkeeping record for one in-flight cached call.
#[derive(Debug, Clone)]
struct OperationFrame {
    manager_name: String,
    cache_key: String,
    dependencies: DependencyMap,
    ttl_override: Option<Duration>,
}

/// Snapshot of a frame at the moment it is popped.
///
/// Carries everything the orchestrator needs to persist the call's result:
/// the accumulated manager-keyed dependency sets and the effective TTL
/// override, if any was set during the call.
#[derive(Debug, Clone, Default)]
pub struct ClosedFrame {
    /// Manager the frame's result will be persisted under.
    pub manager_name: String,
    /// Cache key computed for the closed call.
    pub cache_key: String,
    /// Dependency tags accumulated during the call, keyed by manager name.
    pub dependencies: DependencyMap,
    /// TTL set from inside the call body, overriding any static TTL.
    pub ttl_override: Option<Duration>,
}

impl ClosedFrame {
    /// Take the dependency set destined for the given manager.
    pub fn dependencies_for(&mut self, manager_name: &str) -> HashSet<String> {
        self.dependencies.remove(manager_name).unwrap_or_default()
    }
}

/// Explicit per-thread/per-task stack of cache operation frames.
#[derive(Debug, Default)]
pub struct CacheContext {
    stack: Mutex<Vec<OperationFrame>>,
}

impl CacheContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OperationFrame>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a new frame with empty dependency sets.
    pub fn push_frame(&self, manager_name: &str, cache_key: &str) {
        self.push_frame_with(manager_name, cache_key, HashSet::new(), None);
    }

    /// Push a new frame seeded with statically-declared dependencies and TTL.
    pub(crate) fn push_frame_with(
        &self,
        manager_name: &str,
        cache_key: &str,
        seed_dependencies: HashSet<String>,
        ttl: Option<Duration>,
    ) {
        let mut dependencies = DependencyMap::new();
        dependencies.insert(manager_name.to_string(), seed_dependencies);

        self.lock().push(OperationFrame {
            manager_name: manager_name.to_string(),
            cache_key: cache_key.to_string(),
            dependencies,
            ttl_override: ttl,
        });
    }

    /// Pop the innermost frame, folding its dependency sets into the parent.
    ///
    /// The fold is a per-manager set union: every manager name present in the
    /// closing frame ends up in the parent frame, so tags targeted at a
    /// manager several levels up survive intermediate frames that belong to
    /// other managers. Popping an empty stack returns an empty frame.
    pub fn pop_frame(&self) -> ClosedFrame {
        let mut stack = self.lock();
        let Some(frame) = stack.pop() else {
            return ClosedFrame::default();
        };

        if let Some(parent) = stack.last_mut() {
            for (manager_name, tags) in &frame.dependencies {
                parent
                    .dependencies
                    .entry(manager_name.clone())
                    .or_default()
                    .extend(tags.iter().cloned());
            }
        }

        ClosedFrame {
            manager_name: frame.manager_name,
            cache_key: frame.cache_key,
            dependencies: frame.dependencies,
            ttl_override: frame.ttl_override,
        }
    }

    /// Record a dependency tag against the innermost frame's own manager.
    pub fn record_dependency(&self, tag: &str) -> Result<()> {
        let mut stack = self.lock();
        let frame = stack.last_mut().ok_or(CacheError::NoActiveOperation)?;
        frame
            .dependencies
            .entry(frame.manager_name.clone())
            .or_default()
            .insert(tag.to_string());
        Ok(())
    }

    /// Record a dependency tag targeted at a specific manager.
    ///
    /// The tag is added for that manager to the innermost frame and every
    /// enclosing frame, so any ancestor that persists under the target
    /// manager receives it even if the pop-time fold never runs for some
    /// intermediate frame.
    pub fn record_dependency_for(&self, manager_name: &str, tag: &str) -> Result<()> {
        let mut stack = self.lock();
        if stack.is_empty() {
            return Err(CacheError::NoActiveOperation);
        }
        for frame in stack.iter_mut() {
            frame
                .dependencies
                .entry(manager_name.to_string())
                .or_default()
                .insert(tag.to_string());
        }
        Ok(())
    }

    /// Override the TTL for the innermost call; last writer wins.
    pub fn set_ttl_override(&self, ttl: Duration) -> Result<()> {
        let mut stack = self.lock();
        let frame = stack.last_mut().ok_or(CacheError::NoActiveOperation)?;
        frame.ttl_override = Some(ttl);
        Ok(())
    }

    /// TTL override of the innermost frame, if any.
    pub fn ttl_override(&self) -> Option<Duration> {
        self.lock().last().and_then(|f| f.ttl_override)
    }

    /// Cache key of the innermost frame.
    pub fn current_key(&self) -> Result<String> {
        self.lock()
            .last()
            .map(|f| f.cache_key.clone())
            .ok_or(CacheError::NoActiveOperation)
    }

    /// Manager name of the innermost frame.
    pub fn current_manager(&self) -> Result<String> {
        self.lock()
            .last()
            .map(|f| f.manager_name.clone())
            .ok_or(CacheError::NoActiveOperation)
    }

    /// Dependencies accumulated for the innermost frame's own manager.
    pub fn current_dependencies(&self) -> HashSet<String> {
        let stack = self.lock();
        let Some(frame) = stack.last() else {
            return HashSet::new();
        };
        frame
            .dependencies
            .get(&frame.manager_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Dependencies accumulated for a specific manager in the innermost frame.
    pub fn dependencies_for(&self, manager_name: &str) -> HashSet<String> {
        self.lock()
            .last()
            .and_then(|f| f.dependencies.get(manager_name).cloned())
            .unwrap_or_default()
    }

    /// All manager-keyed dependencies of the innermost frame.
    pub fn all_dependencies(&self) -> DependencyMap {
        self.lock()
            .last()
            .map(|f| f.dependencies.clone())
            .unwrap_or_default()
    }

    /// Drop every dependency recorded so far in the innermost frame.
    pub fn clear_dependencies(&self) {
        if let Some(frame) = self.lock().last_mut() {
            frame.dependencies.clear();
        }
    }

    /// Number of active frames.
    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    /// Whether any cached call is currently in flight.
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Discard all frames.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

/// Scope guard tying a frame's lifetime to a region of code.
///
/// Pops the frame on drop, so the stack unwinds correctly on every exit path
/// including panics. [`finish`](FrameGuard::finish) pops eagerly and hands
/// the closed frame to the caller for persistence.
pub struct FrameGuard<'a> {
    context: &'a CacheContext,
    armed: bool,
}

impl<'a> FrameGuard<'a> {
    pub(crate) fn new(
        context: &'a CacheContext,
        manager_name: &str,
        cache_key: &str,
        seed_dependencies: HashSet<String>,
        ttl: Option<Duration>,
    ) -> Self {
        context.push_frame_with(manager_name, cache_key, seed_dependencies, ttl);
        Self {
            context,
            armed: true,
        }
    }

    /// Pop the frame and return its closing snapshot.
    pub fn finish(mut self) -> ClosedFrame {
        self.armed = false;
        self.context.pop_frame()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.context.pop_frame();
        }
    }
}
