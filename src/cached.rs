//! Cached call orchestration
//!
//! [`CachedCall`] wraps one computation in the full cache protocol: key
//! generation, lookup, context frame management, dependency collection and
//! persistence of the result or of a matching failure. A lookup hit returns
//! the stored value without executing the body and without opening a frame,
//! so hits contribute no dependencies to an enclosing call; the enclosing
//! call already absorbed the hit entry's tags when that entry was first
//! computed inside it, or never depended on it at all.
//!
//! Infrastructure errors flow into the caller's error type through the
//! [`CacheableError`] bound, so a call body keeps its own `Result` signature.
//!
//! # Example
//!
//! ```
//! use depcache::{CacheConfig, CacheContext, CachedCall, CacheManager, KeySpec, MemoryBackend};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(MemoryBackend::new("docs"));
//! depcache::registry::register(CacheManager::new(
//!     CacheConfig::new("docs"),
//!     Some(backend),
//!     None,
//! )?);
//!
//! let ctx = CacheContext::new();
//! let call: CachedCall = CachedCall::new("docs::double").manager("docs");
//!
//! let value: u64 = call.run(&ctx, KeySpec::new().arg(&21u64), |ctx| {
//!     ctx.record_dependency("numbers")?;
//!     Ok(42)
//! })?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::config::DEFAULT_MANAGER_NAME;
use crate::context::{CacheContext, FrameGuard};
use crate::error::CacheError;
use crate::key::{self, KeySpec};
use crate::manager::CacheManager;
use crate::registry;
use crate::serialize::{CacheableError, CachedFailure};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How one cached call resolved, handed to the resolve callback.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Function identity the call was keyed by.
    pub function: String,
    /// Manager the call ran under.
    pub manager: String,
    /// Generated cache key.
    pub cache_key: String,
    /// Whether the value came from the cache.
    pub hit: bool,
    /// Resolved positional argument representations.
    pub args: Vec<String>,
    /// Resolved named argument representations.
    pub kwargs: Vec<(String, String)>,
    /// JSON rendering of the resolved value; `None` for failures.
    pub value: Option<serde_json::Value>,
}

type FailurePredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type ResolveCallback = Box<dyn Fn(&CallOutcome) + Send + Sync>;

/// Builder describing how one function's results are cached.
///
/// The builder is reusable: one `CachedCall` per function, then
/// [`run`](CachedCall::run) or [`run_async`](CachedCall::run_async) per
/// invocation with that invocation's arguments.
pub struct CachedCall<E = CachedFailure> {
    function: String,
    manager_name: String,
    ttl: Option<Duration>,
    key_prefix: Option<String>,
    static_dependencies: HashSet<String>,
    cache_failures: Option<FailurePredicate<E>>,
    on_resolve: Option<ResolveCallback>,
    silent_backend_errors: bool,
}

impl<E: CacheableError> CachedCall<E> {
    /// Describe a cached function by its stable identity.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            manager_name: DEFAULT_MANAGER_NAME.to_string(),
            ttl: None,
            key_prefix: None,
            static_dependencies: HashSet::new(),
            cache_failures: None,
            on_resolve: None,
            silent_backend_errors: true,
        }
    }

    /// Run under the named manager instead of the default one.
    pub fn manager(mut self, name: impl Into<String>) -> Self {
        self.manager_name = name.into();
        self
    }

    /// TTL for stored results; the body can still override it through the
    /// context.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Prefix mixed into the generated key, overriding the manager's.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Attach a dependency tag to every result of this call.
    pub fn dependency(mut self, tag: impl Into<String>) -> Self {
        self.static_dependencies.insert(tag.into());
        self
    }

    /// Attach several dependency tags to every result of this call.
    pub fn dependencies<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_dependencies.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Cache failures the predicate accepts, replaying them to later callers.
    pub fn cache_failures_if(mut self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.cache_failures = Some(Box::new(pred));
        self
    }

    /// Observe how each invocation resolved.
    pub fn on_resolve(mut self, callback: impl Fn(&CallOutcome) + Send + Sync + 'static) -> Self {
        self.on_resolve = Some(Box::new(callback));
        self
    }

    /// Whether backend failures degrade to a miss (default) or surface as
    /// errors.
    pub fn silent_backend_errors(mut self, silent: bool) -> Self {
        self.silent_backend_errors = silent;
        self
    }

    fn resolve_manager(&self) -> Result<Arc<CacheManager>, E> {
        registry::get_or_create(&self.manager_name).map_err(E::from)
    }

    fn generate_key(&self, manager: &CacheManager, spec: &KeySpec) -> Result<String, E> {
        let prefix = self
            .key_prefix
            .as_deref()
            .or(manager.config().key_prefix.as_deref());
        key::generate(&self.function, prefix, spec).map_err(E::from)
    }

    fn emit_outcome(&self, manager: &CacheManager, outcome: &CallOutcome) {
        let Some(callback) = &self.on_resolve else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| callback(outcome)));
        if result.is_err() && !manager.config().callback_error_silent {
            warn!(
                function = %outcome.function,
                key = %outcome.cache_key,
                "resolve callback panicked"
            );
        }
    }

    fn outcome(
        &self,
        manager: &CacheManager,
        cache_key: &str,
        spec: &KeySpec,
        hit: bool,
        value: Option<serde_json::Value>,
    ) -> CallOutcome {
        CallOutcome {
            function: self.function.clone(),
            manager: manager.name().to_string(),
            cache_key: cache_key.to_string(),
            hit,
            args: spec.args().to_vec(),
            kwargs: spec.kwargs().to_vec(),
            value,
        }
    }

    /// Storage error policy: degrade to a miss or surface, per configuration.
    fn absorb_storage_error(&self, stage: &str, error: CacheError) -> Result<(), E> {
        if self.silent_backend_errors {
            warn!(function = %self.function, stage, error = %error, "cache backend error ignored");
            Ok(())
        } else {
            Err(E::from(error))
        }
    }

    /// Run the computation through the cache, blocking flavor.
    ///
    /// On a miss the body runs inside a fresh context frame; dependency tags
    /// it records, plus this call's static tags, are attached to the stored
    /// result and folded into any enclosing frame. A body error is returned
    /// as-is; it is additionally stored as a failure marker when a
    /// [`cache_failures_if`](Self::cache_failures_if) predicate accepts it.
    pub fn run<T, F>(&self, cx: &CacheContext, spec: KeySpec, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&CacheContext) -> Result<T, E>,
    {
        let manager = self.resolve_manager()?;
        let cache_key = self.generate_key(&manager, &spec)?;

        match manager.get::<T>(&cache_key) {
            Ok(Some(value)) => {
                let json = serde_json::to_value(&value).ok();
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, true, json));
                return Ok(value);
            }
            Ok(None) => {}
            Err(CacheError::CachedFailure { kind, message }) => {
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, true, None));
                return Err(E::reconstruct(&kind, &message));
            }
            Err(e) => self.absorb_storage_error("lookup", e)?,
        }

        let guard = FrameGuard::new(
            cx,
            manager.name(),
            &cache_key,
            self.static_dependencies.clone(),
            self.ttl,
        );

        match f(cx) {
            Ok(value) => {
                let mut closed = guard.finish();
                let dependencies = closed.dependencies_for(manager.name());
                let ttl = closed.ttl_override;

                if let Err(e) = manager.set(&cache_key, &value, ttl, &dependencies) {
                    self.absorb_storage_error("store", e)?;
                }

                let json = serde_json::to_value(&value).ok();
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, false, json));
                Ok(value)
            }
            Err(error) => {
                if self.cache_failures.as_ref().is_some_and(|pred| pred(&error)) {
                    let mut closed = guard.finish();
                    let dependencies = closed.dependencies_for(manager.name());
                    let ttl = closed.ttl_override;

                    if let Err(e) = manager.set_failure(
                        &cache_key,
                        &error.failure_kind(),
                        &error.failure_message(),
                        ttl,
                        &dependencies,
                    ) {
                        self.absorb_storage_error("store", e)?;
                    }
                    self.emit_outcome(
                        &manager,
                        &self.outcome(&manager, &cache_key, &spec, false, None),
                    );
                }
                // Uncached errors drop the guard, which still folds the
                // frame's dependencies into the parent.
                Err(error)
            }
        }
    }

    /// Run the computation through the cache, async flavor.
    ///
    /// The body closure captures whatever context it needs, including the
    /// same [`CacheContext`] passed here. Cancellation of the returned future
    /// unwinds the context frame without storing anything.
    pub async fn run_async<T, F, Fut>(&self, cx: &CacheContext, spec: KeySpec, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let manager = self.resolve_manager()?;
        let cache_key = self.generate_key(&manager, &spec)?;

        match manager.get_async::<T>(&cache_key).await {
            Ok(Some(value)) => {
                let json = serde_json::to_value(&value).ok();
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, true, json));
                return Ok(value);
            }
            Ok(None) => {}
            Err(CacheError::CachedFailure { kind, message }) => {
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, true, None));
                return Err(E::reconstruct(&kind, &message));
            }
            Err(e) => self.absorb_storage_error("lookup", e)?,
        }

        let guard = FrameGuard::new(
            cx,
            manager.name(),
            &cache_key,
            self.static_dependencies.clone(),
            self.ttl,
        );

        match f().await {
            Ok(value) => {
                let mut closed = guard.finish();
                let dependencies = closed.dependencies_for(manager.name());
                let ttl = closed.ttl_override;

                if let Err(e) = manager.set_async(&cache_key, &value, ttl, &dependencies).await {
                    self.absorb_storage_error("store", e)?;
                }

                let json = serde_json::to_value(&value).ok();
                self.emit_outcome(&manager, &self.outcome(&manager, &cache_key, &spec, false, json));
                Ok(value)
            }
            Err(error) => {
                if self.cache_failures.as_ref().is_some_and(|pred| pred(&error)) {
                    let mut closed = guard.finish();
                    let dependencies = closed.dependencies_for(manager.name());
                    let ttl = closed.ttl_override;

                    if let Err(e) = manager
                        .set_failure_async(
                            &cache_key,
                            &error.failure_kind(),
                            &error.failure_message(),
                            ttl,
                            &dependencies,
                        )
                        .await
                    {
                        self.absorb_storage_error("store", e)?;
                    }
                    self.emit_outcome(
                        &manager,
                        &self.outcome(&manager, &cache_key, &spec, false, None),
                    );
                }
                Err(error)
            }
        }
    }
}
