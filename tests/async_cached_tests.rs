//! Integration tests for the async cached call protocol

use depcache::{
    AsyncMemoryBackend, CacheConfig, CacheContext, CachedCall, CachedFailure, CacheManager,
    KeySpec, MemoryBackend,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn setup_async(name: &str) -> Arc<CacheManager> {
    let backend = Arc::new(AsyncMemoryBackend::new(name));
    depcache::registry::register(
        CacheManager::new(CacheConfig::new(name), None, Some(backend)).unwrap(),
    )
}

#[tokio::test]
async fn async_cached_result_skips_recomputation() {
    setup_async("ai-skip");
    let ctx = CacheContext::new();
    let call: CachedCall = CachedCall::new("ai::fetch").manager("ai-skip");
    let runs = AtomicUsize::new(0);

    for _ in 0..3 {
        let value: u64 = call
            .run_async(&ctx, KeySpec::new().arg(&1u64), || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(11)
            })
            .await
            .unwrap();
        assert_eq!(value, 11);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_dependencies_fold_and_invalidate() {
    let manager = setup_async("ai-deps");
    let ctx = CacheContext::new();
    let call: CachedCall = CachedCall::new("ai::profile").manager("ai-deps");
    let runs = AtomicUsize::new(0);

    let run_once = || async {
        let _: String = call
            .run_async(&ctx, KeySpec::new().arg(&3u64), || async {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.record_dependency("user:3")?;
                Ok("p".to_string())
            })
            .await
            .unwrap();
    };

    run_once().await;
    run_once().await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    manager.invalidate_dependency_async("user:3").await.unwrap();
    run_once().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn async_nested_calls_share_the_context() {
    let manager = setup_async("ai-nested");
    let ctx = CacheContext::new();
    let outer: CachedCall = CachedCall::new("ai::page").manager("ai-nested");
    let inner: CachedCall = CachedCall::new("ai::widget").manager("ai-nested");

    let outer_runs = AtomicUsize::new(0);
    let render = || async {
        outer_runs.fetch_add(1, Ordering::SeqCst);
        let widget: String = inner
            .run_async(&ctx, KeySpec::new(), || async {
                ctx.record_dependency("widget:1")?;
                Ok("w".to_string())
            })
            .await
            .unwrap();
        Ok(format!("[{}]", widget))
    };

    let _: String = outer.run_async(&ctx, KeySpec::new(), render).await.unwrap();
    assert_eq!(outer_runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.depth(), 0);

    manager
        .invalidate_dependency_async("widget:1")
        .await
        .unwrap();
    let _: String = outer.run_async(&ctx, KeySpec::new(), render).await.unwrap();
    assert_eq!(outer_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn async_failure_caching() {
    setup_async("ai-failures");
    let ctx = CacheContext::new();
    let call: CachedCall = CachedCall::new("ai::flaky")
        .manager("ai-failures")
        .cache_failures_if(|e: &CachedFailure| e.kind == "Gone");
    let runs = AtomicUsize::new(0);

    for _ in 0..2 {
        let result: Result<u64, CachedFailure> = call
            .run_async(&ctx, KeySpec::new(), || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(CachedFailure::new("Gone", "deleted"))
            })
            .await;
        assert_eq!(result.unwrap_err().kind, "Gone");
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sync_and_async_surfaces_share_storage() {
    let shared = Arc::new(MemoryBackend::new("ai-shared"));
    let async_backend = Arc::new(AsyncMemoryBackend::from_backend(shared.clone()));
    let manager = depcache::registry::register(
        CacheManager::new(
            CacheConfig::new("ai-shared"),
            Some(shared),
            Some(async_backend),
        )
        .unwrap(),
    );

    let ctx = CacheContext::new();
    let call: CachedCall = CachedCall::new("ai::mixed").manager("ai-shared");

    let value: u64 = call
        .run_async(&ctx, KeySpec::new(), || async { Ok(21) })
        .await
        .unwrap();
    assert_eq!(value, 21);

    // The blocking surface sees the entry the async path stored.
    let runs = AtomicUsize::new(0);
    let value: u64 = call
        .run(&ctx, KeySpec::new(), |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        })
        .unwrap();
    assert_eq!(value, 21);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    manager.close().await.unwrap();
}
