//! Server test utilities.

use bazel_cache_core::AppConfig;
use bazel_cache_server::{AppState, create_router};
use bazel_cache_storage::{CacheStore, InstrumentedStore, MemoryStore, StoreMetrics};
use prometheus::Registry;
use std::sync::Arc;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub metrics: StoreMetrics,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server over an instrumented in-memory store.
    pub fn new() -> Self {
        Self::with_config(AppConfig::for_testing())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// Create a test server over `store`, instrumented like production.
    pub fn with_store<S: CacheStore>(config: AppConfig, store: S) -> Self {
        let registry = Registry::new();
        let store = InstrumentedStore::register(store, &registry)
            .expect("Failed to register store metrics");
        let metrics = store.metrics().clone();

        let state = AppState::new(config, Arc::new(store), registry);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            metrics,
        }
    }
}
