//! Application state shared across handlers.

use bazel_cache_core::AppConfig;
use bazel_cache_storage::CacheStore;
use prometheus::Registry;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Cache entry storage.
    pub store: Arc<dyn CacheStore>,
    /// Registry served on `/metrics`.
    pub registry: Registry,
}

impl AppState {
    /// Create new application state.
    pub fn new(config: AppConfig, store: Arc<dyn CacheStore>, registry: Registry) -> Self {
        Self {
            config: Arc::new(config),
            store,
            registry,
        }
    }
}
