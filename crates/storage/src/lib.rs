//! Cache storage for the Bazel S3 remote cache.
//!
//! This crate provides:
//! - The `CacheStore` port addressed by namespace and digest
//! - An S3 backend with streaming, multipart uploads
//! - An in-memory backend
//! - Prometheus instrumentation as a store decorator

pub mod backends;
pub mod error;
pub mod instrumented;
pub mod traits;

pub use backends::{memory::MemoryStore, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use instrumented::{InstrumentedStore, StoreMetrics};
pub use traits::{ByteStream, CacheObject, CacheStore, CacheStoreExt};

use bazel_cache_core::StorageConfig;
use prometheus::Registry;
use std::sync::Arc;

/// Create the instrumented S3 cache store from configuration.
///
/// Store metrics are registered with `registry`.
pub async fn from_config(
    config: &StorageConfig,
    registry: &Registry,
) -> StorageResult<Arc<dyn CacheStore>> {
    config.validate().map_err(StorageError::Config)?;

    let backend = S3Backend::new(config).await?;
    let store = InstrumentedStore::register(backend, registry)
        .map_err(|e| StorageError::Config(format!("failed to register store metrics: {e}")))?;
    Ok(Arc::new(store))
}
