//! Prometheus instrumentation for cache stores.
//!
//! Every store call is timed into `bazel_cache_cache_durations_seconds`,
//! labelled by HTTP-style method and namespace. Failures other than cache
//! misses increment `bazel_cache_cache_error_count`. Recording never changes
//! the result of the wrapped call.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CacheObject, CacheStore};
use async_trait::async_trait;
use bazel_cache_core::Namespace;
use futures::TryStreamExt;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, Opts, Registry};
use std::time::{Duration, Instant};

const METRIC_NAMESPACE: &str = "bazel";
const METRIC_SUBSYSTEM: &str = "cache";

/// Cache latency histogram and error counter.
#[derive(Clone, Debug)]
pub struct StoreMetrics {
    durations: HistogramVec,
    errors: IntCounter,
}

impl StoreMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let durations = HistogramVec::new(
            HistogramOpts::new("cache_durations_seconds", "Cache latency distributions.")
                .namespace(METRIC_NAMESPACE)
                .subsystem(METRIC_SUBSYSTEM),
            &["method", "path"],
        )?;
        let errors = IntCounter::with_opts(
            Opts::new("cache_error_count", "Count of Bazel cache errors.")
                .namespace(METRIC_NAMESPACE)
                .subsystem(METRIC_SUBSYSTEM),
        )?;

        registry.register(Box::new(durations.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self { durations, errors })
    }

    pub fn observe(&self, method: &str, namespace: Namespace, elapsed: Duration) {
        self.durations
            .with_label_values(&[method, namespace.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Count a failure. Cache misses are expected traffic and are not counted.
    pub fn record_error(&self, err: &StorageError) {
        if !err.is_not_found() {
            self.errors.inc();
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }

    /// Number of latency observations for a method and namespace.
    pub fn observation_count(&self, method: &str, namespace: Namespace) -> u64 {
        self.durations
            .with_label_values(&[method, namespace.as_str()])
            .get_sample_count()
    }
}

/// A [`CacheStore`] decorator that records [`StoreMetrics`].
#[derive(Debug)]
pub struct InstrumentedStore<S> {
    inner: S,
    metrics: StoreMetrics,
}

impl<S: CacheStore> InstrumentedStore<S> {
    pub fn new(inner: S, metrics: StoreMetrics) -> Self {
        Self { inner, metrics }
    }

    /// Wrap `inner`, registering fresh metrics with `registry`.
    pub fn register(inner: S, registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self::new(inner, StoreMetrics::register(registry)?))
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    fn record<T>(&self, method: &str, namespace: &str, start: Instant, result: &StorageResult<T>) {
        // Invalid namespaces have no label; they only count as errors.
        if let Ok(namespace) = namespace.parse::<Namespace>() {
            self.metrics.observe(method, namespace, start.elapsed());
        }

        if let Err(err) = result {
            self.metrics.record_error(err);
            if !err.is_not_found() {
                tracing::warn!(
                    method,
                    namespace,
                    backend = self.inner.backend_name(),
                    error = %err,
                    "Cache operation failed"
                );
            }
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for InstrumentedStore<S> {
    async fn get(&self, namespace: &str, digest: &str) -> StorageResult<CacheObject> {
        let start = Instant::now();
        let result = self.inner.get(namespace, digest).await;
        self.record("GET", namespace, start, &result);

        // Failures while the body is being read are counted too.
        result.map(|object| {
            let metrics = self.metrics.clone();
            CacheObject {
                size: object.size,
                body: Box::pin(object.body.inspect_err(move |err| metrics.record_error(err))),
            }
        })
    }

    async fn put(&self, namespace: &str, digest: &str, body: ByteStream) -> StorageResult<u64> {
        let start = Instant::now();
        let result = self.inner.put(namespace, digest, body).await;
        self.record("PUT", namespace, start, &result);
        result
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}
