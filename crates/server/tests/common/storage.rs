//! Cache store doubles for exercising error paths.

use async_trait::async_trait;
use bazel_cache_storage::{ByteStream, CacheObject, CacheStore, StorageError, StorageResult};
use bytes::Bytes;

/// Store whose every operation fails with a backend error.
#[allow(dead_code)]
pub struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _namespace: &str, _digest: &str) -> StorageResult<CacheObject> {
        Err(StorageError::S3("simulated backend outage".into()))
    }

    async fn put(&self, _namespace: &str, _digest: &str, _body: ByteStream) -> StorageResult<u64> {
        Err(StorageError::S3("simulated backend outage".into()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

/// Store that serves a body which breaks after its first chunk.
#[allow(dead_code)]
pub struct TruncatedBodyStore;

#[async_trait]
impl CacheStore for TruncatedBodyStore {
    async fn get(&self, _namespace: &str, _digest: &str) -> StorageResult<CacheObject> {
        Ok(CacheObject {
            size: None,
            body: Box::pin(futures::stream::iter(vec![
                Ok(Bytes::from_static(b"partial")),
                Err(StorageError::Io(std::io::Error::other("connection reset"))),
            ])),
        })
    }

    async fn put(&self, _namespace: &str, _digest: &str, _body: ByteStream) -> StorageResult<u64> {
        Ok(0)
    }

    fn backend_name(&self) -> &'static str {
        "truncated"
    }
}
