//! In-memory storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CacheObject, CacheStore};
use async_trait::async_trait;
use bazel_cache_core::CacheKey;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::instrument;

/// Chunk size used when streaming a stored value back out (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Cache store held entirely in process memory.
///
/// Values are committed only after the whole body has been received, so a
/// concurrent reader sees either the previous value or the new one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Stored object keys (`<namespace>/<digest>`), sorted.
    pub async fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, namespace: &str, digest: &str) -> StorageResult<CacheObject> {
        let key = CacheKey::parse(namespace, digest)?.object_key();
        let data = self
            .objects
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))?;

        let size = data.len() as u64;
        let chunks: Vec<StorageResult<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK_SIZE).min(data.len()))))
            .collect();

        Ok(CacheObject {
            size: Some(size),
            body: Box::pin(futures::stream::iter(chunks)),
        })
    }

    #[instrument(skip(self, body), fields(backend = "memory"))]
    async fn put(&self, namespace: &str, digest: &str, mut body: ByteStream) -> StorageResult<u64> {
        let key = CacheKey::parse(namespace, digest)?.object_key();

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        let size = buffer.len() as u64;
        self.objects.write().await.insert(key, buffer.freeze());
        Ok(size)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::once(async move {
            Ok(Bytes::from_static(data))
        }))
    }

    #[tokio::test]
    async fn stores_under_namespaced_key() {
        let store = MemoryStore::new();
        store.put("cas", "abc", body(b"x")).await.unwrap();
        store.put("ac", "abc", body(b"y")).await.unwrap();
        assert_eq!(store.object_keys().await, vec!["ac/abc", "cas/abc"]);
    }

    #[tokio::test]
    async fn large_values_stream_in_chunks() {
        let store = MemoryStore::new();
        let data = Bytes::from(vec![7u8; STREAM_CHUNK_SIZE * 2 + 1]);
        let upload = data.clone();
        store
            .put(
                "cas",
                "big",
                Box::pin(futures::stream::once(async move { Ok(upload) })),
            )
            .await
            .unwrap();

        let object = store.get("cas", "big").await.unwrap();
        let chunks: Vec<_> = object.body.collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_body_leaves_previous_value() {
        let store = MemoryStore::new();
        store.put("ac", "k", body(b"old")).await.unwrap();

        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ne")),
            Err(StorageError::Io(std::io::Error::other("client went away"))),
        ]));
        assert!(store.put("ac", "k", failing).await.is_err());

        let value = store.get("ac", "k").await.unwrap().collect().await.unwrap();
        assert_eq!(value, Bytes::from_static(b"old"));
    }
}
