//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A cache entry being read back from storage.
pub struct CacheObject {
    /// Object size when the backend reports it up front.
    pub size: Option<u64>,
    /// Object content.
    pub body: ByteStream,
}

impl CacheObject {
    /// Wrap an in-memory value.
    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self {
            size: Some(size),
            body: Box::pin(futures::stream::once(async move { Ok(data) })),
        }
    }

    /// Drain the body into a single buffer.
    pub async fn collect(mut self) -> StorageResult<Bytes> {
        let mut buffer = bytes::BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for CacheObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Storage for Bazel cache entries, addressed by namespace and digest.
///
/// Namespaces other than `ac` and `cas` are rejected with
/// [`StorageError::InvalidPath`] before any I/O happens.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Open an entry for reading. Returns [`StorageError::NotFound`] if absent.
    async fn get(&self, namespace: &str, digest: &str) -> StorageResult<CacheObject>;

    /// Store an entry, consuming `body` to the end. Overwrites any existing
    /// value and returns the number of bytes stored.
    async fn put(&self, namespace: &str, digest: &str, body: ByteStream) -> StorageResult<u64>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Reader/writer forms of [`CacheStore`] operations.
///
/// Automatically implemented for every `CacheStore`, including `dyn CacheStore`.
pub trait CacheStoreExt: CacheStore {
    /// Copy an entry into `writer`, returning the number of bytes written.
    ///
    /// Bytes already written stay written if the copy fails part way.
    fn get_into<'a, W>(
        &'a self,
        namespace: &'a str,
        digest: &'a str,
        writer: &'a mut W,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + 'a>>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        Box::pin(async move {
            let mut object = self.get(namespace, digest).await?;
            let mut written = 0u64;
            while let Some(chunk) = object.body.next().await {
                let chunk = chunk?;
                writer.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            writer.flush().await?;
            Ok(written)
        })
    }

    /// Store everything readable from `reader`.
    fn put_reader<'a, R>(
        &'a self,
        namespace: &'a str,
        digest: &'a str,
        reader: R,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + 'a>>
    where
        R: AsyncRead + Send + 'static,
    {
        let body: ByteStream =
            Box::pin(ReaderStream::new(reader).map(|chunk| chunk.map_err(StorageError::Io)));
        Box::pin(async move { self.put(namespace, digest, body).await })
    }
}

impl<T: CacheStore + ?Sized> CacheStoreExt for T {}
