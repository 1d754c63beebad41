//! Cache Backend Trait
//!
//! Storage contract shared by every backend variant. Reads hand back a
//! lazily produced chunk stream; writes go through a [`CacheSink`] that
//! becomes visible only when committed.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::Result;
use crate::protocol::CacheValueMetadata;

/// Lazily produced payload chunks
pub type ContentStream = BoxStream<'static, Result<Bytes>>;

/// A stored value as seen by the read path
pub struct CacheValue {
    pub metadata: CacheValueMetadata,
    pub content: ContentStream,
}

impl CacheValue {
    pub fn new(metadata: CacheValueMetadata, content: ContentStream) -> Self {
        Self { metadata, content }
    }
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheValue")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Write handle for one value.
///
/// Dropping a sink without committing behaves like [`CacheSink::rollback`].
#[async_trait]
pub trait CacheSink: Send {
    /// Append a payload chunk
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Make the value visible to readers, replacing any previous value
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard everything written so far
    fn rollback(self: Box<Self>);
}

/// A cache storage backend
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &'static str;

    /// Look up `key`; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Open a sink for `key`
    async fn put(&self, key: &str, metadata: CacheValueMetadata) -> Result<Box<dyn CacheSink>>;

    /// Stop background work and release connections
    async fn close(&self) -> Result<()>;
}

pub type SharedBackend = Arc<dyn CacheBackend>;

/// Slice an in-memory payload into `chunk_size` pieces without copying
pub fn chunked(content: Bytes, chunk_size: usize) -> ContentStream {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(content.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < content.len() {
        let end = (offset + chunk_size).min(content.len());
        chunks.push(Ok(content.slice(offset..end)));
        offset = end;
    }
    stream::iter(chunks).boxed()
}

// =============================================================================
// Tests
// =============================================================================
