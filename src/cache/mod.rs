//! Cache Backends
//!
//! Storage side of the server. Every variant implements [`CacheBackend`];
//! the configured one is built once at startup by [`open_backend`].
//!
//! # Variants
//!
//! - [`memory`] - values held in process memory with size-bounded eviction
//! - [`filesystem`] - one file per value, atomic commit by rename
//! - [`memcache`] - values on memcached servers over the binary protocol
//!
//! All three store payloads through the [`compression`] adapter when
//! compression is enabled.

pub mod backend;
pub mod compression;
pub mod filesystem;
pub mod memcache;
pub mod memory;

use std::sync::Arc;

use serde::Deserialize;

pub use backend::{CacheBackend, CacheSink, CacheValue, ContentStream, SharedBackend};
pub use compression::CompressionConfig;
pub use filesystem::{FileSystemCache, FileSystemCacheConfig};
pub use memcache::{MemcacheCache, MemcacheCacheConfig};
pub use memory::{InMemoryCache, InMemoryCacheConfig};

use crate::error::Result;

/// Backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CacheConfig {
    InMemory(InMemoryCacheConfig),
    FileSystem(FileSystemCacheConfig),
    Memcache(MemcacheCacheConfig),
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::InMemory(InMemoryCacheConfig::default())
    }
}

impl CacheConfig {
    pub fn compression(&self) -> &CompressionConfig {
        match self {
            CacheConfig::InMemory(config) => &config.compression,
            CacheConfig::FileSystem(config) => &config.compression,
            CacheConfig::Memcache(config) => &config.compression,
        }
    }
}

/// Build the configured backend
pub async fn open_backend(config: &CacheConfig, chunk_size: usize) -> Result<SharedBackend> {
    let backend: SharedBackend = match config {
        CacheConfig::InMemory(config) => Arc::new(InMemoryCache::new(config.clone(), chunk_size)?),
        CacheConfig::FileSystem(config) => {
            Arc::new(FileSystemCache::open(config.clone(), chunk_size).await?)
        }
        CacheConfig::Memcache(config) => Arc::new(MemcacheCache::new(config.clone(), chunk_size)?),
    };
    tracing::info!(backend = backend.name(), "Cache backend ready");
    Ok(backend)
}
