//! Filesystem Cache Backend
//!
//! One file per value under a root directory:
//!
//! ```text
//! <root>/<base64url(key)>        committed value
//! <root>/.<random>.tmp           upload in progress
//! ```
//!
//! A file holds the length-prefixed metadata record followed by the
//! (optionally compressed) payload. Uploads are written to a temporary
//! file and atomically renamed over the final name on commit, so readers
//! never observe partial content. A garbage collector task deletes files
//! older than `max_age` and schedules its next run for when the oldest
//! surviving file expires.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::{CacheBackend, CacheSink, CacheValue};
use super::compression::{decode_stream, ChunkDecoder, ChunkEncoder, CompressionConfig};
use crate::config::duration_format;
use crate::error::{Error, Result};
use crate::protocol::{process_cache_key, CacheValueMetadata, DigestAlgorithm};

const TEMP_SUFFIX: &str = ".tmp";

/// Filesystem backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileSystemCacheConfig {
    /// Directory holding the cache files
    pub root: PathBuf,
    /// Lifetime of a stored value
    #[serde(default = "default_max_age", deserialize_with = "duration_format::deserialize")]
    pub max_age: Duration,
    #[serde(default)]
    pub digest: Option<DigestAlgorithm>,
    #[serde(default)]
    pub compression: CompressionConfig,
}

fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl FileSystemCacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: default_max_age(),
            digest: None,
            compression: CompressionConfig::default(),
        }
    }
}

struct Inner {
    config: FileSystemCacheConfig,
    chunk_size: usize,
}

impl Inner {
    fn entry_path(&self, key: &str) -> PathBuf {
        let key = process_cache_key(key, self.config.digest);
        self.config.root.join(URL_SAFE_NO_PAD.encode(key))
    }

    /// Delete expired files; returns the age of the oldest survivor
    async fn collect_garbage(&self) -> Result<Option<Duration>> {
        let now = SystemTime::now();
        let mut oldest: Option<Duration> = None;
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.config.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let age = age_of(&metadata, now);
            if age >= self.config.max_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete expired cache file"),
                }
            } else {
                oldest = Some(oldest.map_or(age, |o| o.max(age)));
            }
        }
        if removed > 0 {
            debug!(removed, "Garbage collected expired cache files");
        }
        Ok(oldest)
    }
}

fn creation_time(metadata: &std::fs::Metadata) -> Option<SystemTime> {
    metadata.created().or_else(|_| metadata.modified()).ok()
}

fn age_of(metadata: &std::fs::Metadata, now: SystemTime) -> Duration {
    creation_time(metadata)
        .and_then(|created| now.duration_since(created).ok())
        .unwrap_or_default()
}

async fn run_gc(inner: Arc<Inner>, shutdown: CancellationToken) {
    let max_age = inner.config.max_age;
    loop {
        let delay = match inner.collect_garbage().await {
            Ok(Some(oldest)) => max_age.saturating_sub(oldest),
            Ok(None) => max_age,
            Err(e) => {
                warn!(error = %e, "Cache garbage collection failed");
                max_age.min(Duration::from_secs(60))
            }
        };
        let delay = delay.max(Duration::from_millis(10));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Filesystem garbage collector stopped");
}

// =============================================================================
// File System Cache
// =============================================================================

/// Cache backend storing one file per value
pub struct FileSystemCache {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystemCache {
    /// Create the root directory if needed and start the garbage collector
    pub async fn open(config: FileSystemCacheConfig, chunk_size: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        info!(root = %config.root.display(), max_age = ?config.max_age, "Opened filesystem cache");
        let inner = Arc::new(Inner {
            config,
            chunk_size: chunk_size.max(1),
        });
        let shutdown = CancellationToken::new();
        let gc = tokio::spawn(run_gc(Arc::clone(&inner), shutdown.clone()));
        Ok(Self {
            inner,
            shutdown,
            gc: Mutex::new(Some(gc)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Run one garbage collection pass now
    pub async fn collect_garbage(&self) -> Result<()> {
        self.inner.collect_garbage().await.map(|_| ())
    }
}

impl Drop for FileSystemCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl CacheBackend for FileSystemCache {
    fn name(&self) -> &'static str {
        "file-system"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let path = self.inner.entry_path(key);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        if age_of(&metadata, SystemTime::now()) >= self.inner.config.max_age {
            trace!(path = %path.display(), "Cache file expired");
            return Ok(None);
        }

        let len = match file.read_u32().await {
            Ok(len) => CacheValueMetadata::check_length(len)?,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::backend(format!(
                    "cache file {} is truncated",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let mut record = vec![0u8; len];
        file.read_exact(&mut record).await?;
        let value_metadata = CacheValueMetadata::decode(&record)?;

        let content = ReaderStream::with_capacity(file, self.inner.chunk_size)
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();
        let content = decode_stream(content, ChunkDecoder::new(&self.inner.config.compression));
        Ok(Some(CacheValue::new(value_metadata, content)))
    }

    async fn put(&self, key: &str, metadata: CacheValueMetadata) -> Result<Box<dyn CacheSink>> {
        let target = self.inner.entry_path(key);
        let root = self.inner.config.root.clone();
        let (file, temp_path) = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(".")
                .suffix(TEMP_SUFFIX)
                .tempfile_in(root)
                .map(|temp| temp.into_parts())
        })
        .await
        .map_err(|e| Error::Internal(format!("temp file task failed: {e}")))??;

        let mut file = File::from_std(file);
        file.write_all(&metadata.encode()?).await?;
        Ok(Box::new(FileSystemSink {
            file,
            temp_path,
            target,
            encoder: ChunkEncoder::new(&self.inner.config.compression),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let gc = self.gc.lock().take();
        if let Some(gc) = gc {
            gc.await
                .map_err(|e| Error::Internal(format!("garbage collector failed: {e}")))?;
        }
        Ok(())
    }
}

// =============================================================================
// Sink
// =============================================================================

struct FileSystemSink {
    file: File,
    /// Deletes the temporary file when dropped
    temp_path: TempPath,
    target: PathBuf,
    encoder: ChunkEncoder,
}

#[async_trait]
impl CacheSink for FileSystemSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let encoded = self.encoder.encode(chunk)?;
        if !encoded.is_empty() {
            self.file.write_all(&encoded).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let FileSystemSink {
            mut file,
            temp_path,
            target,
            encoder,
        } = *self;
        let tail = encoder.finish()?;
        if !tail.is_empty() {
            file.write_all(&tail).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::task::spawn_blocking(move || temp_path.persist(&target))
            .await
            .map_err(|e| Error::Internal(format!("rename task failed: {e}")))?
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        let FileSystemSink { temp_path, .. } = *self;
        let path = temp_path.to_path_buf();
        if let Err(e) = temp_path.close() {
            warn!(path = %path.display(), error = %e, "Failed to delete temporary cache file");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::TryStreamExt;

    async fn open(dir: &Path, max_age: Duration, compression: CompressionConfig) -> FileSystemCache {
        let config = FileSystemCacheConfig {
            max_age,
            compression,
            ..FileSystemCacheConfig::new(dir)
        };
        FileSystemCache::open(config, 1024).await.unwrap()
    }

    async fn store(cache: &FileSystemCache, key: &str, payload: &[u8]) {
        let mut sink = cache.put(key, CacheValueMetadata::default()).await.unwrap();
        for chunk in payload.chunks(500) {
            sink.write(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        sink.commit().await.unwrap();
    }

    async fn load(cache: &FileSystemCache, key: &str) -> Option<Vec<u8>> {
        let value = cache.get(key).await.unwrap()?;
        let chunks: Vec<Bytes> = value.content.try_collect().await.unwrap();
        Some(chunks.concat())
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::default()).await;
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        store(&cache, "build/../key:1", &payload).await;

        assert_eq!(load(&cache, "build/../key:1").await.unwrap(), payload);
        assert_eq!(load(&cache, "other").await, None);
        assert_eq!(file_names(dir.path()).len(), 1);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compressed_file_restored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::lz4(0)).await;
        let payload = vec![7u8; 200_000];
        store(&cache, "k", &payload).await;

        let on_disk = std::fs::metadata(cache.inner.entry_path("k")).unwrap().len();
        assert!(on_disk < payload.len() as u64);
        assert_eq!(load(&cache, "k").await.unwrap(), payload);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::default()).await;

        let mut sink = cache.put("k", CacheValueMetadata::default()).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        let names = file_names(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(TEMP_SUFFIX));

        sink.rollback();
        assert!(file_names(dir.path()).is_empty());
        assert_eq!(load(&cache, "k").await, None);
    }

    #[tokio::test]
    async fn test_dropped_sink_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::default()).await;
        {
            let mut sink = cache.put("k", CacheValueMetadata::default()).await.unwrap();
            sink.write(Bytes::from_static(b"partial")).await.unwrap();
        }
        assert!(file_names(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::default()).await;
        store(&cache, "k", b"first").await;
        store(&cache, "k", b"second").await;
        assert_eq!(load(&cache, "k").await.unwrap(), b"second");
        assert_eq!(file_names(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_expired_file_invisible_and_collected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_millis(100), CompressionConfig::default()).await;
        store(&cache, "k", b"short-lived").await;
        assert!(load(&cache, "k").await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(load(&cache, "k").await, None);

        cache.collect_garbage().await.unwrap();
        assert!(file_names(dir.path()).is_empty());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), Duration::from_secs(60), CompressionConfig::default()).await;
        std::fs::write(cache.inner.entry_path("k"), [0u8, 0]).unwrap();
        assert_matches!(cache.get("k").await, Err(Error::BackendProtocol(_)));
    }

    #[tokio::test]
    async fn test_digest_names_files_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileSystemCacheConfig {
            digest: Some(DigestAlgorithm::Sha256),
            ..FileSystemCacheConfig::new(dir.path())
        };
        let cache = FileSystemCache::open(config, 64).await.unwrap();
        store(&cache, "some key", b"value").await;

        let names = file_names(dir.path());
        assert_eq!(names.len(), 1);
        // 32 digest bytes encode to 43 unpadded base64 characters
        assert_eq!(names[0].len(), 43);
        assert_eq!(load(&cache, "some key").await.unwrap(), b"value");
    }
}
