//! In-Memory Cache Backend
//!
//! Values live in a hash map guarded by a single lock together with a
//! min-heap of expiry times and the running total of stored bytes.
//!
//! # Design
//!
//! - Writes are buffered in the sink and published atomically on commit
//! - After every insert the earliest-expiring entries are evicted until
//!   the total size fits `max_size`
//! - A dedicated reclaimer thread sleeps until the earliest expiry and
//!   removes expired entries; removal is compare-and-remove so a value
//!   overwritten in the meantime is never dropped by a stale heap element

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, trace};

use super::backend::{chunked, CacheBackend, CacheSink, CacheValue};
use super::compression::{decode_stream, ChunkDecoder, ChunkEncoder, CompressionConfig};
use crate::config::{duration_format, size_format};
use crate::error::{Error, Result};
use crate::protocol::{process_cache_key, CacheValueMetadata, DigestAlgorithm};

/// In-memory backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InMemoryCacheConfig {
    /// Lifetime of a stored value
    #[serde(default = "default_max_age", deserialize_with = "duration_format::deserialize")]
    pub max_age: Duration,
    /// Upper bound for the total stored bytes
    #[serde(default = "default_max_size", deserialize_with = "size_format::deserialize")]
    pub max_size: u64,
    /// Digest applied to keys
    #[serde(default)]
    pub digest: Option<DigestAlgorithm>,
    #[serde(default)]
    pub compression: CompressionConfig,
}

fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_size() -> u64 {
    128 * 1024 * 1024
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            max_size: default_max_size(),
            digest: None,
            compression: CompressionConfig::default(),
        }
    }
}

/// Point-in-time statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug)]
struct CacheEntry {
    metadata: CacheValueMetadata,
    content: Bytes,
    expiry: Instant,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

struct RemovalQueueElement {
    expiry: Instant,
    key: Vec<u8>,
    value: Weak<CacheEntry>,
}

impl PartialEq for RemovalQueueElement {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for RemovalQueueElement {}

impl PartialOrd for RemovalQueueElement {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemovalQueueElement {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.key.cmp(&other.key))
    }
}

#[derive(Default)]
struct Store {
    map: HashMap<Vec<u8>, Arc<CacheEntry>>,
    removal_queue: BinaryHeap<Reverse<RemovalQueueElement>>,
    size: u64,
}

impl Store {
    fn insert(&mut self, key: Vec<u8>, entry: Arc<CacheEntry>) {
        self.removal_queue.push(Reverse(RemovalQueueElement {
            expiry: entry.expiry,
            key: key.clone(),
            value: Arc::downgrade(&entry),
        }));
        self.size += entry.size();
        if let Some(old) = self.map.insert(key, entry) {
            self.size -= old.size();
        }
    }

    /// Remove the element's key only if it still maps to the same value
    fn remove_if_current(&mut self, element: &RemovalQueueElement) -> bool {
        let current = match self.map.get(&element.key) {
            Some(current) => current,
            None => return false,
        };
        if !std::ptr::eq(Arc::as_ptr(current), element.value.as_ptr()) {
            return false;
        }
        if let Some(removed) = self.map.remove(&element.key) {
            self.size -= removed.size();
        }
        true
    }

    fn evict_to(&mut self, max_size: u64) -> u64 {
        let mut evicted = 0;
        while self.size > max_size {
            match self.removal_queue.pop() {
                Some(Reverse(element)) => {
                    if self.remove_if_current(&element) {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        evicted
    }

    /// Drop expired entries; returns how many were removed and the next expiry
    fn reclaim_expired(&mut self, now: Instant) -> (u64, Option<Instant>) {
        let mut reclaimed = 0;
        while let Some(Reverse(head)) = self.removal_queue.peek() {
            if head.expiry > now {
                return (reclaimed, Some(head.expiry));
            }
            if let Some(Reverse(element)) = self.removal_queue.pop() {
                if self.remove_if_current(&element) {
                    reclaimed += 1;
                }
            }
        }
        (reclaimed, None)
    }
}

struct ReclaimerSignal {
    running: bool,
    wake: bool,
}

struct Shared {
    store: RwLock<Store>,
    signal: Mutex<ReclaimerSignal>,
    condvar: Condvar,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Shared {
    fn wake_reclaimer(&self) {
        let mut signal = self.signal.lock();
        signal.wake = true;
        self.condvar.notify_one();
    }

    fn stop_reclaimer(&self) {
        let mut signal = self.signal.lock();
        signal.running = false;
        self.condvar.notify_one();
    }

    fn run_reclaimer(&self) {
        loop {
            let (reclaimed, next) = self.store.write().reclaim_expired(Instant::now());
            if reclaimed > 0 {
                self.expirations.fetch_add(reclaimed, Ordering::Relaxed);
                trace!(reclaimed, "Removed expired in-memory entries");
            }

            let mut signal = self.signal.lock();
            if !signal.running {
                break;
            }
            if signal.wake {
                signal.wake = false;
                continue;
            }
            match next {
                Some(deadline) => {
                    self.condvar.wait_until(&mut signal, deadline);
                }
                None => self.condvar.wait(&mut signal),
            }
            signal.wake = false;
            if !signal.running {
                break;
            }
        }
    }
}

// =============================================================================
// In-Memory Cache
// =============================================================================

/// Cache backend keeping every value in process memory
pub struct InMemoryCache {
    shared: Arc<Shared>,
    config: InMemoryCacheConfig,
    chunk_size: usize,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryCache {
    /// Create the cache and start its reclaimer thread
    pub fn new(config: InMemoryCacheConfig, chunk_size: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            store: RwLock::new(Store::default()),
            signal: Mutex::new(ReclaimerSignal {
                running: true,
                wake: false,
            }),
            condvar: Condvar::new(),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        });
        let reclaimer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("in-memory-reclaimer".into())
                .spawn(move || shared.run_reclaimer())?
        };
        Ok(Self {
            shared,
            config,
            chunk_size,
            reclaimer: Mutex::new(Some(reclaimer)),
        })
    }

    pub fn stats(&self) -> InMemoryStats {
        let store = self.shared.store.read();
        InMemoryStats {
            entries: store.map.len(),
            size_bytes: store.size,
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            expirations: self.shared.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        self.shared.stop_reclaimer();
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let key = process_cache_key(key, self.config.digest);
        let entry = {
            let store = self.shared.store.read();
            match store.map.get(&key) {
                Some(entry) if entry.expiry > Instant::now() => Arc::clone(entry),
                _ => return Ok(None),
            }
        };
        let content = decode_stream(
            chunked(entry.content.clone(), self.chunk_size),
            ChunkDecoder::new(&self.config.compression),
        );
        Ok(Some(CacheValue::new(entry.metadata.clone(), content)))
    }

    async fn put(&self, key: &str, metadata: CacheValueMetadata) -> Result<Box<dyn CacheSink>> {
        Ok(Box::new(InMemorySink {
            key: process_cache_key(key, self.config.digest),
            metadata,
            encoder: ChunkEncoder::new(&self.config.compression),
            buffer: BytesMut::new(),
            shared: Arc::clone(&self.shared),
            max_age: self.config.max_age,
            max_size: self.config.max_size,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.stop_reclaimer();
        let handle = self.reclaimer.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| Error::Internal(format!("reclaimer join failed: {e}")))?
                .map_err(|_| Error::Internal("reclaimer thread panicked".into()))?;
        }
        debug!("In-memory cache closed");
        Ok(())
    }
}

// =============================================================================
// Sink
// =============================================================================

struct InMemorySink {
    key: Vec<u8>,
    metadata: CacheValueMetadata,
    encoder: ChunkEncoder,
    buffer: BytesMut,
    shared: Arc<Shared>,
    max_age: Duration,
    max_size: u64,
}

#[async_trait]
impl CacheSink for InMemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let encoded = self.encoder.encode(chunk)?;
        self.buffer.extend_from_slice(&encoded);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemorySink {
            key,
            metadata,
            encoder,
            mut buffer,
            shared,
            max_age,
            max_size,
        } = *self;
        buffer.extend_from_slice(&encoder.finish()?);

        let entry = Arc::new(CacheEntry {
            metadata,
            content: buffer.freeze(),
            expiry: Instant::now() + max_age,
        });
        let evicted = {
            let mut store = shared.store.write();
            store.insert(key, entry);
            store.evict_to(max_size)
        };
        if evicted > 0 {
            shared.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, "Evicted in-memory entries over the size limit");
        }
        shared.wake_reclaimer();
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        trace!(buffered = self.buffer.len(), "Discarding in-memory upload");
    }
}

// =============================================================================
// Tests
// =============================================================================
