//! Memcached backend implementation
//!
//! A stored value is `metadata length (u32 BE) | metadata JSON | payload`.
//! GET streams the payload straight off the socket; the connection returns
//! to its pool once the last byte has been read. PUT buffers the upload
//! (spilling to an anonymous temporary file past 1 MiB) and sends a single
//! SET on commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::codec::{self, status, Opcode, RequestHeader, SET_EXTRAS_LEN};
use super::pool::{ConnectionPool, PooledConnection};
use super::sharding::select_server;
use super::HostAndPort;
use crate::cache::backend::{CacheBackend, CacheSink, CacheValue, ContentStream};
use crate::cache::compression::{decode_stream, ChunkDecoder, ChunkEncoder, CompressionConfig};
use crate::config::duration_format;
use crate::error::{Error, Result};
use crate::protocol::metadata::METADATA_LENGTH_PREFIX;
use crate::protocol::{process_cache_key, CacheValueMetadata, DigestAlgorithm};

/// Uploads larger than this are buffered on disk
pub const SPILL_THRESHOLD: usize = 0x10_0000;

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// One memcached server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemcacheServerConfig {
    pub endpoint: HostAndPort,
    #[serde(default, deserialize_with = "duration_format::deserialize_option")]
    pub connection_timeout: Option<Duration>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    1
}

impl MemcacheServerConfig {
    pub fn new(endpoint: HostAndPort) -> Self {
        Self {
            endpoint,
            connection_timeout: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Memcached backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemcacheCacheConfig {
    pub servers: Vec<MemcacheServerConfig>,
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

impl MemcacheCacheConfig {
    pub fn new(servers: Vec<MemcacheServerConfig>) -> Self {
        Self {
            servers,
            max_age: default_max_age(),
            digest: None,
            compression: CompressionConfig::default(),
        }
    }
}

// =============================================================================
// Memcache Cache
// =============================================================================

/// Cache backend storing values on memcached servers
#[derive(Debug)]
pub struct MemcacheCache {
    pools: Vec<Arc<ConnectionPool>>,
    config: MemcacheCacheConfig,
    chunk_size: usize,
}

impl MemcacheCache {
    pub fn new(config: MemcacheCacheConfig, chunk_size: usize) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(Error::Config(
                "memcache cache needs at least one server".into(),
            ));
        }
        let pools = config
            .servers
            .iter()
            .map(|server| {
                Arc::new(ConnectionPool::new(
                    server.endpoint.clone(),
                    server.max_connections,
                    server.connection_timeout,
                ))
            })
            .collect();
        Ok(Self {
            pools,
            config,
            chunk_size: chunk_size.max(1),
        })
    }

    fn backend_key(&self, key: &str) -> Result<Vec<u8>> {
        let key = process_cache_key(key, self.config.digest);
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::backend(format!(
                "key of {} bytes exceeds the memcached limit of {MAX_KEY_LENGTH}",
                key.len()
            )));
        }
        Ok(key)
    }

    fn pool_for(&self, key: &[u8]) -> &Arc<ConnectionPool> {
        &self.pools[select_server(key, self.pools.len())]
    }

    fn expiration(&self) -> u32 {
        codec::expiration_for(self.config.max_age.as_secs(), chrono::Utc::now().timestamp())
    }
}

#[async_trait]
impl CacheBackend for MemcacheCache {
    fn name(&self) -> &'static str {
        "memcache"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let key = self.backend_key(key)?;
        let pool = self.pool_for(&key);
        let mut conn = pool.acquire().await?;
        let header = RequestHeader::new(Opcode::Get, key.len() as u16, 0, 0);
        conn.send(header, &[&key[..]]).await?;

        let response = conn.read_header().await?;
        match response.status {
            status::SUCCESS => {}
            status::KEY_NOT_FOUND => {
                conn.skip(response.total_body_length as usize).await?;
                conn.release();
                trace!(endpoint = %pool.endpoint(), "Memcached miss");
                return Ok(None);
            }
            other => return Err(Error::Memcache { status: other }),
        }

        conn.skip(response.prefix_length() as usize).await?;
        let value_length = response.value_length() as usize;
        if value_length < METADATA_LENGTH_PREFIX {
            return Err(Error::backend(format!(
                "memcached value of {value_length} bytes has no metadata record"
            )));
        }
        let mut prefix = [0u8; METADATA_LENGTH_PREFIX];
        conn.read_exact(&mut prefix).await?;
        let metadata_length = CacheValueMetadata::check_length(u32::from_be_bytes(prefix))?;
        if METADATA_LENGTH_PREFIX + metadata_length > value_length {
            return Err(Error::backend(format!(
                "metadata record of {metadata_length} bytes overruns a {value_length} byte value"
            )));
        }
        let record = conn.read_bytes(metadata_length).await?;
        let metadata = CacheValueMetadata::decode(&record)?;

        let remaining = value_length - METADATA_LENGTH_PREFIX - metadata_length;
        let content = payload_stream(conn, remaining, self.chunk_size);
        let content = decode_stream(content, ChunkDecoder::new(&self.config.compression));
        Ok(Some(CacheValue::new(metadata, content)))
    }

    async fn put(&self, key: &str, metadata: CacheValueMetadata) -> Result<Box<dyn CacheSink>> {
        let key = self.backend_key(key)?;
        let pool = Arc::clone(self.pool_for(&key));
        let buffer = BytesMut::from(&metadata.encode()?[..]);
        Ok(Box::new(MemcacheSink {
            key,
            pool,
            encoder: ChunkEncoder::new(&self.config.compression),
            buffer,
            spill: None,
            chunk_size: self.chunk_size,
            expiration: self.expiration(),
        }))
    }

    async fn close(&self) -> Result<()> {
        for pool in &self.pools {
            pool.close();
        }
        Ok(())
    }
}

/// Stream `remaining` payload bytes off the connection, then release it
fn payload_stream(conn: PooledConnection, remaining: usize, chunk_size: usize) -> ContentStream {
    stream::unfold(Some((conn, remaining)), move |state| async move {
        let (mut conn, remaining) = state?;
        if remaining == 0 {
            conn.release();
            return None;
        }
        let len = remaining.min(chunk_size);
        match conn.read_bytes(len).await {
            Ok(chunk) => Some((Ok(chunk), Some((conn, remaining - len)))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

// =============================================================================
// Sink
// =============================================================================

struct SpillFile {
    file: File,
    len: u64,
}

struct MemcacheSink {
    key: Vec<u8>,
    pool: Arc<ConnectionPool>,
    encoder: ChunkEncoder,
    buffer: BytesMut,
    spill: Option<SpillFile>,
    chunk_size: usize,
    expiration: u32,
}

impl MemcacheSink {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        if self.spill.is_none() && self.buffer.len() > SPILL_THRESHOLD {
            let file = tokio::task::spawn_blocking(tempfile::tempfile)
                .await
                .map_err(|e| Error::Internal(format!("spill file task failed: {e}")))??;
            debug!(buffered = self.buffer.len(), "Spilling memcached upload to disk");
            self.spill = Some(SpillFile {
                file: File::from_std(file),
                len: 0,
            });
        }
        if let Some(spill) = self.spill.as_mut() {
            spill.file.write_all(&self.buffer).await?;
            spill.len += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    async fn send_payload(
        conn: &mut PooledConnection,
        spill: Option<SpillFile>,
        buffer: Bytes,
        chunk_size: usize,
    ) -> Result<()> {
        if let Some(mut spill) = spill {
            spill.file.flush().await?;
            spill.file.seek(std::io::SeekFrom::Start(0)).await?;
            let mut chunk = vec![0u8; chunk_size];
            loop {
                let n = spill.file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                conn.write_all(&chunk[..n]).await?;
            }
        }
        for piece in buffer.chunks(chunk_size) {
            conn.write_all(piece).await?;
        }
        conn.flush().await
    }
}

#[async_trait]
impl CacheSink for MemcacheSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let encoded = self.encoder.encode(chunk)?;
        if !encoded.is_empty() {
            self.append(&encoded).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemcacheSink {
            key,
            pool,
            encoder,
            mut buffer,
            spill,
            chunk_size,
            expiration,
        } = *self;
        buffer.extend_from_slice(&encoder.finish()?);

        let value_length = spill.as_ref().map_or(0, |s| s.len) + buffer.len() as u64;
        let limit = u32::MAX as u64 - key.len() as u64 - SET_EXTRAS_LEN as u64;
        if value_length > limit {
            return Err(Error::ContentTooLarge { limit });
        }

        let mut conn = pool.acquire().await?;
        let header = RequestHeader::new(
            Opcode::Set,
            key.len() as u16,
            SET_EXTRAS_LEN,
            value_length as u32,
        );
        let extras = codec::set_extras(expiration);
        conn.send(header, &[&extras[..], &key[..]]).await?;
        Self::send_payload(&mut conn, spill, buffer.freeze(), chunk_size).await?;

        let response = conn.read_header().await?;
        conn.skip(response.total_body_length as usize).await?;
        if !response.is_success() {
            return Err(Error::Memcache {
                status: response.status,
            });
        }
        conn.release();
        trace!(endpoint = %pool.endpoint(), bytes = value_length, "Stored value in memcached");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        trace!(
            buffered = self.buffer.len(),
            spilled = self.spill.as_ref().map_or(0, |s| s.len),
            "Discarding memcached upload"
        );
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
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

    struct OpenGuard(Arc<AtomicUsize>);

    impl Drop for OpenGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn serve(mut stream: TcpStream, store: Store, open: Arc<AtomicUsize>) {
        open.fetch_add(1, Ordering::SeqCst);
        let _guard = OpenGuard(open);
        loop {
            let mut header = [0u8; codec::HEADER_LEN];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let opcode = header[1];
            let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let extras_len = header[4] as usize;
            let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
            let mut body = vec![0u8; body_len];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }
            let key = body[extras_len..extras_len + key_len].to_vec();

            let (status, response_body) = match opcode {
                0x00 => match store.lock().get(&key) {
                    Some(value) => {
                        let mut out = vec![0u8; 4];
                        out.extend_from_slice(value);
                        (0u16, (4u8, out))
                    }
                    None => (1u16, (0u8, b"Not found".to_vec())),
                },
                _ => {
                    store
                        .lock()
                        .insert(key, body[extras_len + key_len..].to_vec());
                    (0u16, (0u8, Vec::new()))
                }
            };
            let (extras, payload) = response_body;
            let mut out = vec![0u8; codec::HEADER_LEN];
            out[0] = codec::RESPONSE_MAGIC;
            out[1] = opcode;
            out[4] = extras;
            out[6..8].copy_from_slice(&status.to_be_bytes());
            out[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
    }

    /// Fake server plus the number of client connections it has open
    async fn tracked_memcached() -> (HostAndPort, Store, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::default();
        let open = Arc::new(AtomicUsize::new(0));
        let (shared, counter) = (Arc::clone(&store), Arc::clone(&open));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared), Arc::clone(&counter)));
            }
        });
        (HostAndPort::new("127.0.0.1", port), store, open)
    }

    async fn fake_memcached() -> (HostAndPort, Store) {
        let (endpoint, store, _) = tracked_memcached().await;
        (endpoint, store)
    }

    async fn store(cache: &MemcacheCache, key: &str, payload: &[u8]) {
        let mut sink = cache.put(key, CacheValueMetadata::default()).await.unwrap();
        for chunk in payload.chunks(64 * 1024) {
            sink.write(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        sink.commit().await.unwrap();
    }

    async fn load(cache: &MemcacheCache, key: &str) -> Option<Vec<u8>> {
        let value = cache.get(key).await.unwrap()?;
        let chunks: Vec<Bytes> = value.content.try_collect().await.unwrap();
        Some(chunks.concat())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (endpoint, stored) = fake_memcached().await;
        let cache = MemcacheCache::new(
            MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(endpoint)]),
            1024,
        )
        .unwrap();

        store(&cache, "key", b"hello memcached").await;
        assert_eq!(load(&cache, "key").await.unwrap(), b"hello memcached");
        assert_eq!(load(&cache, "absent").await, None);

        let raw = stored.lock().get(&b"key"[..]).cloned().unwrap();
        let metadata_length = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        assert_eq!(&raw[4 + metadata_length..], b"hello memcached");
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_upload_spills_to_disk() {
        let (endpoint, stored) = fake_memcached().await;
        let mut config = MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(endpoint)]);
        config.digest = Some(DigestAlgorithm::Md5);
        let cache = MemcacheCache::new(config, 4096).unwrap();

        let mut seed = 0x2545_f491u32;
        let payload: Vec<u8> = (0..3 * SPILL_THRESHOLD)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();
        store(&cache, "big", &payload).await;
        assert_eq!(load(&cache, "big").await.unwrap(), payload);

        let key = DigestAlgorithm::Md5.digest(b"big");
        assert!(stored.lock().get(&key).unwrap().len() > payload.len());
    }

    #[tokio::test]
    async fn test_compressed_value_restored() {
        let (endpoint, stored) = fake_memcached().await;
        let mut config = MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(endpoint)]);
        config.compression = CompressionConfig::lz4(0);
        let cache = MemcacheCache::new(config, 4096).unwrap();

        let payload = vec![b'a'; 300_000];
        store(&cache, "zipped", &payload).await;
        assert!(stored.lock().get(&b"zipped"[..]).unwrap().len() < payload.len());
        assert_eq!(load(&cache, "zipped").await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_keys_spread_over_servers() {
        let (first, first_store) = fake_memcached().await;
        let (second, second_store) = fake_memcached().await;
        let cache = MemcacheCache::new(
            MemcacheCacheConfig::new(vec![
                MemcacheServerConfig::new(first),
                MemcacheServerConfig::new(second),
            ]),
            1024,
        )
        .unwrap();

        for i in 0..20 {
            store(&cache, &format!("key-{i}"), b"v").await;
        }
        for i in 0..20 {
            assert!(load(&cache, &format!("key-{i}")).await.is_some());
        }
        let first_count = first_store.lock().len();
        let second_count = second_store.lock().len();
        assert_eq!(first_count + second_count, 20);
        assert!(first_count > 0 && second_count > 0);
    }

    #[tokio::test]
    async fn test_connection_returned_after_full_read() {
        let (endpoint, _) = fake_memcached().await;
        let cache = MemcacheCache::new(
            MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(endpoint)]),
            3,
        )
        .unwrap();
        store(&cache, "key", b"0123456789").await;
        assert_eq!(cache.pools[0].idle_connections(), 1);

        let value = cache.get("key").await.unwrap().unwrap();
        assert_eq!(cache.pools[0].idle_connections(), 0);
        let chunks: Vec<Bytes> = value.content.try_collect().await.unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(cache.pools[0].idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_value_closes_connection() {
        let (endpoint, _, open) = tracked_memcached().await;
        let cache = MemcacheCache::new(
            MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(endpoint)]),
            3,
        )
        .unwrap();
        store(&cache, "key", b"0123456789").await;
        assert_eq!(open.load(Ordering::SeqCst), 1);

        let mut value = cache.get("key").await.unwrap().unwrap();
        assert!(value.content.next().await.unwrap().is_ok());
        drop(value);
        assert_eq!(cache.pools[0].idle_connections(), 0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while open.load(Ordering::SeqCst) != 0 {
            assert!(tokio::time::Instant::now() < deadline, "connection left open");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // the only permit is free again and a fresh connection is opened
        assert_eq!(load(&cache, "key").await.unwrap(), b"0123456789");
        assert_eq!(cache.pools[0].idle_connections(), 1);
        assert_eq!(open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_long_key_without_digest_rejected() {
        let cache = MemcacheCache::new(
            MemcacheCacheConfig::new(vec![MemcacheServerConfig::new(HostAndPort::new(
                "127.0.0.1",
                1,
            ))]),
            1024,
        )
        .unwrap();
        let key = "k".repeat(MAX_KEY_LENGTH + 1);
        assert_matches!(cache.get(&key).await, Err(Error::BackendProtocol(_)));
    }

    #[test]
    fn test_requires_servers() {
        assert_matches!(
            MemcacheCache::new(MemcacheCacheConfig::new(Vec::new()), 1024),
            Err(Error::Config(_))
        );
    }
}
