//! Per-server connection pools
//!
//! Each pool caps the number of connections checked out at once with a
//! semaphore and keeps released connections on an idle list for reuse.
//! A connection goes back to the idle list only through
//! [`PooledConnection::release`], which callers invoke after a complete
//! request/response cycle; dropping a connection mid-exchange closes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::codec::{RequestHeader, ResponseHeader, HEADER_LEN};
use super::HostAndPort;
use crate::error::{Error, Result};

/// Connection pool for one memcached server
#[derive(Debug)]
pub struct ConnectionPool {
    endpoint: HostAndPort,
    connect_timeout: Option<Duration>,
    idle: Mutex<Vec<TcpStream>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        endpoint: HostAndPort,
        max_connections: usize,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            endpoint,
            connect_timeout,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &HostAndPort {
        &self.endpoint
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a connection, waiting while `max_connections` are in use
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(format!("connection pool for {} is closed", self.endpoint)))?;
        let idle = self.idle.lock().pop();
        let stream = match idle {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        Ok(PooledConnection {
            stream: Some(stream),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn connect(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port));
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to memcached at {} timed out", self.endpoint),
                )
            })??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint, "Opened memcached connection");
        Ok(stream)
    }

    /// Refuse new checkouts and drop idle connections
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        debug!(endpoint = %self.endpoint, idle = drained.len(), "Closed memcached pool");
    }
}

/// A checked-out connection
#[derive(Debug)]
pub struct PooledConnection {
    stream: Option<TcpStream>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Write a request header followed by body parts
    pub async fn send(&mut self, header: RequestHeader, parts: &[&[u8]]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + parts.iter().map(|p| p.len()).sum::<usize>());
        header.encode(&mut buf);
        for part in parts {
            buf.extend_from_slice(part);
        }
        self.stream()?.write_all(&buf).await?;
        trace!(opcode = ?header.opcode, bytes = buf.len(), "Sent memcached request");
        Ok(())
    }

    /// Write raw value bytes of a request already announced by `send`
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream()?.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream()?.flush().await?;
        Ok(())
    }

    pub async fn read_header(&mut self) -> Result<ResponseHeader> {
        let mut raw = [0u8; HEADER_LEN];
        self.read_exact(&mut raw).await?;
        ResponseHeader::decode(&raw)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.stream()?.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::backend(
                "memcached closed the connection mid-response",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Read exactly `len` bytes
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Discard `len` bytes of the current response
    pub async fn skip(&mut self, mut len: usize) -> Result<()> {
        let mut scratch = [0u8; 512];
        while len > 0 {
            let n = len.min(scratch.len());
            self.read_exact(&mut scratch[..n]).await?;
            len -= n;
        }
        Ok(())
    }

    /// Return the connection to its pool's idle list
    pub fn release(mut self) {
        if let Some(stream) = self.stream.take() {
            if !self.pool.closed.load(Ordering::Acquire) {
                self.pool.idle.lock().push(stream);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
