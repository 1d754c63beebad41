//! Connection idle detection
//!
//! [`IdleStream`] records read and write progress on a connection's socket
//! into a shared [`Activity`]; [`Activity::watch`] resolves once one of the
//! configured limits is exceeded:
//!
//! - read idle: waiting for inbound bytes with no read or write progress
//!   for `read_idle_timeout`
//! - write idle: a write blocked on the peer for `write_idle_timeout`
//! - idle: nothing read or written for `idle_timeout`
//!
//! A zero duration disables the corresponding limit. The connection task
//! drops the HTTP connection when the watchdog fires, which rolls back the
//! exchange in progress.

use std::fmt;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::config::ConnectionConfig;

/// Idle limits of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl IdleTimeouts {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            read: config.read_idle_timeout,
            write: config.write_idle_timeout,
            idle: config.idle_timeout,
        }
    }

    /// Smallest enabled limit
    fn shortest(&self) -> Option<Duration> {
        [self.read, self.write, self.idle]
            .into_iter()
            .filter(|limit| !limit.is_zero())
            .min()
    }
}

/// Which limit a connection exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    Read,
    Write,
    All,
}

impl fmt::Display for IdleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleKind::Read => write!(f, "Read timeout"),
            IdleKind::Write => write!(f, "Write timeout"),
            IdleKind::All => write!(f, "Idle timeout"),
        }
    }
}

struct ActivityState {
    last_read: Instant,
    last_write: Instant,
    read_waiting_since: Option<Instant>,
    write_blocked_since: Option<Instant>,
}

/// Socket activity shared between a connection's stream and its watchdog
#[derive(Clone)]
pub struct Activity {
    state: Arc<Mutex<ActivityState>>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(ActivityState {
                last_read: now,
                last_write: now,
                read_waiting_since: None,
                write_blocked_since: None,
            })),
        }
    }

    fn record_read(&self) {
        let mut state = self.state.lock();
        state.last_read = Instant::now();
        state.read_waiting_since = None;
    }

    fn record_read_pending(&self) {
        let mut state = self.state.lock();
        state.read_waiting_since.get_or_insert_with(Instant::now);
    }

    fn record_write(&self) {
        let mut state = self.state.lock();
        state.last_write = Instant::now();
        state.write_blocked_since = None;
    }

    fn record_write_blocked(&self) {
        let mut state = self.state.lock();
        state.write_blocked_since.get_or_insert_with(Instant::now);
    }

    /// The limit exceeded at `now`, or the earliest instant one could be
    fn check(&self, timeouts: &IdleTimeouts, now: Instant) -> Result<Option<Instant>, IdleKind> {
        let state = self.state.lock();
        let candidates = [
            (
                IdleKind::Read,
                timeouts.read,
                state
                    .read_waiting_since
                    .map(|since| since.max(state.last_write)),
            ),
            (IdleKind::Write, timeouts.write, state.write_blocked_since),
            (
                IdleKind::All,
                timeouts.idle,
                Some(state.last_read.max(state.last_write)),
            ),
        ];

        let mut next: Option<Instant> = None;
        for (kind, limit, since) in candidates {
            let Some(since) = since else { continue };
            if limit.is_zero() {
                continue;
            }
            let deadline = since + limit;
            if deadline <= now {
                return Err(kind);
            }
            next = Some(next.map_or(deadline, |next| next.min(deadline)));
        }
        Ok(next)
    }

    /// Resolve with the first limit the connection exceeds; never resolves
    /// when every limit is disabled
    pub async fn watch(self, timeouts: IdleTimeouts) -> IdleKind {
        let Some(shortest) = timeouts.shortest() else {
            return std::future::pending().await;
        };
        loop {
            let now = Instant::now();
            match self.check(&timeouts, now) {
                Err(kind) => return kind,
                Ok(next) => {
                    let wake = next.map_or(now + shortest, |deadline| deadline.min(now + shortest));
                    tokio::time::sleep_until(wake).await;
                }
            }
        }
    }
}

// =============================================================================
// Idle Stream
// =============================================================================

/// IO wrapper feeding an [`Activity`]
pub struct IdleStream<S> {
    inner: S,
    activity: Activity,
}

impl<S> IdleStream<S> {
    pub fn new(inner: S, activity: Activity) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if buf.filled().len() > before => this.activity.record_read(),
            Poll::Pending => this.activity.record_read_pending(),
            _ => {}
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> IdleStream<S> {
    fn observe_write(&self, poll: &Poll<io::Result<usize>>) {
        match poll {
            Poll::Ready(Ok(written)) if *written > 0 => self.activity.record_write(),
            Poll::Pending => self.activity.record_write_blocked(),
            _ => {}
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe_write(&poll);
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.observe_write(&poll);
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if poll.is_pending() {
            this.activity.record_write_blocked();
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn only_read(limit: Duration) -> IdleTimeouts {
        IdleTimeouts {
            read: limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_from_config() {
        let timeouts = IdleTimeouts::from_config(&ConnectionConfig::default());
        assert_eq!(timeouts.idle, Duration::from_secs(30));
        assert_eq!(timeouts.read, Duration::from_secs(60));
        assert_eq!(timeouts.shortest(), Some(Duration::from_secs(30)));
        assert_eq!(IdleTimeouts::default().shortest(), None);
    }

    #[tokio::test]
    async fn test_read_limit_needs_a_pending_read() {
        let activity = Activity::new();
        let timeouts = only_read(Duration::from_secs(1));
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(activity.check(&timeouts, later), Ok(None));

        activity.record_read_pending();
        assert_eq!(activity.check(&timeouts, later), Err(IdleKind::Read));

        activity.record_read();
        assert_eq!(activity.check(&timeouts, later), Ok(None));
    }

    #[tokio::test]
    async fn test_write_progress_postpones_read_limit() {
        let activity = Activity::new();
        let timeouts = only_read(Duration::from_secs(10));
        activity.record_read_pending();
        let waiting_since = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        activity.record_write();

        let deadline = activity.check(&timeouts, Instant::now()).unwrap().unwrap();
        assert!(deadline >= waiting_since + Duration::from_secs(10) + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_blocked_write_limit() {
        let activity = Activity::new();
        let timeouts = IdleTimeouts {
            write: Duration::from_secs(1),
            ..Default::default()
        };
        activity.record_write_blocked();
        let soon = Instant::now() + Duration::from_millis(500);
        assert!(activity.check(&timeouts, soon).unwrap().is_some());
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(activity.check(&timeouts, later), Err(IdleKind::Write));
    }

    #[tokio::test]
    async fn test_overall_idle_limit() {
        let activity = Activity::new();
        let timeouts = IdleTimeouts {
            idle: Duration::from_secs(1),
            ..Default::default()
        };
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(activity.check(&timeouts, later), Err(IdleKind::All));
    }

    #[tokio::test]
    async fn test_disabled_limits_never_fire() {
        let watch = Activity::new().watch(IdleTimeouts::default());
        assert!(timeout(Duration::from_millis(50), watch).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_reader_detected() {
        let (client, server) = duplex(64);
        let activity = Activity::new();
        let mut stream = IdleStream::new(server, activity.clone());
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read(&mut buf).await
        });

        let kind = timeout(
            Duration::from_secs(5),
            activity.watch(only_read(Duration::from_millis(100))),
        )
        .await
        .unwrap();
        assert_eq!(kind, IdleKind::Read);
        reader.abort();
        drop(client);
    }

    #[tokio::test]
    async fn test_blocked_writer_detected() {
        let (client, server) = duplex(16);
        let activity = Activity::new();
        let mut stream = IdleStream::new(server, activity.clone());
        let writer = tokio::spawn(async move { stream.write_all(&[0u8; 1024]).await });

        let timeouts = IdleTimeouts {
            write: Duration::from_millis(100),
            ..Default::default()
        };
        let kind = timeout(Duration::from_secs(5), activity.watch(timeouts))
            .await
            .unwrap();
        assert_eq!(kind, IdleKind::Write);
        writer.abort();
        drop(client);
    }

    #[tokio::test]
    async fn test_traffic_keeps_connection_alive() {
        let (mut client, server) = duplex(64);
        let activity = Activity::new();
        let mut stream = IdleStream::new(server, activity.clone());
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let watch = tokio::spawn(activity.watch(only_read(Duration::from_millis(150))));
        for _ in 0..6 {
            client.write_all(b"x").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!watch.is_finished());

        let kind = timeout(Duration::from_secs(5), watch).await.unwrap().unwrap();
        assert_eq!(kind, IdleKind::Read);
    }
}
