//! Cache exchange handler
//!
//! One handler per connection drives the exchange state machine between
//! inbound [`CacheMessage`]s and the backend:
//!
//! ```text
//!            GetRequest (hit)             LastContent / error
//!   Idle ─────────────────────► Get ─────────────────────────► Idle
//!     │      PutRequest                   LastContent / error
//!     └───────────────────────► Put ─────────────────────────► Idle
//! ```
//!
//! Every failure is turned into an `ExceptionCaught` message after the
//! in-progress write (if any) has been rolled back. The handler sits
//! behind a per-connection async mutex; an [`Exchange`] owns the lock for
//! the lifetime of one request/response cycle so exchanges on a
//! connection never overlap.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, trace, warn};

use crate::cache::{CacheSink, ContentStream, SharedBackend};
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::CacheMessage;

enum InProgressRequest {
    Get {
        key: String,
        content: ContentStream,
    },
    Put {
        key: String,
        sink: Box<dyn CacheSink>,
    },
}

/// Per-connection exchange state machine
pub struct CacheHandler {
    backend: SharedBackend,
    in_progress: Option<InProgressRequest>,
}

impl CacheHandler {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            in_progress: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_progress.is_none()
    }

    /// Process one inbound message; `None` means nothing to send yet
    pub async fn handle(&mut self, message: CacheMessage) -> Option<CacheMessage> {
        trace!(message = message.name(), "Inbound cache message");
        match self.dispatch(message).await {
            Ok(reply) => reply,
            Err(e) => Some(self.exception_caught(e)),
        }
    }

    async fn dispatch(&mut self, message: CacheMessage) -> Result<Option<CacheMessage>> {
        match message {
            CacheMessage::GetRequest { key } => {
                self.ensure_idle("GetRequest")?;
                match self.backend.get(&key).await? {
                    Some(value) => {
                        debug!(key = %key, "Cache hit");
                        metrics::CACHE_HITS.inc();
                        let metadata = value.metadata;
                        self.in_progress = Some(InProgressRequest::Get {
                            key: key.clone(),
                            content: value.content,
                        });
                        Ok(Some(CacheMessage::ValueFound { key, metadata }))
                    }
                    None => {
                        debug!(key = %key, "Cache miss");
                        metrics::CACHE_MISSES.inc();
                        Ok(Some(CacheMessage::ValueNotFound))
                    }
                }
            }
            CacheMessage::PutRequest { key, metadata } => {
                self.ensure_idle("PutRequest")?;
                let sink = self.backend.put(&key, metadata).await?;
                debug!(key = %key, "Started upload");
                self.in_progress = Some(InProgressRequest::Put { key, sink });
                Ok(None)
            }
            CacheMessage::Content(chunk) => {
                match self.in_progress.as_mut() {
                    Some(InProgressRequest::Put { sink, .. }) => sink.write(chunk).await?,
                    _ => return Err(unexpected("Content")),
                }
                Ok(None)
            }
            CacheMessage::LastContent(chunk) => {
                let (key, mut sink) = match self.in_progress.take() {
                    Some(InProgressRequest::Put { key, sink }) => (key, sink),
                    other => {
                        self.in_progress = other;
                        return Err(unexpected("LastContent"));
                    }
                };
                if !chunk.is_empty() {
                    if let Err(e) = sink.write(chunk).await {
                        sink.rollback();
                        return Err(e);
                    }
                }
                sink.commit().await?;
                debug!(key = %key, "Committed upload");
                Ok(Some(CacheMessage::PutResponse { key }))
            }
            other => Err(unexpected(other.name())),
        }
    }

    /// Next outbound payload message of a GET exchange
    pub async fn next_outbound(&mut self) -> Option<CacheMessage> {
        let content = match self.in_progress.as_mut() {
            Some(InProgressRequest::Get { content, .. }) => content,
            _ => return None,
        };
        match content.next().await {
            Some(Ok(chunk)) => Some(CacheMessage::Content(chunk)),
            Some(Err(e)) => Some(self.exception_caught(e)),
            None => {
                if let Some(InProgressRequest::Get { key, .. }) = self.in_progress.take() {
                    trace!(key = %key, "Finished streaming value");
                }
                Some(CacheMessage::LastContent(Bytes::new()))
            }
        }
    }

    /// Abort the current exchange and report the error
    pub fn exception_caught(&mut self, cause: Error) -> CacheMessage {
        match &cause {
            Error::ContentTooLarge { .. } | Error::ProtocolViolation(_) => {
                warn!(error = %cause, "Cache exchange rejected")
            }
            Error::ConnectionClosed => debug!("Client went away mid-exchange"),
            _ => error!(error = %cause, "Cache exchange failed"),
        }
        metrics::EXCHANGE_ERRORS.inc();
        self.rollback();
        CacheMessage::ExceptionCaught(cause)
    }

    /// Discard the in-progress exchange; returns whether there was one
    pub fn rollback(&mut self) -> bool {
        match self.in_progress.take() {
            Some(InProgressRequest::Put { key, sink }) => {
                debug!(key = %key, "Rolling back upload");
                sink.rollback();
                true
            }
            Some(InProgressRequest::Get { key, .. }) => {
                debug!(key = %key, "Abandoning value stream");
                true
            }
            None => false,
        }
    }

    fn ensure_idle(&self, message: &str) -> Result<()> {
        if self.in_progress.is_some() {
            return Err(Error::ProtocolViolation(format!(
                "{message} received while another exchange is in progress"
            )));
        }
        Ok(())
    }
}

fn unexpected(message: &str) -> Error {
    Error::ProtocolViolation(format!("unexpected {message} message"))
}

/// Exclusive use of a connection's handler for one exchange.
///
/// Dropping an exchange before it completed rolls back whatever was in
/// progress, which is how client disconnects reach the backend.
pub struct Exchange {
    handler: OwnedMutexGuard<CacheHandler>,
}

impl Exchange {
    pub async fn begin(handler: Arc<Mutex<CacheHandler>>) -> Self {
        let handler = handler.lock_owned().await;
        metrics::EXCHANGES_IN_FLIGHT.inc();
        Self { handler }
    }

    pub async fn handle(&mut self, message: CacheMessage) -> Option<CacheMessage> {
        self.handler.handle(message).await
    }

    pub async fn next_outbound(&mut self) -> Option<CacheMessage> {
        self.handler.next_outbound().await
    }

    pub fn exception_caught(&mut self, cause: Error) -> CacheMessage {
        self.handler.exception_caught(cause)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.handler.rollback() {
            debug!("Exchange dropped before completion");
        }
        metrics::EXCHANGES_IN_FLIGHT.dec();
    }
}

// =============================================================================
// Tests
// =============================================================================
