//! Cache server
//!
//! Accepts TCP connections and serves each one with hyper's HTTP/1.1
//! connection driver on its own task:
//!
//! ```text
//! ┌──────────────┐  accept   ┌─────────────────────────────────┐
//! │ accept loop  │──────────▶│ connection task  (span: id,peer)│
//! │ (cancellable)│           │ [PROXY header] ─▶ idle watchdog │
//! └──────────────┘           │ hyper http1 ─▶ CacheService     │
//!                            │   └─▶ CacheHandler ─▶ backend   │
//!                            └─────────────────────────────────┘
//! ```
//!
//! Connections are tracked so [`ServerHandle::shutdown`] can wait for them
//! to drain before the backend is closed.

pub mod handler;
pub mod idle;
pub mod proxy;
pub mod routing;
pub mod service;
pub mod shutdown;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use handler::{CacheHandler, Exchange};
pub use idle::{IdleKind, IdleTimeouts};
pub use proxy::ProxyProtocolConfig;
pub use routing::ServerPrefix;
pub use service::{CacheService, ResponseBody, ServerContext};
pub use shutdown::ShutdownReport;

use crate::cache::{open_backend, SharedBackend};
use crate::config::Configuration;
use crate::error::{Error, Result};
use idle::{Activity, IdleStream};
use proxy::Rewind;

/// Configured, not yet listening server
pub struct BuildCacheServer {
    config: Configuration,
    context: Arc<ServerContext>,
}

impl BuildCacheServer {
    /// Validate the configuration and open its backend
    pub async fn new(config: Configuration) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.cache, config.connection.chunk_size).await?;
        Ok(Self::with_backend(config, backend))
    }

    /// Server over an already opened backend
    pub fn with_backend(config: Configuration, backend: SharedBackend) -> Self {
        let context = Arc::new(ServerContext::new(&config, backend));
        Self { config, context }
    }

    /// Bind the listener and start accepting connections
    pub async fn bind(self) -> Result<ServerHandle> {
        let listener = bind_listener(&self.config).await?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            prefix = %self.context.prefix,
            backend = self.context.backend.name(),
            "Build cache server listening"
        );

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            token.clone(),
            tracker.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            token,
            tracker,
            accept_task,
            backend: Arc::clone(&self.context.backend),
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// Running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    backend: SharedBackend,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being served
    pub fn connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting, drain connections and close the backend
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutting down build cache server");
        self.token.cancel();
        if let Err(e) = self.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        shutdown::coordinate(&self.tracker, &self.backend, self.shutdown_timeout).await
    }
}

async fn bind_listener(config: &Configuration) -> Result<TcpListener> {
    let address = config.listen_address();
    let addr = lookup_host(&address)
        .await
        .map_err(|e| Error::Config(format!("cannot resolve {address}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{address} resolved to no address")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;
    Ok(socket.listen(config.backlog)?)
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        next_id += 1;
        let span = info_span!("connection", id = next_id, %peer);
        tracker.spawn(
            serve_connection(stream, peer, Arc::clone(&context), token.clone()).instrument(span),
        );
    }
    debug!("Accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    token: CancellationToken,
) {
    debug!("Connection accepted");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let activity = Activity::new();
    let watchdog = activity.clone().watch(context.idle_timeouts);
    tokio::pin!(watchdog);
    let mut stream = IdleStream::new(stream, activity);

    let (client, prefix) = if context.proxy_protocol.enabled {
        let header = tokio::select! {
            header = proxy::read_header(&mut stream) => header,
            kind = &mut watchdog => {
                debug!("{kind} reached before the PROXY header, closing the connection");
                return;
            }
        };
        match header {
            Ok((advertised, prefix)) => {
                let client = context.proxy_protocol.client_address(peer, advertised);
                match advertised {
                    Some(source) if source == client => debug!(%client, "Proxied connection"),
                    Some(source) => debug!(%source, "Ignoring PROXY header from untrusted peer"),
                    None => {}
                }
                (client, prefix)
            }
            Err(e) => {
                warn!(error = %e, "Rejecting connection");
                return;
            }
        }
    } else {
        (peer, Bytes::new())
    };

    let service = CacheService::new(context, client);
    let connection = http1::Builder::new().serve_connection(
        TokioIo::new(Rewind::new(prefix, stream)),
        service_fn(move |request| {
            let service = service.clone();
            async move { Ok::<_, Infallible>(service.call(request).await) }
        }),
    );
    tokio::pin!(connection);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            result = connection.as_mut() => break result,
            kind = &mut watchdog => {
                // Dropping the connection drops the exchange, rolling it back
                debug!("{kind} reached, closing the connection");
                return;
            }
            _ = token.cancelled(), if !draining => {
                debug!("Finishing current exchange before shutdown");
                connection.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    };

    match result {
        Ok(()) => debug!("Connection closed"),
        Err(e) if e.is_incomplete_message() || e.is_canceled() => {
            debug!(error = %e, "Connection closed mid-request")
        }
        Err(e) => warn!(error = %e, "Connection error"),
    }
}
