//! Metrics Server

use std::convert::Infallible;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::new()));
    match req.uri().path() {
        "/metrics" => match super::render() {
            Ok((content_type, body)) => {
                if let Ok(value) = header::HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                *response.body_mut() = Full::new(Bytes::from(body));
            }
            Err(e) => {
                error!(error = %e, "Failed to render metrics");
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
        },
        _ => {
            *response.status_mut() = StatusCode::NOT_FOUND;
            *response.body_mut() = Full::new(Bytes::from("not found"));
        }
    }
    Ok(response)
}

/// Serve `/metrics` on `addr` until `shutdown` fires
pub async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server on {addr}: {e}")))?;

    info!("Metrics server listening on {}", listener.local_addr()?);

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Metrics server accept error: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
    Ok(())
}
