//! Metrics module
//!
//! Prometheus collectors for the cache server, registered in the default
//! registry on first use, and the optional `/metrics` endpoint.

mod server;

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub use server::run_metrics_server;

use crate::error::{Error, Result};

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = prometheus::register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "Failed to register metric");
    }
    collector
}

/// Requests answered, by method and status code
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("buildcache_requests_total", "Requests answered"),
            &["method", "status"],
        )
        .expect("valid metric definition"),
    )
});

/// GET requests that found a value
pub static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("buildcache_cache_hits_total", "Cache lookups that found a value")
            .expect("valid metric definition"),
    )
});

/// GET requests that found nothing
pub static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("buildcache_cache_misses_total", "Cache lookups that found nothing")
            .expect("valid metric definition"),
    )
});

/// Exchanges currently holding a connection's handler
pub static EXCHANGES_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("buildcache_exchanges_in_flight", "Cache exchanges in progress")
            .expect("valid metric definition"),
    )
});

/// Requests rejected with 429
pub static THROTTLED_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("buildcache_throttled_requests_total", "Requests rejected by throttling")
            .expect("valid metric definition"),
    )
});

/// Exchanges aborted by an error
pub static EXCHANGE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("buildcache_exchange_errors_total", "Cache exchanges aborted by an error")
            .expect("valid metric definition"),
    )
});

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {e}")))?;
    Ok((encoder.format_type().to_owned(), buffer))
}
