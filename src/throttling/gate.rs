//! Throttling gate
//!
//! Every request passes through the gate before it reaches the cache
//! handler. An admitted request is forwarded unchanged; a rejected one is
//! answered with 429, or held back and retried when the suggested wait is
//! short and request delaying is enabled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::bucket::BucketManager;
use crate::auth::Principal;
use crate::metrics;

/// Granularity suggested waits are rounded up to
const WAIT_GRANULARITY: Duration = Duration::from_millis(100);

/// Outcome of a throttling check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Admit,
    Reject { retry_after: Duration },
}

/// Quota collaborator consulted per request
pub trait Throttler: Send + Sync {
    fn check(&self, principal: &Principal, peer: SocketAddr) -> ThrottleDecision;
}

/// Admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThrottler;

impl Throttler for NoopThrottler {
    fn check(&self, _principal: &Principal, _peer: SocketAddr) -> ThrottleDecision {
        ThrottleDecision::Admit
    }
}

/// Charges one token from every bucket applying to the request
pub struct BucketThrottler {
    manager: BucketManager,
}

impl BucketThrottler {
    pub fn new(manager: BucketManager) -> Self {
        Self { manager }
    }
}

impl Throttler for BucketThrottler {
    fn check(&self, principal: &Principal, peer: SocketAddr) -> ThrottleDecision {
        let longest_wait = self
            .manager
            .buckets_for(principal, peer.ip())
            .iter()
            .filter_map(|bucket| bucket.try_consume(1))
            .max();
        match longest_wait {
            None => ThrottleDecision::Admit,
            Some(wait) => ThrottleDecision::Reject {
                retry_after: round_up(wait),
            },
        }
    }
}

fn round_up(wait: Duration) -> Duration {
    let granularity = WAIT_GRANULARITY.as_millis();
    let millis = wait.as_millis().div_ceil(granularity).saturating_mul(granularity);
    Duration::from_millis(millis.min(u64::MAX as u128) as u64)
}

/// Applies a throttler to requests, optionally delaying instead of rejecting
#[derive(Clone)]
pub struct ThrottlingGate {
    throttler: Arc<dyn Throttler>,
    delay_requests: bool,
    delay_threshold: Duration,
}

impl ThrottlingGate {
    pub fn new(throttler: Arc<dyn Throttler>, delay_requests: bool, delay_threshold: Duration) -> Self {
        Self {
            throttler,
            delay_requests,
            delay_threshold,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopThrottler), false, Duration::ZERO)
    }

    /// Decide on a request, sleeping through short waits when configured
    pub async fn admit(&self, principal: &Principal, peer: SocketAddr) -> ThrottleDecision {
        loop {
            match self.throttler.check(principal, peer) {
                ThrottleDecision::Admit => return ThrottleDecision::Admit,
                ThrottleDecision::Reject { retry_after }
                    if self.delay_requests && retry_after < self.delay_threshold =>
                {
                    debug!(%peer, wait = ?retry_after, "Delaying throttled request");
                    tokio::time::sleep(retry_after).await;
                }
                rejected => {
                    metrics::THROTTLED_REQUESTS.inc();
                    return rejected;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
