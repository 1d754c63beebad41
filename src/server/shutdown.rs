//! Shutdown coordination
//!
//! Once the accept loop has stopped, live connections are given the rest
//! of the shutdown deadline to finish their current exchange, then the
//! backend is closed within whatever time is left, but never less than
//! [`BACKEND_CLOSE_GRACE`]. Missing the deadline is reported, never fatal.

use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::cache::SharedBackend;

/// Time the backend always gets to close, even after a late drain
pub const BACKEND_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every connection finished before the deadline
    pub drained: bool,
    /// The backend released its resources before the deadline
    pub backend_closed: bool,
    pub errors: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drained && self.backend_closed && self.errors.is_empty()
    }
}

/// Drain `connections`, then close `backend`, all within `deadline`
pub async fn coordinate(
    connections: &TaskTracker,
    backend: &SharedBackend,
    deadline: Duration,
) -> ShutdownReport {
    let started = Instant::now();
    let mut report = ShutdownReport::default();

    connections.close();
    info!(connections = connections.len(), "Draining connections");
    match timeout(deadline, connections.wait()).await {
        Ok(()) => report.drained = true,
        Err(_) => {
            warn!(
                remaining = connections.len(),
                "Connections still open at the shutdown deadline"
            );
            report.errors.push(format!(
                "{} connection(s) still open after {deadline:?}",
                connections.len()
            ));
        }
    }

    let remaining = deadline
        .saturating_sub(started.elapsed())
        .max(BACKEND_CLOSE_GRACE);
    match timeout(remaining, backend.close()).await {
        Ok(Ok(())) => report.backend_closed = true,
        Ok(Err(e)) => {
            warn!(backend = backend.name(), error = %e, "Backend failed to close");
            report.errors.push(format!("closing {} backend: {e}", backend.name()));
        }
        Err(_) => {
            warn!(backend = backend.name(), "Backend close timed out");
            report
                .errors
                .push(format!("closing {} backend timed out", backend.name()));
        }
    }

    if report.is_clean() {
        info!(elapsed = ?started.elapsed(), "Shutdown complete");
    }
    report
}

// =============================================================================
// Tests
// =============================================================================
