//! Error types for the build cache server

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving cache exchanges
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Request body exceeds the configured maximum
    #[error("Request content exceeds the maximum of {limit} bytes")]
    ContentTooLarge { limit: u64 },

    /// Message arrived that the exchange state machine does not accept
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Client went away before the exchange completed
    #[error("Connection closed before the exchange completed")]
    ConnectionClosed,

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Malformed data from a backend (truncated file, bad memcached frame)
    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    /// Memcached answered with a non-success status
    #[error("Memcached request failed with status 0x{status:04x}")]
    Memcache { status: u16 },

    /// Metadata record could not be encoded or decoded
    #[error("Invalid value metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// HTTP status used when this error terminates an exchange
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ContentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::ProtocolViolation(_) | Error::ConnectionClosed => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn backend(reason: impl Into<String>) -> Self {
        Error::BackendProtocol(reason.into())
    }
}

// =============================================================================
// Tests
// =============================================================================
