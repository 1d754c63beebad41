//! buildcache - Remote Build Cache Server
//!
//! An HTTP/1.1 server storing build artifacts under opaque keys. Values are
//! streamed in and out in chunks through a pluggable backend, so payloads
//! never have to fit in memory.
//!
//! # Architecture
//!
//! ```text
//! client ─▶ hyper ─▶ auth/throttling ─▶ exchange handler ─▶ backend
//!                                             ▲               │
//!                                             └── chunks ◀────┘
//! ```
//!
//! # Modules
//!
//! - [`auth`] - Basic authentication, roles and password hashing
//! - [`cache`] - Backend trait with in-memory, filesystem and memcached variants
//! - [`config`] - YAML configuration
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics integration
//! - [`protocol`] - Cache message vocabulary, keys and value metadata
//! - [`server`] - Listener, HTTP service and graceful shutdown
//! - [`throttling`] - Token-bucket quotas and the throttling gate

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod throttling;

// Re-export commonly used types
pub use cache::{CacheBackend, CacheConfig, SharedBackend};
pub use config::Configuration;
pub use error::{Error, Result};
pub use server::{BuildCacheServer, ServerHandle, ShutdownReport};
