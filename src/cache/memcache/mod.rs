//! Memcached Cache Backend
//!
//! Values are stored on one or more memcached servers speaking the binary
//! protocol. Keys are assigned to servers with an XOR-fold checksum and
//! every server has its own bounded connection pool.
//!
//! ```text
//! CacheBackend ──► sharding::select_server ──► ConnectionPool[i] ──► memcached
//! ```

pub mod backend;
pub mod codec;
pub mod pool;
pub mod sharding;

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use backend::{MemcacheCache, MemcacheCacheConfig, MemcacheServerConfig};

/// `host:port` pair of a memcached server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("'{s}' is not of the form host:port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("'{s}' has an empty host")));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in '{s}'")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for HostAndPort {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}
