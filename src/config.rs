//! Server configuration
//!
//! Loaded from a YAML document at startup and validated once; any problem
//! is fatal before the listener is bound.
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 8080
//! server-path: /cache
//! connection:
//!   max-request-size: 64MiB
//!   chunk-size: 64KiB
//! proxy-protocol:
//!   enabled: true
//!   trusted-proxies: [10.0.0.0/8]
//! cache:
//!   type: file-system
//!   root: /var/cache/buildcache
//!   max-age: 7d
//!   compression: { enabled: true, level: 0 }
//! authentication: basic
//! users:
//!   - name: ci
//!     password: $argon2id$v=19$...
//!     groups: [writers]
//! groups:
//!   - name: writers
//!     roles: [reader, writer]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::{password, GroupConfig, UserConfig, ANONYMOUS_USER};
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::server::proxy::ProxyProtocolConfig;

// =============================================================================
// Configuration
// =============================================================================

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Configuration {
    pub host: String,
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Path prefix every cache key is nested under
    pub server_path: Option<String>,
    pub connection: ConnectionConfig,
    /// PROXY protocol headers from load balancers
    pub proxy_protocol: ProxyProtocolConfig,
    pub rate_limiter: RateLimiterConfig,
    pub cache: CacheConfig,
    pub authentication: AuthenticationConfig,
    pub users: Vec<UserConfig>,
    pub groups: Vec<GroupConfig>,
    /// Address of the Prometheus endpoint, disabled when absent
    pub metrics_addr: Option<String>,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            backlog: 1024,
            server_path: None,
            connection: ConnectionConfig::default(),
            proxy_protocol: ProxyProtocolConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            cache: CacheConfig::default(),
            authentication: AuthenticationConfig::None,
            users: Vec::new(),
            groups: Vec::new(),
            metrics_addr: None,
            shutdown_timeout: Duration::from_secs(20),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub idle_timeout: Duration,
    /// Longest wait for inbound bytes while the connection is otherwise quiet
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub read_idle_timeout: Duration,
    /// Longest a write may stay blocked on the peer
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub write_idle_timeout: Duration,
    /// Largest accepted request body
    #[serde(deserialize_with = "size_format::deserialize")]
    pub max_request_size: u64,
    /// Size of the chunks values are streamed in
    #[serde(deserialize_with = "size_format::deserialize_usize")]
    pub chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            read_idle_timeout: Duration::from_secs(60),
            write_idle_timeout: Duration::from_secs(60),
            max_request_size: 64 * 1024 * 1024,
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Hold back throttled requests with short waits instead of answering 429
    pub delay_request: bool,
}

/// Authentication scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationConfig {
    #[default]
    None,
    Basic,
}

impl Configuration {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Configuration =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.chunk_size == 0 {
            return Err(Error::Config("chunk-size must be positive".into()));
        }
        if self.connection.max_request_size == 0 {
            return Err(Error::Config("max-request-size must be positive".into()));
        }
        self.cache.compression().validate()?;
        if let CacheConfig::Memcache(memcache) = &self.cache {
            if memcache.servers.is_empty() {
                return Err(Error::Config(
                    "memcache cache needs at least one server".into(),
                ));
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(Error::Config(format!("duplicate group '{}'", group.name)));
            }
        }
        let mut user_names = HashSet::new();
        for user in &self.users {
            if !user_names.insert(user.name.as_str()) {
                return Err(Error::Config(format!("duplicate user '{}'", user.name)));
            }
            if let Some(group) = user.groups.iter().find(|g| !group_names.contains(g.as_str())) {
                return Err(Error::Config(format!(
                    "user '{}' references unknown group '{group}'",
                    user.name
                )));
            }
            match &user.password {
                Some(hash) => password::validate_hash(hash)?,
                None if self.authentication == AuthenticationConfig::Basic
                    && user.name != ANONYMOUS_USER =>
                {
                    return Err(Error::Config(format!(
                        "user '{}' needs a password hash",
                        user.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// `host:port` the server listens on
    pub fn listen_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Below this wait the throttling gate delays requests instead of rejecting
    pub fn throttle_delay_threshold(&self) -> Duration {
        [
            self.connection.idle_timeout,
            self.connection.read_idle_timeout,
            self.connection.write_idle_timeout,
        ]
        .into_iter()
        .filter(|timeout| !timeout.is_zero())
        .min()
        .map_or(Duration::ZERO, |timeout| timeout / 2)
    }
}

// =============================================================================
// Value Formats
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn split_unit(text: &str) -> (&str, &str) {
    let text = text.trim();
    let boundary = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(boundary);
    (number, unit.trim())
}

/// Durations as integer seconds or `500ms`, `30s`, `5m`, `2h`, `7d`
pub mod duration_format {
    use super::*;
    use serde::Deserializer;

    pub fn parse(text: &str) -> Result<Duration> {
        let (number, unit) = split_unit(text);
        let value: u64 = number
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration '{text}'")))?;
        let duration = match unit {
            "ms" => Duration::from_millis(value),
            "" | "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 60 * 60),
            "d" => Duration::from_secs(value * 24 * 60 * 60),
            other => {
                return Err(Error::Config(format!(
                    "unknown duration unit '{other}' in '{text}'"
                )))
            }
        };
        Ok(duration)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(secs) => Ok(Duration::from_secs(secs)),
            NumberOrText::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(NumberOrText::Text(text)) => parse(&text).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

/// Sizes as integer bytes or with a `KiB`, `MiB`, `GiB` suffix
pub mod size_format {
    use super::*;
    use serde::Deserializer;

    pub fn parse(text: &str) -> Result<u64> {
        let (number, unit) = split_unit(text);
        let value: u64 = number
            .parse()
            .map_err(|_| Error::Config(format!("invalid size '{text}'")))?;
        let multiplier: u64 = match unit {
            "" | "B" => 1,
            "K" | "KiB" | "k" => 1024,
            "M" | "MiB" => 1024 * 1024,
            "G" | "GiB" => 1024 * 1024 * 1024,
            other => {
                return Err(Error::Config(format!(
                    "unknown size unit '{other}' in '{text}'"
                )))
            }
        };
        value
            .checked_mul(multiplier)
            .ok_or_else(|| Error::Config(format!("size '{text}' overflows")))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(bytes) => Ok(bytes),
            NumberOrText::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    pub fn deserialize_usize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<usize, D::Error> {
        let bytes = deserialize(deserializer)?;
        usize::try_from(bytes).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
