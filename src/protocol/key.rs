//! Cache key processing
//!
//! Backends never see the client key directly: it is optionally hashed
//! with a configured digest and handed over as raw bytes.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use sha2::Digest;

use crate::error::{Error, Result};

/// Digest applied to client keys before they reach a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum DigestAlgorithm {
    Md5,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Canonical algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest output length in bytes
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hash `data` with this algorithm
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Md5 => md5::compute(data).0.to_vec(),
            DigestAlgorithm::Sha224 => sha2::Sha224::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(Error::Config(format!("unsupported digest algorithm '{s}'"))),
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Turn a client key into the bytes a backend stores it under.
///
/// Without a digest the UTF-8 bytes of the key are used unchanged.
pub fn process_cache_key(key: &str, digest: Option<DigestAlgorithm>) -> Vec<u8> {
    match digest {
        Some(algorithm) => algorithm.digest(key.as_bytes()),
        None => key.as_bytes().to_vec(),
    }
}

// =============================================================================
// Tests
// =============================================================================
