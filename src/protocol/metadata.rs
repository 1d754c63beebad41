//! Value metadata record
//!
//! Stored in front of every payload as a 4-byte big-endian length followed
//! by a JSON document.

use bytes::{BufMut, Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for an encoded metadata record
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

/// Length of the record's size prefix
pub const METADATA_LENGTH_PREFIX: usize = 4;

/// Optional content disposition and MIME type attached to a stored value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheValueMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl CacheValueMetadata {
    pub fn new(content_disposition: Option<String>, mime_type: Option<String>) -> Self {
        Self {
            content_disposition,
            mime_type,
        }
    }

    /// Capture `Content-Type` and `Content-Disposition` from request headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            content_disposition: header(CONTENT_DISPOSITION),
            mime_type: header(CONTENT_TYPE),
        }
    }

    /// Encode as a length-prefixed record
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_METADATA_SIZE {
            return Err(Error::Internal(format!(
                "metadata record of {} bytes exceeds {} bytes",
                json.len(),
                MAX_METADATA_SIZE
            )));
        }
        let mut buf = BytesMut::with_capacity(METADATA_LENGTH_PREFIX + json.len());
        buf.put_u32(json.len() as u32);
        buf.put_slice(&json);
        Ok(buf.freeze())
    }

    /// Validate a record length read from storage
    pub fn check_length(len: u32) -> Result<usize> {
        let len = len as usize;
        if len > MAX_METADATA_SIZE {
            return Err(Error::backend(format!(
                "metadata record length {len} exceeds {MAX_METADATA_SIZE}"
            )));
        }
        Ok(len)
    }

    /// Decode the JSON body of a record (without its length prefix)
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
