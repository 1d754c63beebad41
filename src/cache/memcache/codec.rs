//! Memcached binary protocol framing
//!
//! Every request and response starts with a 24-byte header:
//!
//! ```text
//! byte  0      1      2..3        4         5          6..7
//!     magic  opcode  key len   extras len  data type  vbucket / status
//! byte  8..11              12..15    16..23
//!     total body length    opaque    cas
//! ```
//!
//! The body that follows is `extras | key | value`.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Length of the extras carried by a SET request (flags + expiration)
pub const SET_EXTRAS_LEN: u8 = 8;

/// Commands used by the cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
}

/// Response status codes
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGUMENTS: u16 = 0x0004;
    pub const ITEM_NOT_STORED: u16 = 0x0005;
    pub const OUT_OF_MEMORY: u16 = 0x0082;
}

/// Request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub key_length: u16,
    pub extras_length: u8,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn new(opcode: Opcode, key_length: u16, extras_length: u8, value_length: u32) -> Self {
        Self {
            opcode,
            key_length,
            extras_length,
            total_body_length: key_length as u32 + extras_length as u32 + value_length,
            opaque: 0,
            cas: 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(REQUEST_MAGIC);
        dst.put_u8(self.opcode as u8);
        dst.put_u16(self.key_length);
        dst.put_u8(self.extras_length);
        dst.put_u8(0); // data type: raw bytes
        dst.put_u16(0); // vbucket
        dst.put_u32(self.total_body_length);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
    }
}

/// Response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn decode(src: &[u8; HEADER_LEN]) -> Result<Self> {
        if src[0] != RESPONSE_MAGIC {
            return Err(Error::backend(format!(
                "unexpected memcached response magic 0x{:02x}",
                src[0]
            )));
        }
        let header = Self {
            opcode: src[1],
            key_length: u16::from_be_bytes([src[2], src[3]]),
            extras_length: src[4],
            data_type: src[5],
            status: u16::from_be_bytes([src[6], src[7]]),
            total_body_length: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            opaque: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
            cas: u64::from_be_bytes([
                src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
            ]),
        };
        if (header.key_length as u32 + header.extras_length as u32) > header.total_body_length {
            return Err(Error::backend(format!(
                "memcached response body of {} bytes cannot hold key and extras",
                header.total_body_length
            )));
        }
        Ok(header)
    }

    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }

    /// Bytes preceding the value in the body
    pub fn prefix_length(&self) -> u32 {
        self.key_length as u32 + self.extras_length as u32
    }

    pub fn value_length(&self) -> u32 {
        self.total_body_length - self.prefix_length()
    }
}

/// Extras of a SET request: flags (always zero) and expiration
pub fn set_extras(expiration: u32) -> [u8; SET_EXTRAS_LEN as usize] {
    let mut extras = [0u8; SET_EXTRAS_LEN as usize];
    extras[4..].copy_from_slice(&expiration.to_be_bytes());
    extras
}

/// Expirations beyond 30 days are interpreted by memcached as unix time
pub const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Expiration field for a value living `max_age_secs` from `now_unix`
pub fn expiration_for(max_age_secs: u64, now_unix: i64) -> u32 {
    if max_age_secs <= MAX_RELATIVE_EXPIRATION {
        max_age_secs as u32
    } else {
        let absolute = (now_unix.max(0) as u64).saturating_add(max_age_secs);
        absolute.min(u32::MAX as u64) as u32
    }
}

// =============================================================================
// Tests
// =============================================================================
