//! Exchange messages
//!
//! A cache exchange opens with a request message, streams zero or more
//! `Content` chunks in the direction of the payload, and is closed by
//! exactly one terminal message.
//!
//! ```text
//! GET: GetRequest ─► ValueFound ─► Content* ─► LastContent
//!                 └► ValueNotFound
//! PUT: PutRequest ─► Content* ─► LastContent ─► PutResponse
//! any step        ─► ExceptionCaught
//! ```

use bytes::Bytes;

use super::metadata::CacheValueMetadata;
use crate::error::Error;

/// One message of a cache exchange
#[derive(Debug)]
pub enum CacheMessage {
    /// Client asks for the value stored under `key`
    GetRequest { key: String },
    /// Client starts uploading a value for `key`
    PutRequest {
        key: String,
        metadata: CacheValueMetadata,
    },
    /// Payload chunk
    Content(Bytes),
    /// Final payload chunk (possibly empty)
    LastContent(Bytes),
    /// Value exists; its payload follows as `Content`/`LastContent`
    ValueFound {
        key: String,
        metadata: CacheValueMetadata,
    },
    /// No value stored under the requested key
    ValueNotFound,
    /// Upload committed
    PutResponse { key: String },
    /// Exchange aborted by an error
    ExceptionCaught(Error),
}

impl CacheMessage {
    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            CacheMessage::GetRequest { .. } => "GetRequest",
            CacheMessage::PutRequest { .. } => "PutRequest",
            CacheMessage::Content(_) => "Content",
            CacheMessage::LastContent(_) => "LastContent",
            CacheMessage::ValueFound { .. } => "ValueFound",
            CacheMessage::ValueNotFound => "ValueNotFound",
            CacheMessage::PutResponse { .. } => "PutResponse",
            CacheMessage::ExceptionCaught(_) => "ExceptionCaught",
        }
    }

    /// True for messages that close an exchange
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CacheMessage::LastContent(_)
                | CacheMessage::ValueNotFound
                | CacheMessage::PutResponse { .. }
                | CacheMessage::ExceptionCaught(_)
        )
    }

    /// True for messages that open an exchange
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CacheMessage::GetRequest { .. } | CacheMessage::PutRequest { .. }
        )
    }
}
