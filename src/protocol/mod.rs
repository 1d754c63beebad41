//! Cache Exchange Protocol
//!
//! Backend-agnostic vocabulary shared by the HTTP layer and the storage
//! backends: the exchange messages, key digesting and the metadata record
//! stored in front of every value.
//!
//! ```text
//! client ──HTTP──► service ──CacheMessage──► handler ──► CacheBackend
//!        ◄──HTTP── service ◄──CacheMessage── handler ◄──
//! ```

pub mod key;
pub mod message;
pub mod metadata;

pub use key::{process_cache_key, DigestAlgorithm};
pub use message::CacheMessage;
pub use metadata::CacheValueMetadata;
