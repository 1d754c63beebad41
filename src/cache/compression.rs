//! Chunk Compression Adapter
//!
//! LZ4 compression applied to value payloads as they stream through a
//! backend. Incoming chunks are regrouped into blocks of at most
//! [`BLOCK_SIZE`] bytes and every block is written as a frame:
//!
//! ```text
//! +----------------+--------------------------------------+
//! | len: u32 (BE)  | LZ4 block (uncompressed size + data) |
//! +----------------+--------------------------------------+
//! ```
//!
//! The encoder and decoder keep only the current partial block, so values
//! of any size are handled with bounded memory. Clients always see the
//! original bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use super::backend::ContentStream;
use crate::error::{Error, Result};

/// Largest uncompressed block
pub const BLOCK_SIZE: usize = 64 * 1024;

const FRAME_HEADER_LEN: usize = 4;

/// Worst-case LZ4 output for one block, including the prepended size
const MAX_FRAME_LEN: usize = BLOCK_SIZE + BLOCK_SIZE / 255 + 16 + 4;

// =============================================================================
// Compression Configuration
// =============================================================================

/// Per-backend compression settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CompressionConfig {
    /// Compress stored payloads
    pub enabled: bool,
    /// LZ4 level, 0 selects the default fast mode, 1-16 high compression
    pub level: i32,
}

impl CompressionConfig {
    pub fn lz4(level: i32) -> Self {
        Self {
            enabled: true,
            level,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=16).contains(&self.level) {
            return Err(Error::Config(format!(
                "compression level {} outside 0..=16",
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 0,
        }
    }
}

// =============================================================================
// LZ4 Blocks
// =============================================================================

fn compression_mode(level: i32) -> lz4::block::CompressionMode {
    if level <= 0 {
        lz4::block::CompressionMode::DEFAULT
    } else {
        lz4::block::CompressionMode::HIGHCOMPRESSION(level)
    }
}

fn compress_block(level: i32, block: &[u8]) -> Result<Vec<u8>> {
    lz4::block::compress(block, Some(compression_mode(level)), true).map_err(|e| {
        Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        }
    })
}

fn decompress_block(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(decompression_error("block shorter than its size prefix"));
    }
    let declared = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if declared < 0 || declared as usize > BLOCK_SIZE {
        return Err(decompression_error(format!(
            "block declares {declared} uncompressed bytes"
        )));
    }
    lz4::block::decompress(data, None).map_err(|e| decompression_error(e.to_string()))
}

fn decompression_error(reason: impl Into<String>) -> Error {
    Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: reason.into(),
    }
}

// =============================================================================
// Streaming Encoder / Decoder
// =============================================================================

/// Incremental payload encoder used on the write path
#[derive(Debug)]
pub struct ChunkEncoder {
    /// LZ4 level, `None` stores chunks unchanged
    level: Option<i32>,
    pending: BytesMut,
}

impl ChunkEncoder {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            level: config.enabled.then_some(config.level),
            pending: BytesMut::new(),
        }
    }

    /// Feed one chunk; returns the bytes ready to be stored (may be empty)
    pub fn encode(&mut self, chunk: Bytes) -> Result<Bytes> {
        let Some(level) = self.level else {
            return Ok(chunk);
        };
        self.pending.extend_from_slice(&chunk);
        let mut out = BytesMut::new();
        while self.pending.len() >= BLOCK_SIZE {
            let block = self.pending.split_to(BLOCK_SIZE);
            write_frame(level, &block, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Flush the last partial block
    pub fn finish(self) -> Result<Bytes> {
        let Some(level) = self.level else {
            return Ok(Bytes::new());
        };
        let mut out = BytesMut::new();
        if !self.pending.is_empty() {
            write_frame(level, &self.pending, &mut out)?;
        }
        Ok(out.freeze())
    }
}

fn write_frame(level: i32, block: &[u8], out: &mut BytesMut) -> Result<()> {
    let compressed = compress_block(level, block)?;
    out.reserve(FRAME_HEADER_LEN + compressed.len());
    out.put_u32(compressed.len() as u32);
    out.put_slice(&compressed);
    Ok(())
}

/// Incremental payload decoder used on the read path
#[derive(Debug)]
pub struct ChunkDecoder {
    enabled: bool,
    pending: BytesMut,
}

impl ChunkDecoder {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            pending: BytesMut::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        !self.enabled
    }

    /// Feed stored bytes; returns the decompressed bytes available so far
    pub fn decode(&mut self, chunk: Bytes) -> Result<Bytes> {
        if !self.enabled {
            return Ok(chunk);
        }
        self.pending.extend_from_slice(&chunk);
        let mut out = BytesMut::new();
        while self.pending.len() >= FRAME_HEADER_LEN {
            let len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(decompression_error(format!("frame of {len} bytes")));
            }
            if self.pending.len() < FRAME_HEADER_LEN + len {
                break;
            }
            self.pending.advance(FRAME_HEADER_LEN);
            let frame = self.pending.split_to(len);
            out.extend_from_slice(&decompress_block(&frame)?);
        }
        Ok(out.freeze())
    }

    /// Check that the stored payload ended on a frame boundary
    pub fn finish(self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(decompression_error(format!(
                "payload truncated, {} trailing bytes",
                self.pending.len()
            )))
        }
    }
}

/// Wrap a stored payload stream so it yields decompressed chunks
pub fn decode_stream(input: ContentStream, decoder: ChunkDecoder) -> ContentStream {
    if decoder.is_passthrough() {
        return input;
    }
    stream::unfold(Some((input, decoder)), |state| async move {
        let (mut input, mut decoder) = state?;
        loop {
            match input.next().await {
                Some(Ok(chunk)) => match decoder.decode(chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Some((Ok(out), Some((input, decoder)))),
                    Err(e) => return Some((Err(e), None)),
                },
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    return match decoder.finish() {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), None)),
                    }
                }
            }
        }
    })
    .boxed()
}

// =============================================================================
// Tests
// =============================================================================
