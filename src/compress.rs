//! Per-chunk LZ4 compression
//!
//! Every chunk written to a shard is LZ4-compressed independently before
//! it hits the store; the compaction index records where each compressed
//! chunk ends. Blocks carry a size prefix so decompression does not need
//! the original length out of band.

use crate::error::{Error, Result};

/// Compress one chunk with LZ4 (size-prefixed block).
pub fn compress_chunk(chunk: &[u8]) -> Result<Vec<u8>> {
    lz4::block::compress(chunk, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(|e| {
        Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        }
    })
}

/// Decompress one size-prefixed LZ4 block back into a chunk.
pub fn decompress_chunk(block: &[u8]) -> Result<Vec<u8>> {
    lz4::block::decompress(block, None).map_err(|e| Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })
}
