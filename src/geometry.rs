//! Stripe geometry
//!
//! Pure offset arithmetic mapping logical object offsets to per-shard
//! chunk offsets. A stripe is `stripe_width` logical bytes encoded into
//! `K` data chunks of `chunk_size = stripe_width / K` bytes each (plus
//! parity chunks of the same size).
//!
//! No hidden state, no side effects.

use crate::error::{Error, Result};

/// Immutable stripe geometry for one placement group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeInfo {
    data_chunks: u64,
    stripe_width: u64,
    chunk_size: u64,
}

impl StripeInfo {
    /// Create the geometry for `data_chunks` (K) data shards over
    /// `stripe_width` logical bytes per stripe.
    ///
    /// Fails unless `stripe_width` divides evenly into K chunks.
    pub fn new(data_chunks: u64, stripe_width: u64) -> Result<Self> {
        if data_chunks == 0 {
            return Err(Error::InvalidEcConfig(
                "data chunk count must be greater than 0".to_string(),
            ));
        }
        if stripe_width == 0 || stripe_width % data_chunks != 0 {
            return Err(Error::InvalidEcConfig(format!(
                "stripe width {} is not a positive multiple of {} data chunks",
                stripe_width, data_chunks
            )));
        }
        Ok(Self {
            data_chunks,
            stripe_width,
            chunk_size: stripe_width / data_chunks,
        })
    }

    pub fn stripe_width(&self) -> u64 {
        self.stripe_width
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn data_chunk_count(&self) -> u64 {
        self.data_chunks
    }

    /// Chunk offset of the stripe containing `offset` (rounded down).
    pub fn logical_to_prev_chunk_offset(&self, offset: u64) -> u64 {
        (offset / self.stripe_width) * self.chunk_size
    }

    /// Chunk offset of the first stripe at or after `offset`.
    pub fn logical_to_next_chunk_offset(&self, offset: u64) -> u64 {
        offset.div_ceil(self.stripe_width) * self.chunk_size
    }

    /// Largest stripe-aligned logical offset not greater than `offset`.
    pub fn logical_to_prev_stripe_offset(&self, offset: u64) -> u64 {
        offset - (offset % self.stripe_width)
    }

    /// Smallest stripe-aligned logical offset not less than `offset`.
    pub fn logical_to_next_stripe_offset(&self, offset: u64) -> u64 {
        if offset % self.stripe_width == 0 {
            offset
        } else {
            self.logical_to_prev_stripe_offset(offset) + self.stripe_width
        }
    }

    /// Chunk offset for a stripe-aligned logical offset.
    pub fn aligned_logical_offset_to_chunk_offset(&self, offset: u64) -> u64 {
        assert!(offset % self.stripe_width == 0);
        (offset / self.stripe_width) * self.chunk_size
    }

    /// Logical offset for a chunk-aligned per-shard offset.
    pub fn aligned_chunk_offset_to_logical_offset(&self, offset: u64) -> u64 {
        assert!(offset % self.chunk_size == 0);
        (offset / self.chunk_size) * self.stripe_width
    }

    /// Map a stripe-aligned (offset, length) pair into chunk units.
    pub fn aligned_offset_len_to_chunk(&self, offset: u64, len: u64) -> (u64, u64) {
        (
            self.aligned_logical_offset_to_chunk_offset(offset),
            self.aligned_logical_offset_to_chunk_offset(len),
        )
    }

    /// Widen `[offset, offset + len)` to the stripes that fully cover it,
    /// returning the stripe-aligned offset and length.
    pub fn offset_len_to_stripe_bounds(&self, offset: u64, len: u64) -> (u64, u64) {
        let start = self.logical_to_prev_stripe_offset(offset);
        let covering = self.logical_to_next_stripe_offset((offset - start) + len);
        (start, covering)
    }
}
