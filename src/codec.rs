//! Erasure codec adapter
//!
//! [`ErasureCodec`] is the boundary between the backend and whatever
//! erasure code the pool was created with; the backend never inspects
//! codec internals. [`ReedSolomonCodec`] is the stock implementation over
//! GF(2^8) Reed-Solomon from the `reed-solomon-erasure` crate.
//!
//! The stripe-level helpers at the bottom apply a codec across a buffer
//! spanning whole stripes, chunk row by chunk row, the way the read and
//! write engines consume it.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};
use crate::geometry::StripeInfo;
use crate::types::ShardId;

// =============================================================================
// Codec Trait
// =============================================================================

/// Pluggable erasure code: `K` data chunks plus `M` parity chunks, any
/// `K` of which reconstruct the original stripe.
pub trait ErasureCodec: Send + Sync {
    /// Number of data chunks (K).
    fn data_chunk_count(&self) -> usize;

    /// Total number of chunks (K + M).
    fn chunk_count(&self) -> usize;

    /// Per-chunk size for a given stripe width.
    fn chunk_size(&self, stripe_width: u64) -> u64 {
        stripe_width / self.data_chunk_count() as u64
    }

    /// Optional permutation from logical chunk index to physical shard id.
    /// Empty means identity.
    fn chunk_mapping(&self) -> &[usize] {
        &[]
    }

    /// Encode one stripe into the chunks named by `want`.
    fn encode(&self, want: &BTreeSet<usize>, stripe: &[u8]) -> Result<BTreeMap<usize, Bytes>>;

    /// Reconstruct the chunks named by `need` from the chunks in `have`.
    fn decode(
        &self,
        need: &BTreeSet<usize>,
        have: &BTreeMap<usize, Bytes>,
    ) -> Result<BTreeMap<usize, Bytes>>;

    /// Reconstruct the original stripe bytes from at least K chunks.
    fn decode_concat(&self, have: &BTreeMap<usize, Bytes>) -> Result<Bytes> {
        let k = self.data_chunk_count();
        let data: BTreeSet<usize> = (0..k).collect();
        let decoded = self.decode(&data, have)?;
        let mut out = BytesMut::new();
        for i in 0..k {
            let mapped = self.chunk_mapping().get(i).copied().unwrap_or(i);
            let chunk = decoded
                .get(&mapped)
                .ok_or_else(|| Error::EcDecodingFailed(format!("chunk {} not produced", mapped)))?;
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    /// The smallest subset of `have` from which every chunk in `want` can
    /// be produced, or an error if `want` cannot be satisfied.
    fn minimum_to_decode(
        &self,
        want: &BTreeSet<usize>,
        have: &BTreeSet<usize>,
    ) -> Result<BTreeSet<usize>>;
}

// =============================================================================
// Reed-Solomon Implementation
// =============================================================================

/// GF(2^8) Reed-Solomon codec.
pub struct ReedSolomonCodec {
    rs: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
}

impl ReedSolomonCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }
        if parity_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "parity_shards must be greater than 0".to_string(),
            ));
        }
        let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
            Error::InvalidEcConfig(format!("failed to create Reed-Solomon codec: {}", e))
        })?;
        Ok(Self {
            rs,
            data_shards,
            parity_shards,
        })
    }

    fn check_have(&self, have_count: usize) -> Result<()> {
        if have_count < self.data_shards {
            return Err(Error::InsufficientShards {
                available: have_count,
                required: self.data_shards,
            });
        }
        Ok(())
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn data_chunk_count(&self) -> usize {
        self.data_shards
    }

    fn chunk_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn encode(&self, want: &BTreeSet<usize>, stripe: &[u8]) -> Result<BTreeMap<usize, Bytes>> {
        assert_eq!(stripe.len() % self.data_shards, 0);
        let chunk_size = stripe.len() / self.data_shards;
        let mut shards: Vec<Vec<u8>> = stripe
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; chunk_size]);
        }
        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;
        Ok(shards
            .into_iter()
            .enumerate()
            .filter(|(i, _)| want.contains(i))
            .map(|(i, s)| (i, Bytes::from(s)))
            .collect())
    }

    fn decode(
        &self,
        need: &BTreeSet<usize>,
        have: &BTreeMap<usize, Bytes>,
    ) -> Result<BTreeMap<usize, Bytes>> {
        self.check_have(have.len())?;
        let total = self.chunk_count();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        for (&i, chunk) in have {
            assert!(i < total);
            shards[i] = Some(chunk.to_vec());
        }
        self.rs
            .reconstruct(&mut shards)
            .map_err(|e| Error::EcDecodingFailed(format!("Reed-Solomon reconstruction failed: {}", e)))?;
        need.iter()
            .map(|&i| {
                shards[i]
                    .take()
                    .map(|s| (i, Bytes::from(s)))
                    .ok_or_else(|| Error::EcDecodingFailed(format!("chunk {} not reconstructed", i)))
            })
            .collect()
    }

    fn minimum_to_decode(
        &self,
        want: &BTreeSet<usize>,
        have: &BTreeSet<usize>,
    ) -> Result<BTreeSet<usize>> {
        if want.is_subset(have) {
            return Ok(want.clone());
        }
        self.check_have(have.len())?;
        // Any K distinct chunks reconstruct the stripe; prefer the ones
        // the caller already wants.
        let mut need: BTreeSet<usize> = want.intersection(have).copied().collect();
        for &i in have {
            if need.len() >= self.data_shards {
                break;
            }
            need.insert(i);
        }
        Ok(need)
    }
}

// =============================================================================
// Stripe-Level Helpers
// =============================================================================

/// Encode a whole-stripe buffer into per-shard chunk streams.
///
/// `data` must span whole stripes. Each shard's output is the
/// concatenation of its chunk from every stripe, in order.
pub fn encode_stripes(
    sinfo: &StripeInfo,
    codec: &dyn ErasureCodec,
    want: &BTreeSet<usize>,
    data: &[u8],
) -> Result<BTreeMap<ShardId, Bytes>> {
    let width = sinfo.stripe_width() as usize;
    assert_eq!(data.len() % width, 0);
    let mut out: BTreeMap<ShardId, BytesMut> = BTreeMap::new();
    for stripe in data.chunks(width) {
        let encoded = codec.encode(want, stripe)?;
        for (shard, chunk) in encoded {
            assert_eq!(chunk.len() as u64, sinfo.chunk_size());
            out.entry(ShardId::from(shard))
                .or_default()
                .extend_from_slice(&chunk);
        }
    }
    let logical = data.len() as u64;
    let out: BTreeMap<ShardId, Bytes> =
        out.into_iter().map(|(s, b)| (s, b.freeze())).collect();
    for chunks in out.values() {
        assert_eq!(chunks.len() as u64 % sinfo.chunk_size(), 0);
        assert_eq!(
            sinfo.aligned_chunk_offset_to_logical_offset(chunks.len() as u64),
            logical
        );
    }
    Ok(out)
}

fn check_chunk_streams(sinfo: &StripeInfo, to_decode: &BTreeMap<ShardId, Bytes>) -> u64 {
    assert!(!to_decode.is_empty());
    let total = to_decode.values().next().unwrap().len() as u64;
    assert_eq!(total % sinfo.chunk_size(), 0);
    for chunks in to_decode.values() {
        assert_eq!(chunks.len() as u64, total);
    }
    total
}

/// Decode per-shard chunk streams back into contiguous logical bytes.
pub fn decode_stripes_concat(
    sinfo: &StripeInfo,
    codec: &dyn ErasureCodec,
    to_decode: &BTreeMap<ShardId, Bytes>,
) -> Result<Bytes> {
    let total = check_chunk_streams(sinfo, to_decode);
    if total == 0 {
        return Ok(Bytes::new());
    }
    let chunk_size = sinfo.chunk_size() as usize;
    let mut out = BytesMut::new();
    let mut off = 0usize;
    while (off as u64) < total {
        let row: BTreeMap<usize, Bytes> = to_decode
            .iter()
            .map(|(s, b)| (s.index(), b.slice(off..off + chunk_size)))
            .collect();
        let stripe = codec.decode_concat(&row)?;
        assert_eq!(stripe.len() as u64, sinfo.stripe_width());
        out.extend_from_slice(&stripe);
        off += chunk_size;
    }
    Ok(out.freeze())
}

/// Reconstruct the chunk streams of the shards in `need` from the streams
/// of the surviving shards.
pub fn decode_stripes_into(
    sinfo: &StripeInfo,
    codec: &dyn ErasureCodec,
    to_decode: &BTreeMap<ShardId, Bytes>,
    need: &BTreeSet<ShardId>,
) -> Result<BTreeMap<ShardId, Bytes>> {
    let total = check_chunk_streams(sinfo, to_decode);
    let mut out: BTreeMap<ShardId, BytesMut> =
        need.iter().map(|&s| (s, BytesMut::new())).collect();
    if total == 0 {
        return Ok(out.into_iter().map(|(s, b)| (s, b.freeze())).collect());
    }
    let chunk_size = sinfo.chunk_size() as usize;
    let need_idx: BTreeSet<usize> = need.iter().map(|s| s.index()).collect();
    let mut off = 0usize;
    while (off as u64) < total {
        let row: BTreeMap<usize, Bytes> = to_decode
            .iter()
            .map(|(s, b)| (s.index(), b.slice(off..off + chunk_size)))
            .collect();
        let decoded = codec.decode(&need_idx, &row)?;
        for (&shard, buf) in out.iter_mut() {
            let chunk = decoded.get(&shard.index()).ok_or_else(|| {
                Error::EcDecodingFailed(format!("chunk {} not reconstructed", shard))
            })?;
            assert_eq!(chunk.len(), chunk_size);
            buf.extend_from_slice(chunk);
        }
        off += chunk_size;
    }
    let out: BTreeMap<ShardId, Bytes> = out.into_iter().map(|(s, b)| (s, b.freeze())).collect();
    for buf in out.values() {
        assert_eq!(buf.len() as u64, total);
    }
    Ok(out)
}
