//! Property-Based Tests
//!
//! Systematic verification of the pure layers across a wide range of
//! inputs: stripe geometry arithmetic, metadata encode/decode and append
//! invariants, per-chunk compression through the compaction index, and
//! erasure encode/decode.

#![cfg(test)]

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use proptest::prelude::*;

use crate::codec::{self, ReedSolomonCodec};
use crate::compress;
use crate::geometry::StripeInfo;
use crate::interval::{BoundedIntervalSet, IntervalSet, MAX_NUM_INTERVALS};
use crate::metadata::{CompactInfo, HashInfo};
use crate::types::ShardId;

// =============================================================================
// Strategies
// =============================================================================

/// Valid (k, m) codec shapes, kept small for speed.
fn ec_config_strategy() -> impl Strategy<Value = (usize, usize)> {
    (2usize..=4, 1usize..=2)
}

/// A stripe width that divides evenly into k chunks.
fn geometry_strategy() -> impl Strategy<Value = (u64, u64)> {
    (2u64..=8, 1u64..=64).prop_map(|(k, chunk_units)| (k, k * chunk_units * 64))
}

fn interval_ops_strategy() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..10_000, 1u64..500), 1..40)
}

// =============================================================================
// Geometry Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// next_stripe is the least stripe-aligned offset >= offset, and
    /// prev_stripe differs from it by 0 or one stripe.
    #[test]
    fn prop_stripe_rounding((k, width) in geometry_strategy(), offset in 0u64..1_000_000) {
        let s = StripeInfo::new(k, width).unwrap();
        let next = s.logical_to_next_stripe_offset(offset);
        let prev = s.logical_to_prev_stripe_offset(offset);
        prop_assert!(next >= offset);
        prop_assert!(prev <= offset);
        prop_assert!(next - prev == 0 || next - prev == width);
        prop_assert_eq!(next == offset, offset % width == 0);
    }

    /// Stripe bounds always cover the requested extent.
    #[test]
    fn prop_stripe_bounds_cover(
        (k, width) in geometry_strategy(),
        offset in 0u64..1_000_000,
        len in 1u64..100_000,
    ) {
        let s = StripeInfo::new(k, width).unwrap();
        let (start, covering) = s.offset_len_to_stripe_bounds(offset, len);
        prop_assert!(start <= offset);
        prop_assert!(start + covering >= offset + len);
        prop_assert_eq!(start % width, 0);
        prop_assert_eq!(covering % width, 0);
    }

    /// Chunk and logical offsets convert back and forth exactly.
    #[test]
    fn prop_aligned_offset_roundtrip((k, width) in geometry_strategy(), stripes in 0u64..1000) {
        let s = StripeInfo::new(k, width).unwrap();
        let logical = stripes * width;
        let chunk = s.aligned_logical_offset_to_chunk_offset(logical);
        prop_assert_eq!(s.aligned_chunk_offset_to_logical_offset(chunk), logical);
    }
}

// =============================================================================
// Metadata Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// HashInfo survives an encode/decode roundtrip after any sequence
    /// of appends.
    #[test]
    fn prop_hash_info_roundtrip(
        shards in 2usize..=6,
        appends in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 0..5),
    ) {
        let mut h = HashInfo::new(shards);
        for buf in appends {
            let step: BTreeMap<ShardId, Bytes> = (0..shards)
                .map(|s| (ShardId::from(s), Bytes::from(buf.clone())))
                .collect();
            h.append(h.total_chunk_size(), &step);
        }
        prop_assert_eq!(HashInfo::decode(h.encode()).unwrap(), h);
    }

    /// CompactInfo stays internally consistent across appends: vectors
    /// non-decreasing, equal length per shard, and the origin size
    /// tracking len(range) * chunk_size; and it roundtrips.
    #[test]
    fn prop_compact_info_append_invariants(
        shards in 2usize..=4,
        chunk_lens in prop::collection::vec(prop::collection::vec(1u32..500, 1..4), 1..5),
    ) {
        let chunk_size = 4096u32;
        let mut c = CompactInfo::new(shards, chunk_size * 2, chunk_size);
        for lens in &chunk_lens {
            let mut step: BTreeMap<ShardId, Vec<u32>> = BTreeMap::new();
            for s in 0..shards {
                let shard = ShardId::from(s);
                let mut cursor = c.chunk_compact_range(shard).last().copied().unwrap_or(0);
                let ends: Vec<u32> = lens
                    .iter()
                    .map(|l| {
                        cursor += l;
                        cursor
                    })
                    .collect();
                step.insert(shard, ends);
            }
            c.append(
                c.total_origin_chunk_size(),
                &step,
                lens.len() as u64 * chunk_size as u64,
            );
        }

        let expected_entries: usize = chunk_lens.iter().map(|l| l.len()).sum();
        for s in 0..shards {
            let range = c.chunk_compact_range(ShardId::from(s));
            prop_assert_eq!(range.len(), expected_entries);
            prop_assert!(range.windows(2).all(|w| w[0] <= w[1]));
        }
        prop_assert_eq!(
            c.total_origin_chunk_size(),
            expected_entries as u64 * chunk_size as u64
        );
        prop_assert_eq!(CompactInfo::decode(c.encode()).unwrap(), c);
    }

    /// Compressing chunk by chunk, recording cumulative ends, and
    /// decompacting yields exactly the original bytes.
    #[test]
    fn prop_compress_decompact_roundtrip(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 256..=256), 1..6),
    ) {
        let chunk_size = 256u32;
        let mut c = CompactInfo::new(1, chunk_size * 2, chunk_size);
        let mut disk = Vec::new();
        let mut ends = Vec::new();
        for chunk in &chunks {
            let block = compress::compress_chunk(chunk).unwrap();
            disk.extend_from_slice(&block);
            ends.push(disk.len() as u32);
        }
        let mut step = BTreeMap::new();
        step.insert(ShardId(0), ends);
        c.append(0, &step, chunks.len() as u64 * chunk_size as u64);

        let out = c
            .decompact(ShardId(0), 0, disk.len() as u32, &disk, true)
            .unwrap();
        let expected = chunks.concat();
        prop_assert_eq!(out.as_ref(), expected.as_slice());
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Encoding whole stripes, discarding any m shards, and decoding the
    /// survivors reproduces the logical bytes.
    #[test]
    fn prop_encode_decode_stripes_roundtrip(
        (k, m) in ec_config_strategy(),
        stripes in 1usize..4,
        seed in any::<u8>(),
        drop_offset in any::<usize>(),
    ) {
        let chunk = 64u64;
        let width = k as u64 * chunk;
        let sinfo = StripeInfo::new(k as u64, width).unwrap();
        let codec = ReedSolomonCodec::new(k, m).unwrap();
        let data: Vec<u8> = (0..width as usize * stripes)
            .map(|i| (i as u8).wrapping_mul(seed))
            .collect();

        let want: BTreeSet<usize> = (0..k + m).collect();
        let mut shards = codec::encode_stripes(&sinfo, &codec, &want, &data).unwrap();

        // Discard m shards, chosen by the fuzzed offset.
        for i in 0..m {
            let victim = ShardId::from((drop_offset + i) % (k + m));
            shards.remove(&victim);
        }
        prop_assert_eq!(shards.len(), k);

        let rebuilt = codec::decode_stripes_concat(&sinfo, &codec, &shards).unwrap();
        prop_assert_eq!(rebuilt.as_ref(), data.as_slice());
    }
}

// =============================================================================
// Interval Set Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The bounded set never exceeds its cap, whatever is thrown at it.
    #[test]
    fn prop_bounded_interval_cap(ops in interval_ops_strategy()) {
        let mut s = BoundedIntervalSet::new();
        for (start, len) in ops {
            s.insert(start, len);
            prop_assert!(s.num_intervals() <= MAX_NUM_INTERVALS);
        }
    }

    /// While under the cap, the bounded set behaves exactly like the
    /// unbounded one.
    #[test]
    fn prop_bounded_matches_exact_under_cap(ops in interval_ops_strategy()) {
        let mut bounded = BoundedIntervalSet::new();
        let mut exact = IntervalSet::new();
        for (start, len) in ops {
            exact.insert(start, len);
            if exact.num_intervals() > MAX_NUM_INTERVALS {
                break;
            }
            bounded.insert(start, len);
            prop_assert_eq!(bounded.intervals(), &exact);
        }
    }

    /// Inserting then erasing the same extent leaves prior coverage
    /// intact and the extent uncovered.
    #[test]
    fn prop_interval_insert_erase(
        base in 0u64..1000,
        len in 1u64..100,
        probe in 0u64..1200,
    ) {
        let mut s = IntervalSet::new();
        s.insert(base, len);
        prop_assert!(s.contains(base, len));
        s.erase(base, len);
        prop_assert!(!s.intersects(base, len));
        prop_assert!(!s.contains_point(probe) || (probe >= base + len || probe < base));
    }
}
