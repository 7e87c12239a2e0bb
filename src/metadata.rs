//! Per-object metadata: running chunk hashes and the compaction index
//!
//! Every object carries two distinguished extended attributes:
//!
//! - [`HINFO_KEY`] holds a [`HashInfo`]: the total chunk bytes appended so
//!   far and, for each of the K+M shards, a rolling CRC over that shard's
//!   chunk contents, seeded at `u32::MAX`.
//! - [`CINFO_KEY`] holds a [`CompactInfo`]: the compaction index mapping
//!   logical chunk positions to compressed on-disk byte ranges, one
//!   cumulative end offset per uncompressed chunk written to each shard.
//!
//! Both encode as length-prefixed versioned blobs (a one-byte struct
//! version, a payload length, then the fields in declaration order) so the
//! on-disk format can evolve.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;

use crate::compress;
use crate::error::{Error, Result};
use crate::types::ShardId;

/// Extended attribute key for the encoded [`HashInfo`].
pub const HINFO_KEY: &str = "hinfo_key";

/// Extended attribute key for the encoded [`CompactInfo`].
pub const CINFO_KEY: &str = "cinfo_key";

/// Whether `key` names the hash-info attribute.
pub fn is_hinfo_key(key: &str) -> bool {
    key == HINFO_KEY
}

/// Whether `key` names the compact-info attribute.
pub fn is_cinfo_key(key: &str) -> bool {
    key == CINFO_KEY
}

/// Shared handle to a cached [`HashInfo`].
pub type HashInfoRef = Arc<RwLock<HashInfo>>;

/// Shared handle to a cached [`CompactInfo`].
pub type CompactInfoRef = Arc<RwLock<CompactInfo>>;

const HASH_INFO_STRUCT_V: u8 = 1;
const COMPACT_INFO_STRUCT_V: u8 = 1;

fn decode_header(buf: &mut Bytes, kind: &'static str, want_v: u8) -> Result<usize> {
    if buf.remaining() < 5 {
        return Err(Error::MetadataDecode {
            kind,
            reason: "truncated header".into(),
        });
    }
    let v = buf.get_u8();
    if v != want_v {
        return Err(Error::MetadataDecode {
            kind,
            reason: format!("unsupported struct version {}", v),
        });
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::MetadataDecode {
            kind,
            reason: format!("payload truncated: want {}, have {}", len, buf.remaining()),
        });
    }
    Ok(len)
}

// =============================================================================
// HashInfo
// =============================================================================

/// Running per-shard chunk hashes for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashInfo {
    total_chunk_size: u64,
    cumulative_shard_hashes: Vec<u32>,
}

impl HashInfo {
    /// Fresh state for `num_chunks` (K+M) shards; every hash starts at
    /// the CRC seed `u32::MAX`.
    pub fn new(num_chunks: usize) -> Self {
        Self {
            total_chunk_size: 0,
            cumulative_shard_hashes: vec![u32::MAX; num_chunks],
        }
    }

    pub fn total_chunk_size(&self) -> u64 {
        self.total_chunk_size
    }

    /// Rolling hash of `shard`'s chunk contents.
    pub fn chunk_hash(&self, shard: ShardId) -> u32 {
        assert!(shard.index() < self.cumulative_shard_hashes.len());
        self.cumulative_shard_hashes[shard.index()]
    }

    /// Fold the next chunk of every shard into the rolling hashes.
    ///
    /// All shards advance together: `to_append` must cover every shard
    /// with equal-length buffers, and `old_size` must match the current
    /// total. Violations are bugs and abort.
    pub fn append(&mut self, old_size: u64, to_append: &BTreeMap<ShardId, Bytes>) {
        assert_eq!(to_append.len(), self.cumulative_shard_hashes.len());
        assert_eq!(old_size, self.total_chunk_size);
        let size_to_append = to_append.values().next().map_or(0, |b| b.len());
        for (shard, buf) in to_append {
            assert_eq!(buf.len(), size_to_append);
            assert!(shard.index() < self.cumulative_shard_hashes.len());
            let mut hasher =
                crc32fast::Hasher::new_with_initial(self.cumulative_shard_hashes[shard.index()]);
            hasher.update(buf);
            self.cumulative_shard_hashes[shard.index()] = hasher.finalize();
        }
        self.total_chunk_size += size_to_append as u64;
    }

    pub fn clear(&mut self) {
        self.total_chunk_size = 0;
        for h in &mut self.cumulative_shard_hashes {
            *h = u32::MAX;
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 8 + 4 + 4 * self.cumulative_shard_hashes.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u8(HASH_INFO_STRUCT_V);
        buf.put_u32_le(payload_len as u32);
        buf.put_u64_le(self.total_chunk_size);
        buf.put_u32_le(self.cumulative_shard_hashes.len() as u32);
        for h in &self.cumulative_shard_hashes {
            buf.put_u32_le(*h);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        decode_header(&mut buf, "HashInfo", HASH_INFO_STRUCT_V)?;
        if buf.remaining() < 12 {
            return Err(Error::MetadataDecode {
                kind: "HashInfo",
                reason: "truncated payload".into(),
            });
        }
        let total_chunk_size = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        if buf.remaining() < 4 * count {
            return Err(Error::MetadataDecode {
                kind: "HashInfo",
                reason: "truncated hash vector".into(),
            });
        }
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(buf.get_u32_le());
        }
        Ok(Self {
            total_chunk_size,
            cumulative_shard_hashes: hashes,
        })
    }
}

// =============================================================================
// CompactInfo
// =============================================================================

/// Per-object compression index.
///
/// For each shard, an ordered vector of cumulative on-disk end offsets,
/// one entry per uncompressed chunk written. The `i`-th entry is the byte
/// offset on disk where the compressed form of the `i`-th chunk ends, so
/// the compressed length of chunk `i` is `range[i] - range[i-1]`
/// (`range[0]` for `i = 0`) and `range.last()` is the shard's total
/// on-disk size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactInfo {
    total_origin_chunk_size: u64,
    stripe_width: u32,
    chunk_size: u32,
    stripe_compact_range: BTreeMap<ShardId, Vec<u32>>,
}

impl CompactInfo {
    pub fn new(num_chunks: usize, stripe_width: u32, chunk_size: u32) -> Self {
        let mut ranges = BTreeMap::new();
        for i in 0..num_chunks {
            ranges.insert(ShardId::from(i), Vec::new());
        }
        Self {
            total_origin_chunk_size: 0,
            stripe_width,
            chunk_size,
            stripe_compact_range: ranges,
        }
    }

    pub fn stripe_width(&self) -> u32 {
        self.stripe_width
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Uncompressed chunk bytes recorded per shard.
    pub fn total_origin_chunk_size(&self) -> u64 {
        self.total_origin_chunk_size
    }

    /// Total compressed bytes on disk for `shard`.
    pub fn total_chunk_size(&self, shard: ShardId) -> u64 {
        self.chunk_compact_range(shard).last().copied().unwrap_or(0) as u64
    }

    /// The cumulative end-offset vector for `shard`.
    pub fn chunk_compact_range(&self, shard: ShardId) -> &[u32] {
        self.stripe_compact_range
            .get(&shard)
            .expect("shard not tracked by compact info")
    }

    /// Concatenate new cumulative end vectors onto every shard.
    ///
    /// The caller supplies vectors already biased to continue from each
    /// shard's previous last entry. All shards advance together by the
    /// same chunk count; `append_size` is the uncompressed chunk bytes
    /// added per shard.
    pub fn append(
        &mut self,
        old_size: u64,
        to_append: &BTreeMap<ShardId, Vec<u32>>,
        append_size: u64,
    ) {
        assert_eq!(to_append.len(), self.stripe_compact_range.len());
        assert_eq!(old_size, self.total_origin_chunk_size);
        let entries = to_append.values().next().map_or(0, |v| v.len());
        for (shard, ends) in to_append {
            assert_eq!(ends.len(), entries);
            let range = self
                .stripe_compact_range
                .get_mut(shard)
                .expect("shard not tracked by compact info");
            if let (Some(&last), Some(&first)) = (range.last(), ends.first()) {
                assert!(first >= last);
            }
            range.extend_from_slice(ends);
        }
        self.total_origin_chunk_size += append_size;
    }

    pub fn clear(&mut self) {
        self.total_origin_chunk_size = 0;
        for range in self.stripe_compact_range.values_mut() {
            range.clear();
        }
    }

    /// Map a chunk-aligned logical range of `shard` to its compressed
    /// on-disk `(start, len)`.
    pub fn convert_compact_ranges(&self, shard: ShardId, offset: u32, len: u32) -> (u32, u32) {
        assert_eq!(offset % self.chunk_size, 0);
        assert_eq!(len % self.chunk_size, 0);
        let ranges = self.chunk_compact_range(shard);
        if ranges.is_empty() {
            return (0, 0);
        }
        let start = if offset == 0 {
            0
        } else {
            let idx = (offset / self.chunk_size - 1) as usize;
            assert!(idx < ranges.len());
            ranges[idx]
        };
        let mut end_chunk = ((offset + len) / self.chunk_size).saturating_sub(1) as usize;
        if end_chunk >= ranges.len() {
            end_chunk = ranges.len() - 1;
        }
        assert!(ranges[end_chunk] >= start);
        (start, ranges[end_chunk] - start)
    }

    /// Chunk index whose compressed data starts exactly at
    /// `compressed_end`. The offset must be zero or match a recorded
    /// cumulative end; anything else is a bug.
    pub fn compact_range_index(&self, shard: ShardId, compressed_end: u32) -> usize {
        if compressed_end == 0 {
            return 0;
        }
        let ranges = self.chunk_compact_range(shard);
        for (i, &end) in ranges.iter().enumerate() {
            if end == compressed_end {
                return i + 1;
            }
        }
        panic!(
            "compressed offset {} does not fall on a chunk boundary of shard {}",
            compressed_end, shard
        );
    }

    /// Largest chunk index whose cumulative end offset is at most
    /// `compressed_end` (for mapping an inexact range end).
    pub fn compact_min_range_index(&self, shard: ShardId, compressed_end: u32) -> usize {
        if compressed_end == 0 {
            return 0;
        }
        let ranges = self.chunk_compact_range(shard);
        for (i, &end) in ranges.iter().enumerate() {
            if compressed_end < end {
                assert!(i > 0, "compressed offset {} precedes first chunk end", compressed_end);
                return i - 1;
            } else if compressed_end == end {
                return i;
            }
        }
        ranges.len() - 1
    }

    /// Decompress `src`, which starts at compressed offset `offset` of
    /// `shard`, chunk by chunk.
    ///
    /// `offset` must be zero or a recorded chunk boundary, and `src` must
    /// not exceed `len` bytes. With `whole_decode` unset, a compressed
    /// chunk extending past the end of `src` terminates the walk (used to
    /// tolerate a short tail on recovery reads); with it set, every byte
    /// of `src` must decode. The output is always a whole number of
    /// chunks.
    pub fn decompact(
        &self,
        shard: ShardId,
        offset: u32,
        len: u32,
        src: &[u8],
        whole_decode: bool,
    ) -> Result<Bytes> {
        assert!(src.len() <= len as usize);
        let mut chunk = self.compact_range_index(shard, offset);
        let ranges = self.chunk_compact_range(shard);
        let mut dst = BytesMut::new();
        let mut step = 0usize;
        while step < src.len() {
            let mut decode_step = ranges[chunk] as usize;
            if chunk > 0 {
                decode_step -= ranges[chunk - 1] as usize;
            }
            if !whole_decode && step + decode_step > src.len() {
                tracing::debug!(
                    shard = %shard,
                    step,
                    decode_step,
                    src_len = src.len(),
                    "decompact stopping at short tail"
                );
                break;
            }
            assert!(step + decode_step <= src.len());
            let decoded = compress::decompress_chunk(&src[step..step + decode_step])?;
            if decoded.len() != self.chunk_size as usize {
                return Err(Error::DecompressionFailed {
                    algorithm: "LZ4".into(),
                    reason: format!(
                        "chunk {} decompressed to {} bytes, expected {}",
                        chunk,
                        decoded.len(),
                        self.chunk_size
                    ),
                });
            }
            dst.extend_from_slice(&decoded);
            chunk += 1;
            step += decode_step;
        }
        assert_eq!(dst.len() % self.chunk_size as usize, 0);
        Ok(dst.freeze())
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u64_le(self.total_origin_chunk_size);
        payload.put_u32_le(self.stripe_width);
        payload.put_u32_le(self.chunk_size);
        payload.put_u32_le(self.stripe_compact_range.len() as u32);
        for (shard, range) in &self.stripe_compact_range {
            payload.put_u8(shard.0);
            payload.put_u32_le(range.len() as u32);
            for end in range {
                payload.put_u32_le(*end);
            }
        }
        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(COMPACT_INFO_STRUCT_V);
        buf.put_u32_le(payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        decode_header(&mut buf, "CompactInfo", COMPACT_INFO_STRUCT_V)?;
        let truncated = || Error::MetadataDecode {
            kind: "CompactInfo",
            reason: "truncated payload".into(),
        };
        if buf.remaining() < 20 {
            return Err(truncated());
        }
        let total_origin_chunk_size = buf.get_u64_le();
        let stripe_width = buf.get_u32_le();
        let chunk_size = buf.get_u32_le();
        let shards = buf.get_u32_le() as usize;
        let mut ranges = BTreeMap::new();
        for _ in 0..shards {
            if buf.remaining() < 5 {
                return Err(truncated());
            }
            let shard = ShardId(buf.get_u8());
            let n = buf.get_u32_le() as usize;
            if buf.remaining() < 4 * n {
                return Err(truncated());
            }
            let mut range = Vec::with_capacity(n);
            for _ in 0..n {
                range.push(buf.get_u32_le());
            }
            ranges.insert(shard, range);
        }
        Ok(Self {
            total_origin_chunk_size,
            stripe_width,
            chunk_size,
            stripe_compact_range: ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_map(shards: usize, fill: u8, len: usize) -> BTreeMap<ShardId, Bytes> {
        (0..shards)
            .map(|i| (ShardId::from(i), Bytes::from(vec![fill, len as u8].repeat(len / 2))))
            .collect()
    }

    // =========================================================================
    // HashInfo
    // =========================================================================

    #[test]
    fn test_hash_info_append_advances_total() {
        let mut h = HashInfo::new(3);
        assert_eq!(h.total_chunk_size(), 0);
        h.append(0, &chunk_map(3, 0xAA, 64));
        assert_eq!(h.total_chunk_size(), 64);
        h.append(64, &chunk_map(3, 0xBB, 64));
        assert_eq!(h.total_chunk_size(), 128);
    }

    #[test]
    fn test_hash_info_chain_matches_single_pass() {
        let mut h = HashInfo::new(2);
        let first = Bytes::from(vec![1u8; 32]);
        let second = Bytes::from(vec![2u8; 32]);
        let mut step: BTreeMap<ShardId, Bytes> = BTreeMap::new();
        step.insert(ShardId(0), first.clone());
        step.insert(ShardId(1), first.clone());
        h.append(0, &step);
        step.insert(ShardId(0), second.clone());
        step.insert(ShardId(1), second.clone());
        h.append(32, &step);

        let mut whole = crc32fast::Hasher::new_with_initial(u32::MAX);
        whole.update(&first);
        whole.update(&second);
        assert_eq!(h.chunk_hash(ShardId(0)), whole.finalize());
    }

    #[test]
    #[should_panic]
    fn test_hash_info_append_wrong_old_size() {
        let mut h = HashInfo::new(2);
        h.append(16, &chunk_map(2, 0, 16));
    }

    #[test]
    #[should_panic]
    fn test_hash_info_append_uneven_buffers() {
        let mut h = HashInfo::new(2);
        let mut step = BTreeMap::new();
        step.insert(ShardId(0), Bytes::from(vec![0u8; 16]));
        step.insert(ShardId(1), Bytes::from(vec![0u8; 32]));
        h.append(0, &step);
    }

    #[test]
    fn test_hash_info_encode_decode_roundtrip() {
        let mut h = HashInfo::new(4);
        h.append(0, &chunk_map(4, 0x5A, 128));
        let decoded = HashInfo::decode(h.encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_hash_info_decode_rejects_garbage() {
        assert!(HashInfo::decode(Bytes::from_static(&[9, 0, 0])).is_err());
        assert!(HashInfo::decode(Bytes::from_static(&[1, 0xFF, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_hash_info_clear_resets_seed() {
        let mut h = HashInfo::new(2);
        h.append(0, &chunk_map(2, 0x11, 16));
        h.clear();
        assert_eq!(h, HashInfo::new(2));
    }

    // =========================================================================
    // CompactInfo
    // =========================================================================

    fn cinfo_with(ranges: &[(u8, &[u32])], origin: u64) -> CompactInfo {
        let mut c = CompactInfo::new(ranges.len(), 8192, 4096);
        let step: BTreeMap<ShardId, Vec<u32>> = ranges
            .iter()
            .map(|&(s, r)| (ShardId(s), r.to_vec()))
            .collect();
        c.append(0, &step, origin);
        c
    }

    #[test]
    fn test_compact_info_append_monotonic() {
        let mut c = CompactInfo::new(2, 8192, 4096);
        let mut step = BTreeMap::new();
        step.insert(ShardId(0), vec![100, 250]);
        step.insert(ShardId(1), vec![90, 200]);
        c.append(0, &step, 8192);
        assert_eq!(c.total_origin_chunk_size(), 8192);
        assert_eq!(c.chunk_compact_range(ShardId(0)), &[100, 250]);

        step.insert(ShardId(0), vec![300]);
        step.insert(ShardId(1), vec![260]);
        c.append(8192, &step, 4096);
        assert_eq!(c.chunk_compact_range(ShardId(0)), &[100, 250, 300]);
        assert_eq!(c.total_chunk_size(ShardId(1)), 260);
    }

    #[test]
    #[should_panic]
    fn test_compact_info_append_rejects_regression() {
        let mut c = cinfo_with(&[(0, &[100]), (1, &[100])], 4096);
        let mut step = BTreeMap::new();
        step.insert(ShardId(0), vec![50]);
        step.insert(ShardId(1), vec![150]);
        c.append(4096, &step, 4096);
    }

    #[test]
    fn test_convert_compact_ranges() {
        let c = cinfo_with(&[(0, &[100, 250, 300]), (1, &[90, 180, 270])], 12288);
        // First chunk: disk [0, 100)
        assert_eq!(c.convert_compact_ranges(ShardId(0), 0, 4096), (0, 100));
        // Second chunk: disk [100, 250)
        assert_eq!(c.convert_compact_ranges(ShardId(0), 4096, 4096), (100, 150));
        // Whole shard
        assert_eq!(c.convert_compact_ranges(ShardId(0), 0, 12288), (0, 300));
        // Length clamped past the end
        assert_eq!(c.convert_compact_ranges(ShardId(1), 4096, 40960), (90, 180));
        // Empty shard
        let empty = CompactInfo::new(1, 8192, 4096);
        assert_eq!(empty.convert_compact_ranges(ShardId(0), 0, 4096), (0, 0));
    }

    #[test]
    fn test_compact_range_indexes() {
        let c = cinfo_with(&[(0, &[100, 250, 300])], 12288);
        assert_eq!(c.compact_range_index(ShardId(0), 0), 0);
        assert_eq!(c.compact_range_index(ShardId(0), 100), 1);
        assert_eq!(c.compact_range_index(ShardId(0), 300), 3);

        assert_eq!(c.compact_min_range_index(ShardId(0), 0), 0);
        assert_eq!(c.compact_min_range_index(ShardId(0), 100), 0);
        assert_eq!(c.compact_min_range_index(ShardId(0), 120), 0);
        assert_eq!(c.compact_min_range_index(ShardId(0), 250), 1);
        assert_eq!(c.compact_min_range_index(ShardId(0), 9999), 2);
    }

    #[test]
    #[should_panic]
    fn test_compact_range_index_rejects_unaligned() {
        let c = cinfo_with(&[(0, &[100, 250])], 8192);
        c.compact_range_index(ShardId(0), 101);
    }

    #[test]
    fn test_decompact_roundtrip() {
        let chunk_size = 4096u32;
        let mut c = CompactInfo::new(1, chunk_size * 2, chunk_size);
        let chunks: Vec<Vec<u8>> = vec![vec![0xAA; 4096], vec![0xBB; 4096], vec![0xCC; 4096]];

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
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(out.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_decompact_partial_tail() {
        let chunk_size = 4096u32;
        let mut c = CompactInfo::new(1, chunk_size * 2, chunk_size);
        let chunks: Vec<Vec<u8>> = vec![vec![0x11; 4096], vec![0x22; 4096]];

        let mut disk = Vec::new();
        let mut ends = Vec::new();
        for chunk in &chunks {
            let block = compress::compress_chunk(chunk).unwrap();
            disk.extend_from_slice(&block);
            ends.push(disk.len() as u32);
        }
        let mut step = BTreeMap::new();
        step.insert(ShardId(0), ends.clone());
        c.append(0, &step, 2 * chunk_size as u64);

        // Hand decompact a prefix that cuts into the second chunk: with
        // whole_decode off only the first chunk comes back.
        let cut = (ends[0] + 1) as usize;
        let out = c
            .decompact(ShardId(0), 0, disk.len() as u32, &disk[..cut], false)
            .unwrap();
        assert_eq!(out.len(), chunk_size as usize);
        assert!(out.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_compact_info_encode_decode_roundtrip() {
        let c = cinfo_with(&[(0, &[10, 20, 30]), (1, &[5, 17, 29]), (2, &[8, 8, 40])], 12288);
        let decoded = CompactInfo::decode(c.encode()).unwrap();
        assert_eq!(decoded, c);
    }
}
