//! Client-visible EC transaction
//!
//! The layer above the backend describes a write as an [`EcTransaction`]:
//! logical appends plus object create/remove and attribute changes. The
//! write engine expands it into one store transaction per shard -
//! encoding appended bytes into K+M chunks, compressing each chunk, and
//! advancing the per-object hash and compaction metadata as it goes.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use tracing::debug;

use crate::codec::{self, ErasureCodec};
use crate::compress;
use crate::error::Result;
use crate::geometry::StripeInfo;
use crate::metadata::{CompactInfoRef, HashInfoRef, CINFO_KEY, HINFO_KEY};
use crate::store::Transaction;
use crate::types::{Attrs, GhObjectId, ObjectId, ShardId};

/// One logical operation inside an [`EcTransaction`].
#[derive(Debug, Clone)]
pub enum EcOp {
    /// Append stripe-aligned bytes at the object's current logical end.
    Append { oid: ObjectId, data: Bytes },
    /// Ensure the object exists.
    Touch { oid: ObjectId },
    /// Remove the object from every shard.
    Remove { oid: ObjectId },
    /// Set user attributes on every shard.
    SetAttrs { oid: ObjectId, attrs: Attrs },
}

/// Ordered batch of logical operations making up one client write.
#[derive(Debug, Clone, Default)]
pub struct EcTransaction {
    ops: Vec<EcOp>,
}

impl EcTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append `data` to `oid`. The length must span whole stripes; the
    /// caller pads the tail.
    pub fn append(&mut self, oid: ObjectId, data: Bytes) {
        self.ops.push(EcOp::Append { oid, data });
    }

    pub fn touch(&mut self, oid: ObjectId) {
        self.ops.push(EcOp::Touch { oid });
    }

    pub fn remove(&mut self, oid: ObjectId) {
        self.ops.push(EcOp::Remove { oid });
    }

    pub fn setattrs(&mut self, oid: ObjectId, attrs: Attrs) {
        self.ops.push(EcOp::SetAttrs { oid, attrs });
    }

    /// Objects this transaction appends to (they need hash and compact
    /// metadata resolved before the write starts).
    pub fn get_append_objects(&self) -> BTreeSet<ObjectId> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                EcOp::Append { oid, .. } => Some(oid.clone()),
                _ => None,
            })
            .collect()
    }

    /// Expand into per-shard store transactions.
    ///
    /// Appended bytes are encoded into K+M chunk streams, each chunk is
    /// LZ4-compressed, and the writes land at each shard's current
    /// compressed end. The hash and compaction metadata advance in
    /// memory and their new encodings are persisted as xattrs on every
    /// shard. Metadata is updated for all K+M positions even when some
    /// shard currently has no store transaction (undersized group).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn generate_transactions(
        &self,
        hinfos: &BTreeMap<ObjectId, HashInfoRef>,
        cinfos: &BTreeMap<ObjectId, CompactInfoRef>,
        codec: &dyn ErasureCodec,
        sinfo: &StripeInfo,
        trans: &mut BTreeMap<ShardId, Transaction>,
        temp_added: &mut BTreeSet<ObjectId>,
        temp_removed: &mut BTreeSet<ObjectId>,
    ) -> Result<()> {
        let all_shards: BTreeSet<usize> = (0..codec.chunk_count()).collect();
        for op in &self.ops {
            match op {
                EcOp::Append { oid, data } => {
                    assert_eq!(data.len() as u64 % sinfo.stripe_width(), 0);
                    if data.is_empty() {
                        continue;
                    }
                    let hinfo = hinfos
                        .get(oid)
                        .unwrap_or_else(|| panic!("no hash info resolved for {}", oid));
                    let cinfo = cinfos
                        .get(oid)
                        .unwrap_or_else(|| panic!("no compact info resolved for {}", oid));

                    let chunks = codec::encode_stripes(sinfo, codec, &all_shards, data)?;
                    let chunk_size = sinfo.chunk_size() as usize;
                    let append_len = data.len() as u64 / sinfo.data_chunk_count();

                    let mut cinfo = cinfo.write();
                    let mut hinfo = hinfo.write();
                    let mut new_ends: BTreeMap<ShardId, Vec<u32>> = BTreeMap::new();
                    for (&shard, stream) in &chunks {
                        let disk_offset = cinfo.total_chunk_size(shard);
                        let mut cursor = disk_offset as u32;
                        let mut ends = Vec::with_capacity(stream.len() / chunk_size);
                        let mut blob = Vec::new();
                        for chunk in stream.chunks(chunk_size) {
                            let compressed = compress::compress_chunk(chunk)?;
                            cursor += compressed.len() as u32;
                            ends.push(cursor);
                            blob.extend_from_slice(&compressed);
                        }
                        debug!(
                            oid = %oid,
                            shard = %shard,
                            disk_offset,
                            compressed = blob.len(),
                            uncompressed = stream.len(),
                            "append chunk stream"
                        );
                        if let Some(txn) = trans.get_mut(&shard) {
                            txn.write(
                                GhObjectId::new(oid.clone(), shard),
                                disk_offset,
                                Bytes::from(blob),
                            );
                        }
                        new_ends.insert(shard, ends);
                    }
                    let hinfo_total_chunk_size = hinfo.total_chunk_size();
                    hinfo.append(hinfo_total_chunk_size, &chunks);
                    let cinfo_total_origin_chunk_size = cinfo.total_origin_chunk_size();
                    cinfo.append(cinfo_total_origin_chunk_size, &new_ends, append_len);

                    let mut attrs = Attrs::new();
                    attrs.insert(HINFO_KEY.to_string(), hinfo.encode());
                    attrs.insert(CINFO_KEY.to_string(), cinfo.encode());
                    for (&shard, txn) in trans.iter_mut() {
                        txn.setattrs(GhObjectId::new(oid.clone(), shard), attrs.clone());
                    }
                    if oid.is_temp() {
                        temp_added.insert(oid.clone());
                    }
                }
                EcOp::Touch { oid } => {
                    for (&shard, txn) in trans.iter_mut() {
                        txn.touch(GhObjectId::new(oid.clone(), shard));
                    }
                    if oid.is_temp() {
                        temp_added.insert(oid.clone());
                    }
                }
                EcOp::Remove { oid } => {
                    for (&shard, txn) in trans.iter_mut() {
                        txn.remove(GhObjectId::new(oid.clone(), shard));
                    }
                    if oid.is_temp() {
                        temp_removed.insert(oid.clone());
                    }
                }
                EcOp::SetAttrs { oid, attrs } => {
                    for (&shard, txn) in trans.iter_mut() {
                        txn.setattrs(GhObjectId::new(oid.clone(), shard), attrs.clone());
                    }
                }
            }
        }
        Ok(())
    }
}
