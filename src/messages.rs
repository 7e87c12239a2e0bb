//! Sub-op wire messages
//!
//! Every message the backend exchanges with its peer shards: sub-writes
//! and their replies, sub-reads and their replies, and the recovery
//! push / push-reply pair. Payloads are plain data with serde derives;
//! the transport below this crate decides the framing.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::interval::BoundedIntervalSet;
use crate::store::Transaction;
use crate::types::{Attrs, ObjectId, PgShard, ReqId, Tid, Version};

// =============================================================================
// Log Entries and Rollback Descriptions
// =============================================================================

/// One placement-group log entry carried alongside a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub oid: ObjectId,
    pub version: Version,
    pub mod_desc: ModDesc,
}

/// How to undo one modification of an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModOp {
    /// The object was appended to; rolling back truncates to `old_size`.
    Append { old_size: u64 },
    /// The object was created by this entry.
    Create,
    /// The object was removed (stashed) at `version`.
    RmObject { version: u64 },
    /// Attributes changed; `old_attrs` restores them (`None` deletes).
    SetAttrs {
        old_attrs: BTreeMap<String, Option<Bytes>>,
    },
}

/// Ordered rollback description for one log entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModDesc {
    pub ops: Vec<ModOp>,
}

impl ModDesc {
    pub fn new(ops: Vec<ModOp>) -> Self {
        Self { ops }
    }

    pub fn can_rollback(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Prepend an attribute-restore op, so rollback reinstates the given
    /// attributes before undoing anything else.
    pub fn prepend_rollback_attrs(&mut self, old_attrs: BTreeMap<String, Option<Bytes>>) {
        self.ops.insert(0, ModOp::SetAttrs { old_attrs });
    }
}

/// Whether this entry's rollback needs the pre-write metadata attributes
/// stashed in front of it.
///
/// An append mutates the running hashes and the compaction index, so the
/// old encoded values must ride along; a create or remove starts the
/// object fresh and needs nothing.
pub fn must_prepend_hash_info(desc: &ModDesc) -> bool {
    for op in &desc.ops {
        match op {
            ModOp::Append { .. } => return true,
            ModOp::Create | ModOp::RmObject { .. } => return false,
            ModOp::SetAttrs { .. } => continue,
        }
    }
    false
}

// =============================================================================
// Recovery Payloads
// =============================================================================

/// Identity and size of the object being recovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub oid: ObjectId,
    pub version: Version,
    pub size: u64,
}

/// Cursor through a single object's recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoveryProgress {
    /// True until the first read/push round completes.
    pub first: bool,
    /// Logical bytes recovered so far (stripe aligned).
    pub data_recovered_to: u64,
    pub data_complete: bool,
    pub omap_complete: bool,
}

impl Default for RecoveryProgress {
    fn default() -> Self {
        Self {
            first: true,
            data_recovered_to: 0,
            data_complete: false,
            omap_complete: false,
        }
    }
}

/// One chunk of recovered shard data pushed to a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOp {
    pub oid: ObjectId,
    pub version: Version,
    /// Recompressed shard bytes for the interval below.
    pub data: Bytes,
    /// Compressed on-disk interval the data covers.
    pub data_included: BoundedIntervalSet,
    /// Cumulative compressed end offsets the target appends to its index.
    pub compact_ends: Vec<u32>,
    /// Object attributes; populated on the first push only.
    pub attrset: Attrs,
    pub recovery_info: RecoveryInfo,
    pub before_progress: RecoveryProgress,
    pub after_progress: RecoveryProgress,
}

/// Acknowledgement of one applied push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReplyOp {
    pub oid: ObjectId,
}

// =============================================================================
// Sub-Op Messages
// =============================================================================

/// Placement-group stats snapshot carried on sub-writes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PgStats {
    pub objects: u64,
    pub bytes: u64,
}

/// Primary → peer: apply one shard's slice of a client write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcWrite {
    pub from: PgShard,
    pub tid: Tid,
    pub reqid: ReqId,
    pub oid: ObjectId,
    pub stats: PgStats,
    pub txn: Transaction,
    pub at_version: Version,
    pub trim_to: Version,
    pub trim_rollback_to: Version,
    pub log_entries: Vec<LogEntry>,
    pub hit_set_history: Option<Bytes>,
    pub temp_added: BTreeSet<ObjectId>,
    pub temp_removed: BTreeSet<ObjectId>,
}

/// Peer → primary: apply/commit acknowledgement for one sub-write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcWriteReply {
    pub from: PgShard,
    pub tid: Tid,
    pub last_complete: Version,
    pub committed: bool,
    pub applied: bool,
}

/// Primary → peer: read compressed ranges of one or more objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcRead {
    pub from: PgShard,
    pub tid: Tid,
    /// Per object: compressed (offset, length, flags) extents to read.
    pub to_read: BTreeMap<ObjectId, Vec<(u64, u64, u32)>>,
    pub attrs_to_read: BTreeSet<ObjectId>,
    /// Advisory: warm the store's cache and return nothing.
    pub preheat: bool,
    /// Verify the shard with a deep scrub when the read covers it fully.
    pub self_check: bool,
}

/// Peer → primary: data and attributes for one sub-read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcReadReply {
    pub from: PgShard,
    pub tid: Tid,
    pub buffers_read: BTreeMap<ObjectId, Vec<(u64, Bytes)>>,
    pub attrs_read: BTreeMap<ObjectId, Attrs>,
    /// Negative errno-style codes per failed object.
    pub errors: BTreeMap<ObjectId, i32>,
}

/// Recovered data pushed to a target shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgPush {
    pub from: PgShard,
    pub pushes: Vec<PushOp>,
}

/// Acknowledgements for applied pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgPushReply {
    pub from: PgShard,
    pub replies: Vec<PushReplyOp>,
}

/// Every sub-op message kind the backend dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Write(EcWrite),
    WriteReply(EcWriteReply),
    Read(EcRead),
    ReadReply(EcReadReply),
    Push(PgPush),
    PushReply(PgPushReply),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Write(_) => "EcWrite",
            Message::WriteReply(_) => "EcWriteReply",
            Message::Read(_) => "EcRead",
            Message::ReadReply(_) => "EcReadReply",
            Message::Push(_) => "PgPush",
            Message::PushReply(_) => "PgPushReply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_prepend_hash_info_on_append() {
        let desc = ModDesc::new(vec![ModOp::Append { old_size: 0 }]);
        assert!(must_prepend_hash_info(&desc));
    }

    #[test]
    fn test_must_prepend_hash_info_create_wins() {
        let desc = ModDesc::new(vec![ModOp::Create, ModOp::Append { old_size: 0 }]);
        assert!(!must_prepend_hash_info(&desc));
        assert!(!must_prepend_hash_info(&ModDesc::default()));
    }

    #[test]
    fn test_prepend_rollback_attrs_goes_first() {
        let mut desc = ModDesc::new(vec![ModOp::Append { old_size: 4096 }]);
        desc.prepend_rollback_attrs(BTreeMap::new());
        assert!(matches!(desc.ops[0], ModOp::SetAttrs { .. }));
        assert!(must_prepend_hash_info(&desc));
        assert!(desc.can_rollback());
    }
}
