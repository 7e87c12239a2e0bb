//! Placement-group listener boundary
//!
//! The backend does not own peering state, the log, or the messenger;
//! it reaches all of them through [`PgListener`], injected at
//! construction. This keeps the engines free of daemon globals and lets
//! tests stand in a scripted topology.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::messages::{LogEntry, Message, RecoveryInfo};
use crate::store::Transaction;
use crate::types::{Attrs, NodeId, ObjectId, PgShard, Tid, Version};

/// Handle to an object's cached context (size and last version), owned
/// by the layer above the backend.
#[derive(Debug, Clone, Default)]
pub struct ObjectContext {
    pub size: u64,
    pub version: Version,
}

pub type ObjectContextRef = Arc<ObjectContext>;

/// Cluster-topology view used for cancellation on peer loss.
pub trait OsdMapView {
    fn is_down(&self, node: NodeId) -> bool;
}

impl OsdMapView for BTreeSet<NodeId> {
    fn is_down(&self, node: NodeId) -> bool {
        self.contains(&node)
    }
}

/// Everything the backend needs from the placement group around it.
pub trait PgListener: Send + Sync {
    // --- identity and topology -------------------------------------------

    fn whoami(&self) -> PgShard;

    fn primary_shard(&self) -> PgShard;

    fn is_primary(&self) -> bool {
        self.whoami() == self.primary_shard()
    }

    fn epoch(&self) -> u64;

    /// Shards in the acting set.
    fn acting_shards(&self) -> BTreeSet<PgShard>;

    /// Shards in the acting set plus backfill targets (every write
    /// participant).
    fn acting_backfill_shards(&self) -> BTreeSet<PgShard>;

    /// Backfill targets only.
    fn backfill_shards(&self) -> BTreeSet<PgShard>;

    /// Extra known locations of an object beyond the acting set.
    fn missing_loc_shards(&self, oid: &ObjectId) -> BTreeSet<PgShard>;

    /// Whether `shard`'s copy of `oid` is missing (unrecovered).
    fn is_missing(&self, shard: PgShard, oid: &ObjectId) -> bool;

    /// How far `shard`'s backfill has progressed; objects at or past the
    /// bound are not yet on that shard.
    fn last_backfill(&self, shard: PgShard) -> Option<ObjectId>;

    /// Whether the group currently has fewer shards than K+M.
    fn is_undersized(&self) -> bool;

    // --- write-side bookkeeping ------------------------------------------

    fn next_tid(&self) -> Tid;

    fn last_complete(&self) -> Version;

    /// Record the log entries of an applied sub-write.
    fn log_operation(
        &self,
        log_entries: &[LogEntry],
        trim_to: Version,
        trim_rollback_to: Version,
        transaction_applied: bool,
    );

    fn op_applied(&self, version: Version);

    fn update_last_complete_ondisk(&self, version: Version);

    fn update_peer_last_complete_ondisk(&self, from: PgShard, version: Version);

    // --- messaging ---------------------------------------------------------

    /// Fire-and-forget a sub-op message to a peer daemon.
    fn send_message(&self, to: NodeId, msg: Message);

    // --- object context ------------------------------------------------------

    /// Resolve (or build from `attrs`) the object context for `oid`.
    fn object_context(&self, oid: &ObjectId, attrs: &Attrs) -> ObjectContextRef;

    // --- recovery callbacks -------------------------------------------------

    fn begin_peer_recover(&self, peer: PgShard, oid: &ObjectId);

    /// A local recovery of `oid` is starting; the listener may add
    /// cleanup ops to `txn`.
    fn on_local_recover_start(&self, oid: &ObjectId, txn: &mut Transaction);

    /// `oid` finished recovering locally; `txn` carries the final move.
    fn on_local_recover(
        &self,
        oid: &ObjectId,
        info: &RecoveryInfo,
        obc: Option<ObjectContextRef>,
        txn: &mut Transaction,
    );

    /// `peer`'s copy of `oid` finished recovering.
    fn on_peer_recover(&self, peer: PgShard, oid: &ObjectId, info: &RecoveryInfo);

    /// Every missing copy of `oid` has been recovered.
    fn on_global_recover(&self, oid: &ObjectId);

    /// The pull for `oid` was abandoned (sources lost).
    fn cancel_pull(&self, oid: &ObjectId);

    /// Whether writes should be sent to `peer` for `oid` (backfill may
    /// exclude objects past the peer's backfill bound).
    fn should_send_op(&self, _peer: PgShard, _oid: &ObjectId) -> bool {
        true
    }
}
