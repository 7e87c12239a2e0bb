//! The erasure-coded object backend
//!
//! One [`EcBackend`] serves a single placement group on a single daemon.
//! The group is the unit of serialization: all entry points take
//! `&mut self` and are driven from one worker at a time. Long store I/O
//! never blocks a handler; completions come back as [`BackendEvent`]s
//! posted to the group worker's queue.
//!
//! The engines live in the submodules:
//!
//! - [`read`] - client and recovery reads: shard selection, sub-read
//!   dispatch, reassembly and decode, the partial-read fast path,
//!   cancellation on topology changes
//! - [`write`] - encode, per-shard sub-writes, two-phase (applied /
//!   committed) completion with rollback metadata
//! - [`recovery`] - per-object pull state machine and the push /
//!   push-reply protocol
//! - [`scrub`] - deep read-and-verify against the running hashes and the
//!   compaction index
//! - [`transaction`] - the client-visible transaction and its expansion
//!   into per-shard store transactions

mod read;
mod recovery;
mod scrub;
mod transaction;
mod write;

pub use read::ReadCall;
pub use recovery::RecoveryHandle;
pub use scrub::ScrubObject;
pub use transaction::EcTransaction;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::cache::LruCache;
use crate::codec::ErasureCodec;
use crate::error::{Error, Result};
use crate::geometry::StripeInfo;
use crate::listener::PgListener;
use crate::messages::{EcRead, Message};
use crate::metadata::{
    self, CompactInfo, CompactInfoRef, HashInfo, HashInfoRef, CINFO_KEY, HINFO_KEY,
};
use crate::store::ObjectStore;
use crate::types::{Attrs, GhObjectId, ObjectId, PgShard, Tid, Version};

use read::{ClientAsyncReadStatus, ReadOp};
use recovery::{RecoveryMessages, RecoveryOp};
use write::WriteOp;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for one backend instance.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// A read this small (relative to the stripe width) may skip the
    /// decode and hit only the shards owning its chunks. Must be <= 1.0.
    pub partial_read_ratio: f64,

    /// Read every available shard instead of the minimum set, completing
    /// as soon as K shards respond per object.
    pub subread_all: bool,

    /// Logical bytes recovered per read/push round (rounded up to a
    /// stripe boundary).
    pub recovery_max_chunk: u64,

    /// Deep-scrub read stride (rounded up to a chunk boundary).
    pub deep_scrub_stride: u64,

    /// Capacity of each per-object metadata registry.
    pub metadata_cache_entries: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            partial_read_ratio: 0.5,
            subread_all: false,
            recovery_max_chunk: 8 << 20,
            deep_scrub_stride: 512 << 10,
            metadata_cache_entries: 256,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.partial_read_ratio) {
            return Err(Error::InvalidEcConfig(format!(
                "partial_read_ratio {} outside [0, 1]",
                self.partial_read_ratio
            )));
        }
        if self.recovery_max_chunk == 0 {
            return Err(Error::InvalidEcConfig(
                "recovery_max_chunk must be positive".into(),
            ));
        }
        if self.deep_scrub_stride == 0 {
            return Err(Error::InvalidEcConfig(
                "deep_scrub_stride must be positive".into(),
            ));
        }
        if self.metadata_cache_entries == 0 {
            return Err(Error::InvalidEcConfig(
                "metadata_cache_entries must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Async completions posted back onto the group worker's queue.
#[derive(Debug)]
pub enum BackendEvent {
    /// A local sub-write became readable.
    SubWriteApplied { tid: Tid, at_version: Version },
    /// A local sub-write became durable.
    SubWriteCommitted {
        tid: Tid,
        at_version: Version,
        last_complete: Version,
    },
    /// A filtered read op has no peers left in flight; finish it.
    FinishReadOp { tid: Tid },
}

// =============================================================================
// Backend
// =============================================================================

/// Erasure-coded backend state for one placement group.
pub struct EcBackend {
    pub(crate) cfg: BackendConfig,
    pub(crate) sinfo: StripeInfo,
    pub(crate) codec: Arc<dyn ErasureCodec>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) listener: Arc<dyn PgListener>,
    pub(crate) events: UnboundedSender<BackendEvent>,
    pub(crate) subread_all: bool,

    // Write tracking (primary side)
    pub(crate) tid_to_op_map: BTreeMap<Tid, WriteOp>,
    pub(crate) writing: VecDeque<Tid>,

    // Read tracking (primary side)
    pub(crate) tid_to_read_map: BTreeMap<Tid, ReadOp>,
    pub(crate) shard_to_read_map: BTreeMap<PgShard, BTreeSet<Tid>>,
    pub(crate) in_progress_client_reads: VecDeque<ClientAsyncReadStatus>,
    pub(crate) next_client_read_id: u64,

    // Recovery tracking (primary side)
    pub(crate) recovery_ops: BTreeMap<ObjectId, RecoveryOp>,

    // Temp objects staged on this shard
    pub(crate) temp_contents: BTreeSet<ObjectId>,

    // Canonical lookup points for per-object metadata
    pub(crate) unstable_hashinfo_registry: LruCache<ObjectId, HashInfoRef>,
    pub(crate) unstable_compactinfo_registry: LruCache<ObjectId, CompactInfoRef>,
}

impl EcBackend {
    /// Build a backend over `codec` with `stripe_width` logical bytes per
    /// stripe.
    pub fn new(
        cfg: BackendConfig,
        stripe_width: u64,
        codec: Arc<dyn ErasureCodec>,
        store: Arc<dyn ObjectStore>,
        listener: Arc<dyn PgListener>,
        events: UnboundedSender<BackendEvent>,
    ) -> Result<Self> {
        cfg.validate()?;
        let k = codec.data_chunk_count() as u64;
        if k * codec.chunk_size(stripe_width) != stripe_width {
            return Err(Error::InvalidEcConfig(format!(
                "stripe width {} does not split into {} codec chunks",
                stripe_width, k
            )));
        }
        let sinfo = StripeInfo::new(k, stripe_width)?;
        // A permuted chunk layout makes "any K responses" reassembly
        // ambiguous; fall back to minimal reads.
        let subread_all = cfg.subread_all && codec.chunk_mapping().is_empty();
        let cache_entries = cfg.metadata_cache_entries;
        Ok(Self {
            cfg,
            sinfo,
            codec,
            store,
            listener,
            events,
            subread_all,
            tid_to_op_map: BTreeMap::new(),
            writing: VecDeque::new(),
            tid_to_read_map: BTreeMap::new(),
            shard_to_read_map: BTreeMap::new(),
            in_progress_client_reads: VecDeque::new(),
            next_client_read_id: 0,
            recovery_ops: BTreeMap::new(),
            temp_contents: BTreeSet::new(),
            unstable_hashinfo_registry: LruCache::new(cache_entries),
            unstable_compactinfo_registry: LruCache::new(cache_entries),
        })
    }

    pub fn stripe_info(&self) -> &StripeInfo {
        &self.sinfo
    }

    /// Sub-ops all require an active placement group.
    pub fn can_handle_while_inactive(&self, _msg: &Message) -> bool {
        false
    }

    /// The id of this shard's piece of `oid`.
    pub(crate) fn local_object(&self, oid: &ObjectId) -> GhObjectId {
        GhObjectId::new(oid.clone(), self.listener.whoami().shard)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch one inbound sub-op message. Returns false for kinds this
    /// backend does not own.
    pub fn handle_message(&mut self, msg: Message) -> bool {
        debug!(kind = msg.kind(), "handling message");
        match msg {
            Message::Write(op) => {
                self.handle_sub_write(op, None);
                true
            }
            Message::WriteReply(reply) => {
                self.handle_sub_write_reply(reply.from, &reply);
                true
            }
            Message::Read(op) => {
                if op.preheat {
                    self.handle_preheat(&op);
                } else {
                    let from = op.from;
                    let reply = self.handle_sub_read(op);
                    self.listener
                        .send_message(from.node, Message::ReadReply(reply));
                }
                true
            }
            Message::ReadReply(reply) => {
                let mut m = RecoveryMessages::new();
                self.handle_sub_read_reply(reply, &mut m);
                self.dispatch_recovery_messages(m, 0);
                true
            }
            Message::Push(push) => {
                let mut m = RecoveryMessages::new();
                for op in push.pushes {
                    self.handle_recovery_push(op, &mut m);
                }
                self.dispatch_recovery_messages(m, 0);
                true
            }
            Message::PushReply(reply) => {
                let mut m = RecoveryMessages::new();
                for op in reply.replies {
                    self.handle_recovery_push_reply(&op, reply.from, &mut m);
                }
                self.dispatch_recovery_messages(m, 0);
                true
            }
        }
    }

    /// Dispatch one completion event posted by a store callback.
    pub fn handle_event(&mut self, event: BackendEvent) {
        debug!(?event, "handling event");
        match event {
            BackendEvent::SubWriteApplied { tid, at_version } => {
                self.sub_write_applied(tid, at_version);
            }
            BackendEvent::SubWriteCommitted {
                tid,
                at_version,
                last_complete,
            } => {
                self.sub_write_committed(tid, at_version, last_complete);
            }
            BackendEvent::FinishReadOp { tid } => {
                let Some(rop) = self.tid_to_read_map.remove(&tid) else {
                    return;
                };
                let priority = rop.priority;
                let mut m = RecoveryMessages::new();
                self.complete_read_op(rop, &mut m);
                self.dispatch_recovery_messages(m, priority);
            }
        }
    }

    fn handle_preheat(&mut self, op: &EcRead) {
        for (oid, extents) in &op.to_read {
            for &(offset, len, _flags) in extents {
                let gh = self.local_object(oid);
                match self.store.read(&gh, offset, len) {
                    Ok(bl) => debug!(oid = %gh, offset, warmed = bl.len(), "preheat read"),
                    Err(e) => warn!(oid = %gh, offset, error = %e, "preheat read failed"),
                }
            }
        }
    }

    // =========================================================================
    // Metadata Registries
    // =========================================================================

    /// The running hash state for `oid`, from cache or the on-disk xattr.
    ///
    /// Fails if the object exists with data but carries no hash attribute
    /// (the object is unreadable garbage at that point).
    pub fn get_hash_info(&self, oid: &ObjectId) -> Result<HashInfoRef> {
        if let Some(hit) = self.unstable_hashinfo_registry.lookup(oid) {
            return Ok(hit);
        }
        debug!(oid = %oid, "hash info not in cache");
        let gh = self.local_object(oid);
        let size = self.store.stat(&gh)?;
        let mut hinfo = HashInfo::new(self.codec.chunk_count());
        if let Some(size) = size {
            if size > 0 {
                let bl = self.store.getattr(&gh, HINFO_KEY)?.ok_or_else(|| {
                    Error::MetadataDecode {
                        kind: "HashInfo",
                        reason: format!("{} has data but no {} attr", gh, HINFO_KEY),
                    }
                })?;
                hinfo = HashInfo::decode(bl)?;
            }
        }
        Ok(self
            .unstable_hashinfo_registry
            .lookup_or_create(oid.clone(), Arc::new(RwLock::new(hinfo))))
    }

    /// The compaction index for `oid`, from cache or the on-disk xattr.
    ///
    /// When `size_check_error` is provided, a mismatch between the
    /// recorded compressed size and the stored object size is reported
    /// through it instead of aborting.
    pub fn get_compact_info(
        &self,
        oid: &ObjectId,
        mut size_check_error: Option<&mut bool>,
    ) -> Result<CompactInfoRef> {
        if let Some(hit) = self.unstable_compactinfo_registry.lookup(oid) {
            return Ok(hit);
        }
        debug!(oid = %oid, "compact info not in cache");
        let gh = self.local_object(oid);
        let size = self.store.stat(&gh)?;
        let mut cinfo = CompactInfo::new(
            self.codec.chunk_count(),
            self.sinfo.stripe_width() as u32,
            self.sinfo.chunk_size() as u32,
        );
        if let Some(size) = size {
            if size > 0 {
                let bl = self.store.getattr(&gh, CINFO_KEY)?.ok_or_else(|| {
                    Error::MetadataDecode {
                        kind: "CompactInfo",
                        reason: format!("{} has data but no {} attr", gh, CINFO_KEY),
                    }
                })?;
                cinfo = CompactInfo::decode(bl)?;
                let shard = self.listener.whoami().shard;
                let mismatch = cinfo.total_chunk_size(shard) != size;
                match size_check_error.as_deref_mut() {
                    Some(err) => {
                        *err = mismatch;
                        if mismatch {
                            return Err(Error::MetadataDecode {
                                kind: "CompactInfo",
                                reason: format!(
                                    "{} compressed size {} does not match stored size {}",
                                    gh,
                                    cinfo.total_chunk_size(shard),
                                    size
                                ),
                            });
                        }
                    }
                    None => assert!(
                        !mismatch,
                        "{} compact info does not match on-disk size",
                        gh
                    ),
                }
            }
        }
        Ok(self
            .unstable_compactinfo_registry
            .lookup_or_create(oid.clone(), Arc::new(RwLock::new(cinfo))))
    }

    /// User-visible attributes: everything except the two metadata keys.
    pub fn objects_get_attrs(&self, oid: &ObjectId) -> Result<Attrs> {
        let mut attrs = self.store.getattrs(&self.local_object(oid))?;
        attrs.retain(|k, _| !metadata::is_hinfo_key(k) && !metadata::is_cinfo_key(k));
        Ok(attrs)
    }

    /// Undo an append by truncating back to the chunk offset of the old
    /// stripe-aligned logical size.
    pub fn rollback_append(
        &self,
        oid: &ObjectId,
        old_size: u64,
        txn: &mut crate::store::Transaction,
    ) {
        assert_eq!(old_size % self.sinfo.stripe_width(), 0);
        txn.truncate(
            self.local_object(oid),
            self.sinfo.aligned_logical_offset_to_chunk_offset(old_size),
        );
    }

    // =========================================================================
    // Topology Changes
    // =========================================================================

    /// The placement group changed (new interval): drop all in-flight
    /// tracking. Callbacks are dropped unfired.
    pub fn on_change(&mut self) {
        debug!(
            writing = self.writing.len(),
            writes = self.tid_to_op_map.len(),
            client_reads = self.in_progress_client_reads.len(),
            read_sources = self.shard_to_read_map.len(),
            recovery_ops = self.recovery_ops.len(),
            "on_change: dropping in-flight state"
        );
        self.writing.clear();
        self.tid_to_op_map.clear();
        self.tid_to_read_map.clear();
        self.in_progress_client_reads.clear();
        self.shard_to_read_map.clear();
        self.clear_recovery_state();
    }

    pub fn clear_recovery_state(&mut self) {
        debug!(recovery_ops = self.recovery_ops.len(), "clearing recovery state");
        self.recovery_ops.clear();
    }

    pub fn on_flushed(&mut self) {}

    /// Objects with a recovery pull currently in flight (diagnostics).
    pub fn recovery_snapshot(&self) -> Vec<ObjectId> {
        self.recovery_ops.keys().cloned().collect()
    }

    /// Counts of in-flight state (diagnostics and tests).
    pub fn inflight_snapshot(&self) -> InflightSnapshot {
        InflightSnapshot {
            writes: self.tid_to_op_map.len(),
            reads: self.tid_to_read_map.len(),
            client_reads: self.in_progress_client_reads.len(),
            recovery_ops: self.recovery_ops.len(),
        }
    }
}

/// Snapshot of the backend's in-flight operation counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightSnapshot {
    pub writes: usize,
    pub reads: usize,
    pub client_reads: usize,
    pub recovery_ops: usize,
}
