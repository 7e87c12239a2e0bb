//! Recovery engine
//!
//! Pull-style repair of an object missing on one or more shards. The
//! primary reads a chunk's worth of the object from the minimum healthy
//! sources, erasure-decodes the missing shards' chunk streams,
//! recompresses them so the target's on-disk form matches its peers, and
//! pushes the bytes out. Each object advances through
//! IDLE -> READING -> WRITING rounds until the cursor passes the object
//! size.
//!
//! All pushes, push-replies, recovery reads, and local transactions
//! produced while handling one inbound message are batched in
//! [`RecoveryMessages`] and dispatched together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::codec;
use crate::compress;
use crate::listener::ObjectContextRef;
use crate::messages::{
    Message, PgPush, PgPushReply, PushOp, PushReplyOp, RecoveryInfo, RecoveryProgress,
};
use crate::metadata::{
    CompactInfo, CompactInfoRef, HashInfo, HashInfoRef, CINFO_KEY, HINFO_KEY,
};
use crate::store::Transaction;
use crate::types::{Attrs, GhObjectId, ObjectId, PgShard, ShardId, Version};

use super::read::{ReadCompletion, ReadRequest, ReadResult};
use super::EcBackend;

// =============================================================================
// Recovery Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryState {
    Idle,
    Reading,
    Writing,
    #[allow(dead_code)]
    Complete,
}

/// Per-object pull state.
pub(crate) struct RecoveryOp {
    pub hoid: ObjectId,
    pub v: Version,
    pub missing_on: BTreeSet<PgShard>,
    pub missing_on_shards: BTreeSet<ShardId>,
    pub recovery_info: RecoveryInfo,
    pub recovery_progress: RecoveryProgress,
    pub state: RecoveryState,
    pub obc: Option<ObjectContextRef>,
    pub hinfo: Option<HashInfoRef>,
    pub cinfo: Option<CompactInfoRef>,
    pub xattrs: Attrs,
    pub returned_data: BTreeMap<ShardId, Bytes>,
    /// (offset, length) of the last recovery read, in logical bytes.
    pub extent_requested: (u64, u64),
    pub waiting_on_pushes: BTreeSet<PgShard>,
}

impl std::fmt::Debug for RecoveryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOp")
            .field("hoid", &self.hoid)
            .field("v", &self.v)
            .field("missing_on", &self.missing_on)
            .field("state", &self.state)
            .field("progress", &self.recovery_progress)
            .field("extent_requested", &self.extent_requested)
            .field("waiting_on_pushes", &self.waiting_on_pushes)
            .finish()
    }
}

/// Opaque container of recovery ops built up by [`EcBackend::recover_object`]
/// and executed by [`EcBackend::run_recovery_op`].
#[derive(Default)]
pub struct RecoveryHandle {
    ops: Vec<RecoveryOp>,
}

/// Outbound work batched while handling one message.
pub(crate) struct RecoveryMessages {
    pub reads: BTreeMap<ObjectId, ReadRequest>,
    pub pushes: BTreeMap<PgShard, Vec<PushOp>>,
    pub push_replies: BTreeMap<PgShard, Vec<PushReplyOp>>,
    pub txn: Transaction,
}

impl RecoveryMessages {
    pub fn new() -> Self {
        Self {
            reads: BTreeMap::new(),
            pushes: BTreeMap::new(),
            push_replies: BTreeMap::new(),
            txn: Transaction::new(),
        }
    }
}

impl EcBackend {
    /// Open a fresh batch of recovery work.
    pub fn open_recovery_op(&self) -> RecoveryHandle {
        RecoveryHandle::default()
    }

    /// The logical bytes recovered per round, rounded up to a stripe.
    fn recovery_chunk_size(&self) -> u64 {
        self.sinfo
            .logical_to_next_stripe_offset(self.cfg.recovery_max_chunk)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Enqueue a pull of `hoid` at version `v` onto `handle`. The shards
    /// missing the object are read off the group's per-shard missing
    /// sets.
    pub fn recover_object(
        &self,
        hoid: &ObjectId,
        v: Version,
        obc: Option<ObjectContextRef>,
        handle: &mut RecoveryHandle,
    ) {
        let mut op = RecoveryOp {
            hoid: hoid.clone(),
            v,
            missing_on: BTreeSet::new(),
            missing_on_shards: BTreeSet::new(),
            recovery_info: RecoveryInfo {
                oid: hoid.clone(),
                version: v,
                size: obc.as_ref().map_or(0, |o| o.size),
            },
            recovery_progress: RecoveryProgress {
                omap_complete: true,
                ..Default::default()
            },
            state: RecoveryState::Idle,
            obc,
            hinfo: None,
            cinfo: None,
            xattrs: Attrs::new(),
            returned_data: BTreeMap::new(),
            extent_requested: (0, 0),
            waiting_on_pushes: BTreeSet::new(),
        };
        for peer in self.listener.acting_backfill_shards() {
            debug!(peer = %peer, "checking shard for missing object");
            if self.listener.is_missing(peer, hoid) {
                op.missing_on.insert(peer);
                op.missing_on_shards.insert(peer.shard);
            }
        }
        debug!(op = ?op, "built recovery op");
        handle.ops.push(op);
    }

    /// Install and start every op in `handle`, then dispatch the
    /// generated messages.
    pub fn run_recovery_op(&mut self, handle: RecoveryHandle, priority: u8) {
        let mut m = RecoveryMessages::new();
        for op in handle.ops {
            debug!(op = ?op, "starting recovery");
            let hoid = op.hoid.clone();
            assert!(!self.recovery_ops.contains_key(&hoid));
            self.recovery_ops.insert(hoid.clone(), op);
            self.continue_recovery_op(&hoid, &mut m);
        }
        self.dispatch_recovery_messages(m, priority);
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    #[instrument(skip_all, fields(oid = %hoid))]
    pub(crate) fn continue_recovery_op(&mut self, hoid: &ObjectId, m: &mut RecoveryMessages) {
        let mut op = self
            .recovery_ops
            .remove(hoid)
            .expect("continuing recovery op that is not installed");
        debug!(op = ?op, "continuing");
        loop {
            match op.state {
                RecoveryState::Idle => {
                    op.state = RecoveryState::Reading;
                    assert!(!op.recovery_progress.data_complete);
                    let want: BTreeSet<usize> =
                        op.missing_on_shards.iter().map(|s| s.index()).collect();
                    let to_read = match self.get_min_avail_to_read_shards(hoid, &want, true) {
                        Ok(shards) => shards,
                        Err(e) => {
                            // We must have lost a recovery source.
                            assert!(!op.recovery_progress.first);
                            warn!(oid = %hoid, error = %e, "canceling recovery: no sources");
                            self.listener.cancel_pull(hoid);
                            return; // op dropped, not reinstalled
                        }
                    };
                    self.queue_recovery_read(
                        m,
                        hoid,
                        op.recovery_progress.data_recovered_to,
                        self.recovery_chunk_size(),
                        &to_read,
                        op.recovery_progress.first,
                        op.cinfo.clone(),
                    );
                    debug!(to_read = ?to_read, "recovery read queued");
                    self.recovery_ops.insert(hoid.clone(), op);
                    return;
                }
                RecoveryState::Reading => {
                    // Read completed; push the decoded chunk out.
                    assert!(!op.xattrs.is_empty());
                    assert!(!op.returned_data.is_empty());
                    op.state = RecoveryState::Writing;
                    let obc = op.obc.as_ref().expect("recovery without object context");
                    let mut after_progress = op.recovery_progress;
                    after_progress.data_recovered_to += op.extent_requested.1;
                    after_progress.first = false;
                    if after_progress.data_recovered_to >= obc.size {
                        after_progress.data_recovered_to =
                            self.sinfo.logical_to_next_stripe_offset(obc.size);
                        after_progress.data_complete = true;
                    }
                    for target in &op.missing_on {
                        let pop = self.build_push(&op, *target, &after_progress);
                        if *target != self.listener.primary_shard() {
                            self.listener.begin_peer_recover(*target, hoid);
                        }
                        m.pushes.entry(*target).or_default().push(pop);
                    }
                    op.returned_data.clear();
                    op.waiting_on_pushes = op.missing_on.clone();
                    op.recovery_progress = after_progress;
                    debug!(op = ?op, "pushes built");
                    self.recovery_ops.insert(hoid.clone(), op);
                    return;
                }
                RecoveryState::Writing => {
                    if !op.waiting_on_pushes.is_empty() {
                        self.recovery_ops.insert(hoid.clone(), op);
                        return;
                    }
                    if op.recovery_progress.data_complete {
                        op.state = RecoveryState::Complete;
                        for peer in &op.missing_on {
                            if *peer != self.listener.primary_shard() {
                                debug!(peer = %peer, "peer recovered");
                                self.listener.on_peer_recover(*peer, hoid, &op.recovery_info);
                            }
                        }
                        self.listener.on_global_recover(hoid);
                        debug!(op = ?op, "recovery complete");
                        return; // op retired
                    }
                    op.state = RecoveryState::Idle;
                }
                RecoveryState::Complete => {
                    unreachable!("recovery op continued after completion");
                }
            }
        }
    }

    /// Build the push for one missing target: recompress the decoded
    /// chunk stream, verify the new cumulative ends against the
    /// authoritative index, and wrap it all up with the progress cursor.
    fn build_push(
        &self,
        op: &RecoveryOp,
        target: PgShard,
        after_progress: &RecoveryProgress,
    ) -> PushOp {
        let shard = target.shard;
        let data = op
            .returned_data
            .get(&shard)
            .expect("no decoded data for missing shard")
            .clone();
        let hinfo = op.hinfo.as_ref().expect("recovery without hash info");
        let cinfo = op.cinfo.as_ref().expect("recovery without compact info");
        let index = cinfo.read();
        let obc = op.obc.as_ref().expect("recovery without object context");

        let whole_object =
            op.recovery_progress.data_recovered_to == 0 && after_progress.data_complete;
        if whole_object {
            let mut hasher = crc32fast::Hasher::new_with_initial(u32::MAX);
            hasher.update(&data);
            let crc = hasher.finalize();
            assert_eq!(
                crc,
                hinfo.read().chunk_hash(shard),
                "decoded shard {} does not match its recorded hash",
                shard
            );
        }
        debug!(
            target = %target,
            before = ?op.recovery_progress,
            after = ?after_progress,
            len = data.len(),
            size = obc.size,
            "building push"
        );
        assert_eq!(
            data.len() as u64,
            self.sinfo.aligned_logical_offset_to_chunk_offset(
                after_progress.data_recovered_to - op.recovery_progress.data_recovered_to
            )
        );

        // Recompress chunk by chunk so the target's on-disk form matches
        // its peers, continuing at the shard's compressed offset for this
        // round.
        let chunk_size = index.chunk_size() as usize;
        assert_eq!(data.len() % chunk_size, 0);
        let recovered_to = op.recovery_progress.data_recovered_to;
        assert_eq!(recovered_to % index.stripe_width() as u64, 0);
        let disk_offset = if recovered_to > 0 {
            let stripe_idx = (recovered_to / index.stripe_width() as u64) as usize;
            index.chunk_compact_range(shard)[stripe_idx - 1] as u64
        } else {
            0
        };
        let mut cursor = disk_offset as u32;
        let mut compact_ends = Vec::with_capacity(data.len() / chunk_size);
        let mut blob = BytesMut::new();
        for chunk in data.chunks(chunk_size) {
            let compressed = compress::compress_chunk(chunk)
                .unwrap_or_else(|e| panic!("recompression failed during recovery: {}", e));
            cursor += compressed.len() as u32;
            compact_ends.push(cursor);
            blob.extend_from_slice(&compressed);
        }
        let blob = blob.freeze();

        let mut pop = PushOp {
            oid: op.hoid.clone(),
            version: op.v,
            data: blob.clone(),
            data_included: Default::default(),
            compact_ends: compact_ends.clone(),
            attrset: Attrs::new(),
            recovery_info: op.recovery_info.clone(),
            before_progress: op.recovery_progress,
            after_progress: *after_progress,
        };
        if !blob.is_empty() {
            let source = index.chunk_compact_range(shard);
            debug!(
                shard = %shard,
                recovered_to,
                disk_offset,
                len = blob.len(),
                ends = ?compact_ends,
                authoritative = ?source,
                "recompressed push payload"
            );
            // The recompressed ends must already be known to the
            // authoritative index; anything else means the decode or the
            // index has drifted.
            assert!(
                compact_ends
                    .iter()
                    .all(|e| source.binary_search(e).is_ok()),
                "recompressed ends drifted from the compaction index"
            );
            index.compact_range_index(shard, disk_offset as u32 + blob.len() as u32);
            pop.data_included.insert(disk_offset, blob.len() as u64);
        }
        if op.recovery_progress.first {
            pop.attrset = op.xattrs.clone();
        }
        pop
    }

    // =========================================================================
    // Recovery Reads
    // =========================================================================

    /// Queue a recovery read of `[offset, offset+len)` from `need`,
    /// translated through the compaction index when one is known.
    #[allow(clippy::too_many_arguments)]
    fn queue_recovery_read(
        &self,
        m: &mut RecoveryMessages,
        hoid: &ObjectId,
        offset: u64,
        len: u64,
        need: &BTreeSet<PgShard>,
        want_attrs: bool,
        cinfo: Option<CompactInfoRef>,
    ) {
        let (chunk_off, chunk_len) = self.sinfo.aligned_offset_len_to_chunk(offset, len);
        let mut pg_need = Vec::with_capacity(need.len());
        for peer in need {
            let loc = match &cinfo {
                Some(cinfo) => {
                    let index = cinfo.read();
                    let (o, l) =
                        index.convert_compact_ranges(peer.shard, chunk_off as u32, chunk_len as u32);
                    (o as u64, l as u64)
                }
                None => (chunk_off, chunk_len),
            };
            pg_need.push((*peer, loc.0, loc.1));
        }
        assert!(!m.reads.contains_key(hoid));
        m.reads.insert(
            hoid.clone(),
            ReadRequest {
                to_read: vec![(offset, len, 0)],
                need: vec![pg_need],
                partial_read: vec![false],
                want_attrs,
                cinfo,
                completion: Some(ReadCompletion::RecoveryRead),
            },
        );
    }

    /// Every source's compressed begin offset must land exactly on a
    /// recorded chunk boundary, and the end must not precede it.
    fn read_reply_min_chunk(
        cinfo: &CompactInfo,
        need: &[(PgShard, u64, u64)],
    ) -> usize {
        let mut min_chunk = usize::MAX;
        for &(peer, offset, len) in need {
            let begin_chunk = cinfo.compact_range_index(peer.shard, offset as u32);
            let end_chunk = cinfo.compact_min_range_index(peer.shard, (offset + len) as u32);
            assert!(end_chunk >= begin_chunk);
            min_chunk = min_chunk.min(end_chunk);
        }
        assert_ne!(min_chunk, usize::MAX);
        min_chunk
    }

    /// A recovery read finished: decode the missing shards' chunk streams
    /// and advance the state machine.
    pub(crate) fn handle_recovery_read_complete(
        &mut self,
        hoid: &ObjectId,
        mut result: ReadResult,
        m: &mut RecoveryMessages,
    ) {
        assert_eq!(result.r, 0);
        assert!(result.errors.is_empty());
        assert_eq!(result.returned.len(), 1);
        let range = result.returned.pop_front().unwrap();
        let need = result.need.pop().expect("recovery read without need");
        debug!(oid = %hoid, offset = range.offset, len = range.len, "recovery read returned");

        let mut op = self
            .recovery_ops
            .remove(hoid)
            .expect("recovery read for uninstalled op");
        assert!(op.returned_data.is_empty());

        let mut from: BTreeMap<ShardId, Bytes> = BTreeMap::new();
        for (peer, bl) in range.buffers {
            from.insert(peer.shard, bl);
        }

        if let Some(attrs) = result.attrs.take() {
            op.xattrs = attrs;
            if op.obc.is_none() {
                let obc = self.listener.object_context(hoid, &op.xattrs);
                op.recovery_info.size = obc.size;
                op.obc = Some(obc);
            }
            let obc = op.obc.as_ref().unwrap();

            let mut hinfo = HashInfo::new(self.codec.chunk_count());
            if obc.size > 0 {
                let bl = op
                    .xattrs
                    .get(HINFO_KEY)
                    .expect("recovering a sized object with no hash attr");
                hinfo = HashInfo::decode(bl.clone())
                    .unwrap_or_else(|e| panic!("undecodable hash info on {}: {}", hoid, e));
            }
            op.hinfo = Some(
                self.unstable_hashinfo_registry
                    .lookup_or_create(hoid.clone(), Arc::new(RwLock::new(hinfo))),
            );

            let mut cinfo = CompactInfo::new(
                self.codec.chunk_count(),
                self.sinfo.stripe_width() as u32,
                self.sinfo.chunk_size() as u32,
            );
            if obc.size > 0 {
                let bl = op
                    .xattrs
                    .get(CINFO_KEY)
                    .expect("recovering a sized object with no compact attr");
                cinfo = CompactInfo::decode(bl.clone())
                    .unwrap_or_else(|e| panic!("undecodable compact info on {}: {}", hoid, e));
            }
            op.cinfo = Some(
                self.unstable_compactinfo_registry
                    .lookup_or_create(hoid.clone(), Arc::new(RwLock::new(cinfo))),
            );
        }

        let cinfo = op.cinfo.clone().expect("recovery read without compact info");
        let index = cinfo.read();
        Self::read_reply_min_chunk(&index, &need);

        // Decompress each source, tolerating a short tail, then truncate
        // everything to the shortest source so the decode sees uniform
        // chunk streams.
        let mut min_chunk_size = u64::MAX;
        for &(peer, offset, len) in &need {
            let src = from.remove(&peer.shard).unwrap_or_default();
            let decompressed = index
                .decompact(peer.shard, offset as u32, len as u32, &src, false)
                .unwrap_or_else(|e| panic!("source {} returned undecodable data: {}", peer, e));
            min_chunk_size = min_chunk_size.min(decompressed.len() as u64);
            from.insert(peer.shard, decompressed);
        }
        assert_ne!(min_chunk_size, u64::MAX);
        for bl in from.values_mut() {
            *bl = bl.slice(0..min_chunk_size as usize);
        }

        let targets: BTreeSet<ShardId> = op.missing_on_shards.iter().copied().collect();
        op.returned_data =
            codec::decode_stripes_into(&self.sinfo, self.codec.as_ref(), &from, &targets)
                .unwrap_or_else(|e| panic!("recovery decode failed for {}: {}", hoid, e));

        op.extent_requested = (
            op.recovery_progress.data_recovered_to,
            self.sinfo.stripe_width() / self.sinfo.chunk_size() * min_chunk_size,
        );
        debug!(
            oid = %hoid,
            min_chunk_size,
            extent = ?op.extent_requested,
            "recovery read decoded"
        );
        assert!(!op.xattrs.is_empty());
        assert!(op.obc.is_some());
        drop(index);
        self.recovery_ops.insert(hoid.clone(), op);
        self.continue_recovery_op(hoid, m);
    }

    // =========================================================================
    // Push Handling (target side)
    // =========================================================================

    /// Apply one inbound push: stage the bytes (temp object unless the
    /// whole recovery fits one round), install attributes on the first
    /// round, and move the object into place once complete.
    #[instrument(skip_all, fields(oid = %op.oid))]
    pub(crate) fn handle_recovery_push(&mut self, op: PushOp, m: &mut RecoveryMessages) {
        let whoami = self.listener.whoami();
        let oneshot = op.before_progress.first && op.after_progress.data_complete;
        let canonical = GhObjectId::new(op.oid.to_canonical(), whoami.shard);
        let staging = if oneshot {
            canonical.clone()
        } else {
            GhObjectId::new(op.oid.to_temp(), whoami.shard)
        };

        if op.before_progress.first {
            self.listener.on_local_recover_start(&op.oid, &mut m.txn);
            m.txn
                .remove(GhObjectId::new(op.oid.to_temp(), whoami.shard));
            m.txn.touch(staging.clone());
        }

        if !op.data_included.is_empty() {
            let start = op.data_included.range_start();
            let end = op.data_included.range_end();
            assert_eq!(op.data.len() as u64, end - start);
            m.txn.write(staging.clone(), start, op.data.clone());
        } else {
            assert!(op.data.is_empty());
        }

        if op.before_progress.first {
            if !oneshot {
                self.temp_contents.insert(op.oid.to_temp());
            }
            if op.recovery_info.size > 0 {
                assert!(op.attrset.contains_key(HINFO_KEY));
            }
            m.txn.setattrs(staging.clone(), op.attrset.clone());
            // The pushed index is authoritative; every per-push end must
            // already be recorded in it.
            if let Some(bl) = op.attrset.get(CINFO_KEY) {
                let cinfo = CompactInfo::decode(bl.clone())
                    .unwrap_or_else(|e| panic!("pushed compact info undecodable: {}", e));
                let source = cinfo.chunk_compact_range(whoami.shard);
                assert!(
                    op.compact_ends
                        .iter()
                        .all(|e| source.binary_search(e).is_ok()),
                    "pushed ends missing from the authoritative index"
                );
                self.unstable_compactinfo_registry
                    .lookup_or_create(op.oid.to_canonical(), Arc::new(RwLock::new(cinfo)));
            }
        }

        if op.after_progress.data_complete && !oneshot {
            self.temp_contents.remove(&op.oid.to_temp());
            m.txn.move_from_temp(canonical);
        }
        if op.after_progress.data_complete {
            if self.listener.is_primary() {
                let rop = self
                    .recovery_ops
                    .get(&op.oid)
                    .expect("push completion for uninstalled recovery op");
                let obc = rop.obc.clone();
                assert!(obc.is_some());
                self.listener
                    .on_local_recover(&op.oid, &op.recovery_info, obc, &mut m.txn);
            } else {
                self.listener
                    .on_local_recover(&op.oid, &op.recovery_info, None, &mut m.txn);
            }
        }
        m.push_replies
            .entry(self.listener.primary_shard())
            .or_default()
            .push(PushReplyOp { oid: op.oid });
    }

    /// A target acknowledged a push; advance the op when all have.
    pub(crate) fn handle_recovery_push_reply(
        &mut self,
        op: &PushReplyOp,
        from: PgShard,
        m: &mut RecoveryMessages,
    ) {
        if !self.recovery_ops.contains_key(&op.oid) {
            return;
        }
        let rop = self.recovery_ops.get_mut(&op.oid).unwrap();
        assert!(rop.waiting_on_pushes.remove(&from));
        let hoid = op.oid.clone();
        self.continue_recovery_op(&hoid, m);
    }

    // =========================================================================
    // Batched Dispatch
    // =========================================================================

    /// Send the batched pushes, submit the batched transaction (emitting
    /// push-replies once it commits), and start the batched reads.
    pub(crate) fn dispatch_recovery_messages(&mut self, m: RecoveryMessages, priority: u8) {
        let whoami = self.listener.whoami();
        for (peer, pushes) in m.pushes {
            self.listener.send_message(
                peer.node,
                Message::Push(PgPush {
                    from: whoami,
                    pushes,
                }),
            );
        }
        if !m.push_replies.is_empty() || !m.txn.is_empty() {
            let listener = self.listener.clone();
            let replies = m.push_replies;
            let on_commit = Box::new(move || {
                for (peer, ops) in replies {
                    listener.send_message(
                        peer.node,
                        Message::PushReply(PgPushReply {
                            from: whoami,
                            replies: ops,
                        }),
                    );
                }
            });
            self.store.queue_transaction(m.txn, None, Some(on_commit));
        }
        if !m.reads.is_empty() {
            self.start_read_op(priority, m.reads);
        }
    }
}
