//! Write engine
//!
//! The primary expands a client write into per-shard sub-writes and
//! tracks a two-phase completion: `on_all_applied` fires when every
//! shard has made the write readable, `on_all_commit` when every shard
//! has made it durable. Writes on a group complete in submission order.
//!
//! Rollback metadata: any log entry that appends gets the pre-write
//! encodings of the object's hash and compaction metadata stashed in
//! front of its rollback description, so the entry can be undone.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::messages::{
    must_prepend_hash_info, EcWrite, EcWriteReply, LogEntry, Message, PgStats,
};
use crate::metadata::{CompactInfoRef, HashInfoRef, CINFO_KEY, HINFO_KEY};
use crate::store::{Completion, Transaction};
use crate::types::{ObjectId, PgShard, ReqId, ShardId, Tid, Version};

use super::{BackendEvent, EcBackend, EcTransaction};

/// Primary-side record of one in-flight write.
pub(crate) struct WriteOp {
    pub tid: Tid,
    pub hoid: ObjectId,
    pub version: Version,
    pub trim_to: Version,
    pub trim_rollback_to: Version,
    pub reqid: ReqId,
    pub log_entries: Vec<LogEntry>,
    pub hit_set_history: Option<Bytes>,

    pub on_local_applied_sync: Option<Completion>,
    pub on_all_applied: Option<Completion>,
    pub on_all_commit: Option<Completion>,

    pub pending_apply: BTreeSet<PgShard>,
    pub pending_commit: BTreeSet<PgShard>,

    pub unstable_hash_infos: BTreeMap<ObjectId, HashInfoRef>,
    pub unstable_compact_infos: BTreeMap<ObjectId, CompactInfoRef>,

    pub temp_added: BTreeSet<ObjectId>,
    pub temp_cleared: BTreeSet<ObjectId>,

    pub txn: EcTransaction,
    pub start: Instant,
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOp")
            .field("tid", &self.tid)
            .field("hoid", &self.hoid)
            .field("version", &self.version)
            .field("pending_apply", &self.pending_apply)
            .field("pending_commit", &self.pending_commit)
            .finish()
    }
}

impl EcBackend {
    // =========================================================================
    // Submission
    // =========================================================================

    /// Accept one client write for `hoid` at `at_version`.
    ///
    /// `on_all_applied` and `on_all_commit` fire exactly once each when
    /// the corresponding phase drains on every shard.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(oid = %hoid, tid, version = %at_version))]
    pub fn submit_transaction(
        &mut self,
        hoid: ObjectId,
        at_version: Version,
        txn: EcTransaction,
        trim_to: Version,
        trim_rollback_to: Version,
        mut log_entries: Vec<LogEntry>,
        hit_set_history: Option<Bytes>,
        on_local_applied_sync: Option<Completion>,
        on_all_applied: Option<Completion>,
        on_all_commit: Option<Completion>,
        tid: Tid,
        reqid: ReqId,
    ) {
        assert!(!self.tid_to_op_map.contains_key(&tid));

        let mut unstable_hash_infos = BTreeMap::new();
        let mut unstable_compact_infos = BTreeMap::new();
        for oid in txn.get_append_objects() {
            let hinfo = self.get_hash_info(&oid).unwrap_or_else(|e| {
                panic!("no hash info for {} and no way to recover: {}", oid, e)
            });
            let cinfo = self.get_compact_info(&oid, None).unwrap_or_else(|e| {
                panic!("no compact info for {} and no way to recover: {}", oid, e)
            });
            assert_eq!(
                hinfo.read().total_chunk_size(),
                cinfo.read().total_origin_chunk_size()
            );
            self.unstable_hashinfo_registry
                .pin(oid.clone(), hinfo.clone());
            self.unstable_compactinfo_registry
                .pin(oid.clone(), cinfo.clone());
            unstable_hash_infos.insert(oid.clone(), hinfo);
            unstable_compact_infos.insert(oid, cinfo);
        }

        // Stash the pre-write metadata in front of any appending entry's
        // rollback description.
        for entry in &mut log_entries {
            if !must_prepend_hash_info(&entry.mod_desc) {
                continue;
            }
            debug!(entry_oid = %entry.oid, "stashing metadata for rollback");
            let hinfo = unstable_hash_infos
                .get(&entry.oid)
                .expect("appending entry without resolved hash info");
            let cinfo = unstable_compact_infos
                .get(&entry.oid)
                .expect("appending entry without resolved compact info");
            let mut old_attrs: BTreeMap<String, Option<Bytes>> = BTreeMap::new();
            old_attrs.insert(HINFO_KEY.to_string(), Some(hinfo.read().encode()));
            old_attrs.insert(CINFO_KEY.to_string(), Some(cinfo.read().encode()));
            entry.mod_desc.prepend_rollback_attrs(old_attrs);
            assert!(entry.mod_desc.can_rollback());
        }

        let op = WriteOp {
            tid,
            hoid,
            version: at_version,
            trim_to,
            trim_rollback_to,
            reqid,
            log_entries,
            hit_set_history,
            on_local_applied_sync,
            on_all_applied,
            on_all_commit,
            pending_apply: BTreeSet::new(),
            pending_commit: BTreeSet::new(),
            unstable_hash_infos,
            unstable_compact_infos,
            temp_added: BTreeSet::new(),
            temp_cleared: BTreeSet::new(),
            txn,
            start: Instant::now(),
        };
        self.tid_to_op_map.insert(tid, op);
        self.start_write(tid);
        self.writing.push_back(tid);
    }

    fn start_write(&mut self, tid: Tid) {
        let participants = self.listener.acting_backfill_shards();
        let mut trans: BTreeMap<ShardId, Transaction> = participants
            .iter()
            .map(|s| (s.shard, Transaction::new()))
            .collect();

        let op = self.tid_to_op_map.get_mut(&tid).expect("write op vanished");
        let mut temp_added = BTreeSet::new();
        let mut temp_cleared = BTreeSet::new();
        op.txn
            .generate_transactions(
                &op.unstable_hash_infos,
                &op.unstable_compact_infos,
                self.codec.as_ref(),
                &self.sinfo,
                &mut trans,
                &mut temp_added,
                &mut temp_cleared,
            )
            .unwrap_or_else(|e| panic!("write {} could not be encoded: {}", tid, e));
        op.temp_added = temp_added;
        op.temp_cleared = temp_cleared;
        op.pending_apply = participants.clone();
        op.pending_commit = participants.clone();

        let whoami = self.listener.whoami();
        let mut local: Option<(EcWrite, Option<Completion>)> = None;
        // Borrow of the op ends here; collect the messages first.
        let mut remote: Vec<(PgShard, EcWrite)> = Vec::new();
        for peer in &participants {
            let shard_txn = trans.get(&peer.shard).expect("participant without txn");
            let should_send = self.listener.should_send_op(*peer, &op.hoid);
            let sop = EcWrite {
                from: whoami,
                tid: op.tid,
                reqid: op.reqid,
                oid: op.hoid.clone(),
                stats: PgStats::default(),
                txn: if should_send {
                    shard_txn.clone()
                } else {
                    Transaction::new()
                },
                at_version: op.version,
                trim_to: op.trim_to,
                trim_rollback_to: op.trim_rollback_to,
                log_entries: op.log_entries.clone(),
                hit_set_history: op.hit_set_history.clone(),
                temp_added: op.temp_added.clone(),
                temp_removed: op.temp_cleared.clone(),
            };
            if *peer == whoami {
                local = Some((sop, op.on_local_applied_sync.take()));
            } else {
                remote.push((*peer, sop));
            }
        }
        debug!(tid, peers = remote.len(), "starting write");
        for (peer, sop) in remote {
            self.listener.send_message(peer.node, Message::Write(sop));
        }
        if let Some((sop, on_local_applied_sync)) = local {
            self.handle_sub_write(sop, on_local_applied_sync);
        }
    }

    // =========================================================================
    // Sub-Write (every shard)
    // =========================================================================

    /// Install one shard's slice of a write into the local store.
    #[instrument(skip_all, fields(oid = %op.oid, tid = op.tid))]
    pub fn handle_sub_write(&mut self, mut op: EcWrite, on_local_applied_sync: Option<Completion>) {
        let whoami = self.listener.whoami();
        if !op.temp_added.is_empty() {
            self.temp_contents.extend(op.temp_added.iter().cloned());
        }
        let mut localt = Transaction::new();
        if op.txn.is_empty() {
            for oid in &op.temp_removed {
                debug!(oid = %oid, "removing temp object; no transaction will follow");
                localt.remove(crate::types::GhObjectId::new(oid.clone(), whoami.shard));
            }
        }
        for oid in &op.temp_removed {
            self.temp_contents.remove(oid);
        }
        self.listener.log_operation(
            &op.log_entries,
            op.trim_to,
            op.trim_rollback_to,
            !op.txn.is_empty(),
        );

        // Parity chunks are rarely read back; hint the store unless the
        // group is undersized and this shard may serve degraded reads.
        if !self.listener.is_undersized()
            && whoami.shard.index() >= self.codec.data_chunk_count()
        {
            op.txn.set_fadvise_dontneed();
        }
        localt.append(op.txn);

        let events = self.events.clone();
        let tid = op.tid;
        let at_version = op.at_version;
        let last_complete = self.listener.last_complete();
        let on_applied: Completion = Box::new(move || {
            if let Some(sync_cb) = on_local_applied_sync {
                sync_cb();
            }
            let _ = events.send(BackendEvent::SubWriteApplied { tid, at_version });
        });
        let events = self.events.clone();
        let on_commit: Completion = Box::new(move || {
            let _ = events.send(BackendEvent::SubWriteCommitted {
                tid,
                at_version,
                last_complete,
            });
        });
        self.store
            .queue_transaction(localt, Some(on_applied), Some(on_commit));
    }

    /// Local sub-write became readable: ack the primary (possibly us).
    pub(crate) fn sub_write_applied(&mut self, tid: Tid, at_version: Version) {
        self.listener.op_applied(at_version);
        let whoami = self.listener.whoami();
        let reply = EcWriteReply {
            from: whoami,
            tid,
            last_complete: Version::default(),
            committed: false,
            applied: true,
        };
        if self.listener.is_primary() {
            self.handle_sub_write_reply(whoami, &reply);
        } else {
            self.listener
                .send_message(self.listener.primary_shard().node, Message::WriteReply(reply));
        }
    }

    /// Local sub-write became durable: ack the primary (possibly us).
    pub(crate) fn sub_write_committed(
        &mut self,
        tid: Tid,
        _at_version: Version,
        last_complete: Version,
    ) {
        let whoami = self.listener.whoami();
        let reply = EcWriteReply {
            from: whoami,
            tid,
            last_complete,
            committed: true,
            applied: false,
        };
        if self.listener.is_primary() {
            self.handle_sub_write_reply(whoami, &reply);
        } else {
            self.listener.update_last_complete_ondisk(last_complete);
            self.listener
                .send_message(self.listener.primary_shard().node, Message::WriteReply(reply));
        }
    }

    // =========================================================================
    // Replies (primary)
    // =========================================================================

    /// Fold one shard's apply/commit acknowledgement into the write.
    pub fn handle_sub_write_reply(&mut self, from: PgShard, reply: &EcWriteReply) {
        let op = self
            .tid_to_op_map
            .get_mut(&reply.tid)
            .expect("sub-write reply for unknown tid");
        if reply.committed {
            assert!(op.pending_commit.remove(&from));
            if from != self.listener.whoami() {
                self.listener
                    .update_peer_last_complete_ondisk(from, reply.last_complete);
            }
        }
        if reply.applied {
            assert!(op.pending_apply.remove(&from));
        }
        self.check_op(reply.tid);
    }

    /// Fire completion callbacks whose phases have drained; retire the
    /// op once both have (writes retire in submission order).
    fn check_op(&mut self, tid: Tid) {
        let op = self.tid_to_op_map.get_mut(&tid).expect("write op vanished");
        if op.pending_apply.is_empty() {
            if let Some(cb) = op.on_all_applied.take() {
                debug!(tid, elapsed = ?op.start.elapsed(), "all applied");
                cb();
            }
        }
        let op = self.tid_to_op_map.get_mut(&tid).expect("write op vanished");
        if op.pending_commit.is_empty() {
            if let Some(cb) = op.on_all_commit.take() {
                debug!(tid, elapsed = ?op.start.elapsed(), "all committed");
                cb();
            }
        }
        let op = self.tid_to_op_map.get_mut(&tid).expect("write op vanished");
        if op.pending_apply.is_empty() && op.pending_commit.is_empty() {
            assert_eq!(self.writing.front(), Some(&tid));
            self.writing.pop_front();
            let op = self.tid_to_op_map.remove(&tid).unwrap();
            debug!(tid, "write complete");
            self.unstable_hashinfo_registry.clear_pinned(&op.hoid);
            self.unstable_compactinfo_registry.clear_pinned(&op.hoid);
        }
    }
}
