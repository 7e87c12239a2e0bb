//! Read engine
//!
//! Client reads fan out to a minimum set of shards (or every available
//! shard under `subread_all`), splice the compressed replies through the
//! compaction index, and either concatenate healthy chunks directly (the
//! partial-read fast path) or erasure-decode whole stripes. Recovery
//! reads ride the same machinery with a different completion.
//!
//! A peer going down cancels every object whose in-flight read depended
//! on it; the canceled callbacks are dropped unfired.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::listener::OsdMapView;
use crate::messages::{EcRead, EcReadReply, Message};
use crate::metadata::CompactInfoRef;
use crate::store::Completion;
use crate::types::{Attrs, ObjectId, PgShard, ShardId, Tid};

use super::recovery::RecoveryMessages;
use super::{BackendEvent, EcBackend};

const EIO: i32 = -5;

// =============================================================================
// Read Records
// =============================================================================

/// One client-requested extent and its completion callback.
pub struct ReadCall {
    pub offset: u64,
    pub len: u64,
    pub flags: u32,
    pub on_done: Option<Box<dyn FnOnce(Result<Bytes>) + Send>>,
}

impl ReadCall {
    pub fn new(
        offset: u64,
        len: u64,
        flags: u32,
        on_done: impl FnOnce(Result<Bytes>) + Send + 'static,
    ) -> Self {
        Self {
            offset,
            len,
            flags,
            on_done: Some(Box::new(on_done)),
        }
    }
}

impl std::fmt::Debug for ReadCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCall")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("flags", &self.flags)
            .finish()
    }
}

/// What to run when all replies for an object have arrived.
pub(crate) enum ReadCompletion {
    /// Decode and slice for the client calls, then retire the read status.
    ClientRead {
        status_id: u64,
        calls: Vec<ReadCall>,
    },
    /// Feed the recovery state machine.
    RecoveryRead,
}

/// Everything asked of the shards for one object.
pub(crate) struct ReadRequest {
    /// Stripe-widened (offset, len, flags) extents.
    pub to_read: Vec<(u64, u64, u32)>,
    /// Per extent: the (peer, compressed offset, compressed len) sub-reads.
    pub need: Vec<Vec<(PgShard, u64, u64)>>,
    /// Per extent: whether the fast path was taken.
    pub partial_read: Vec<bool>,
    pub want_attrs: bool,
    pub cinfo: Option<CompactInfoRef>,
    pub completion: Option<ReadCompletion>,
}

/// One extent's buffers as they arrive from the shards.
pub(crate) struct ReturnedRange {
    pub offset: u64,
    pub len: u64,
    pub buffers: BTreeMap<PgShard, Bytes>,
}

/// Accumulated reply state for one object.
pub(crate) struct ReadResult {
    /// First error code reported, zero if none.
    pub r: i32,
    pub errors: BTreeMap<PgShard, i32>,
    pub attrs: Option<Attrs>,
    pub returned: VecDeque<ReturnedRange>,
    pub need: Vec<Vec<(PgShard, u64, u64)>>,
    pub partial_read: Vec<bool>,
    pub cinfo: Option<CompactInfoRef>,
}

/// One in-flight fan-out read, keyed by tid.
pub(crate) struct ReadOp {
    pub tid: Tid,
    pub priority: u8,
    pub to_read: BTreeMap<ObjectId, ReadRequest>,
    pub complete: BTreeMap<ObjectId, ReadResult>,
    pub obj_to_source: BTreeMap<ObjectId, BTreeSet<PgShard>>,
    pub source_to_obj: BTreeMap<PgShard, BTreeSet<ObjectId>>,
    pub in_progress: BTreeSet<PgShard>,
    pub start: Instant,
}

impl std::fmt::Debug for ReadOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOp")
            .field("tid", &self.tid)
            .field("priority", &self.priority)
            .field("objects", &self.to_read.keys().collect::<Vec<_>>())
            .field("obj_to_source", &self.obj_to_source)
            .field("source_to_obj", &self.source_to_obj)
            .field("in_progress", &self.in_progress)
            .finish()
    }
}

/// Client read completion ordering: callbacks fire in submission order
/// even when later reads finish first.
pub(crate) struct ClientAsyncReadStatus {
    pub id: u64,
    pub complete: bool,
    pub on_complete: Option<Completion>,
}

impl EcBackend {
    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Synchronous reads are not supported by the EC backend.
    pub fn objects_read_sync(
        &self,
        _hoid: &ObjectId,
        _offset: u64,
        _len: u64,
        _flags: u32,
    ) -> Result<Bytes> {
        Err(Error::Unsupported("EC backends only serve async reads"))
    }

    /// Read one or more extents of `hoid`, invoking each call's callback
    /// with its bytes and `on_complete` once every call has finished.
    #[instrument(skip_all, fields(oid = %hoid, calls = calls.len()))]
    pub fn objects_read_async(
        &mut self,
        hoid: &ObjectId,
        calls: Vec<ReadCall>,
        on_complete: Option<Completion>,
    ) -> Result<()> {
        let status_id = self.next_client_read_id;
        self.next_client_read_id += 1;
        self.in_progress_client_reads.push_back(ClientAsyncReadStatus {
            id: status_id,
            complete: false,
            on_complete,
        });

        let want_to_read = self.data_chunk_want();
        let shards = match self.get_min_avail_to_read_shards(hoid, &want_to_read, false) {
            Ok(shards) => shards,
            Err(e) => {
                // Surface the codec failure; the status we just queued
                // must not wedge later reads.
                self.in_progress_client_reads.pop_back();
                return Err(e);
            }
        };
        let cinfo = self.get_compact_info(hoid, None).unwrap_or_else(|e| {
            panic!("no compact info for {} and no way to recover: {}", hoid, e)
        });

        let chunk_size = self.sinfo.chunk_size();
        let stripe_width = self.sinfo.stripe_width();
        let mut to_read = Vec::with_capacity(calls.len());
        let mut need = Vec::with_capacity(calls.len());
        let mut partial_read = Vec::with_capacity(calls.len());
        {
            let index = cinfo.read();
            for call in &calls {
                let (stripe_off, stripe_len) =
                    self.sinfo.offset_len_to_stripe_bounds(call.offset, call.len);
                to_read.push((stripe_off, stripe_len, call.flags));
                debug!(
                    offset = call.offset,
                    len = call.len,
                    threshold = stripe_width as f64 * self.cfg.partial_read_ratio,
                    "async read extent"
                );

                // Small reads may hit only the chunks' own shards and
                // skip the decode entirely, as long as every covered
                // chunk's shard is healthy.
                if call.len != 0
                    && ((call.offset % chunk_size == 0
                        && call.len as f64 <= stripe_width as f64 * self.cfg.partial_read_ratio)
                        || (call.len as f64
                            <= (stripe_width - chunk_size) as f64 * self.cfg.partial_read_ratio))
                {
                    if let Some(pg_need) = self.plan_partial_read(hoid, &index, call) {
                        assert!(pg_need.len() <= self.codec.data_chunk_count());
                        need.push(pg_need);
                        partial_read.push(true);
                        continue;
                    }
                }

                let (chunk_off, chunk_len) =
                    self.sinfo.aligned_offset_len_to_chunk(stripe_off, stripe_len);
                let mut pg_need = Vec::with_capacity(shards.len());
                for peer in &shards {
                    let (loc_off, loc_len) =
                        index.convert_compact_ranges(peer.shard, chunk_off as u32, chunk_len as u32);
                    pg_need.push((*peer, loc_off as u64, loc_len as u64));
                }
                need.push(pg_need);
                partial_read.push(false);
            }
        }

        let request = ReadRequest {
            to_read,
            need,
            partial_read,
            want_attrs: false,
            cinfo: Some(cinfo),
            completion: Some(ReadCompletion::ClientRead { status_id, calls }),
        };
        let mut for_read_op = BTreeMap::new();
        for_read_op.insert(hoid.clone(), request);
        self.start_read_op(0, for_read_op);
        Ok(())
    }

    /// Walk the chunks covered by `call`; if every one lives on a healthy
    /// shard, return the per-chunk sub-reads, else `None` (fall back to
    /// the full-stripe path).
    fn plan_partial_read(
        &self,
        hoid: &ObjectId,
        index: &crate::metadata::CompactInfo,
        call: &ReadCall,
    ) -> Option<Vec<(PgShard, u64, u64)>> {
        let chunk_size = self.sinfo.chunk_size();
        let stripe_width = self.sinfo.stripe_width();
        let mapping = self.codec.chunk_mapping();
        let (_, health_shards) = self.get_no_missing_read_shards(hoid);

        let mut offset = call.offset;
        let mut len = call.len;
        let mut pg_need = Vec::new();
        while len > 0 {
            let chunk_offset = offset / stripe_width * chunk_size;
            let shard_idx = (offset % stripe_width / chunk_size) as usize;
            let shard = ShardId::from(mapping.get(shard_idx).copied().unwrap_or(shard_idx));
            let r_len = len.min(chunk_size - offset % chunk_size);
            let Some(&peer) = health_shards.get(&shard) else {
                return None;
            };
            let (loc_off, loc_len) =
                index.convert_compact_ranges(shard, chunk_offset as u32, chunk_size as u32);
            debug!(peer = %peer, chunk_offset, r_len, loc_off, loc_len, "partial sub-read");
            pg_need.push((peer, loc_off as u64, loc_len as u64));
            len -= r_len;
            offset += r_len;
        }
        Some(pg_need)
    }

    /// Advisory prefetch: warm the covering shards' caches for one extent
    /// without returning data. The local shard reads nothing (its cache
    /// warms on the read proper).
    pub fn object_preheat(&mut self, hoid: &ObjectId, offset: u64, len: u64, flags: u32) -> Result<()> {
        let want_to_read = self.data_chunk_want();
        let shards = self.get_min_avail_to_read_shards(hoid, &want_to_read, false)?;
        let (stripe_off, stripe_len) = self.sinfo.offset_len_to_stripe_bounds(offset, len);
        let tid = self.listener.next_tid();
        let whoami = self.listener.whoami();
        for peer in shards {
            if peer == whoami {
                continue;
            }
            let mut msg = EcRead {
                from: whoami,
                tid,
                preheat: true,
                ..Default::default()
            };
            msg.to_read
                .entry(hoid.clone())
                .or_default()
                .push((stripe_off, stripe_len, flags));
            self.listener.send_message(peer.node, Message::Read(msg));
        }
        Ok(())
    }

    /// The data-chunk shard ids a plain read wants, after the codec's
    /// chunk permutation.
    pub(crate) fn data_chunk_want(&self) -> BTreeSet<usize> {
        let mapping = self.codec.chunk_mapping();
        (0..self.codec.data_chunk_count())
            .map(|i| mapping.get(i).copied().unwrap_or(i))
            .collect()
    }

    // =========================================================================
    // Shard Selection
    // =========================================================================

    /// Acting shards that are not missing `hoid`, as both a shard-id set
    /// and a shard -> peer map.
    pub(crate) fn get_no_missing_read_shards(
        &self,
        hoid: &ObjectId,
    ) -> (BTreeSet<usize>, BTreeMap<ShardId, PgShard>) {
        let mut have = BTreeSet::new();
        let mut shards = BTreeMap::new();
        for peer in self.listener.acting_shards() {
            if !self.listener.is_missing(peer, hoid) {
                assert!(have.insert(peer.shard.index()));
                assert!(shards.insert(peer.shard, peer).is_none());
            }
        }
        (have, shards)
    }

    /// Pick the peers to read from so that the chunks in `want` can be
    /// produced. Recovery mode widens the candidate set with backfill
    /// peers past `hoid` and known extra locations.
    pub(crate) fn get_min_avail_to_read_shards(
        &self,
        hoid: &ObjectId,
        want: &BTreeSet<usize>,
        for_recovery: bool,
    ) -> Result<BTreeSet<PgShard>> {
        let (mut have, mut shards) = self.get_no_missing_read_shards(hoid);

        if for_recovery {
            for peer in self.listener.backfill_shards() {
                if have.contains(&peer.shard.index()) {
                    assert!(shards.contains_key(&peer.shard));
                    continue;
                }
                assert!(!shards.contains_key(&peer.shard));
                let past_backfill = self
                    .listener
                    .last_backfill(peer)
                    .is_some_and(|bound| *hoid < bound);
                if past_backfill && !self.listener.is_missing(peer, hoid) {
                    have.insert(peer.shard.index());
                    shards.insert(peer.shard, peer);
                }
            }
            for peer in self.listener.missing_loc_shards(hoid) {
                debug!(peer = %peer, "considering missing_loc source");
                have.insert(peer.shard.index());
                shards.insert(peer.shard, peer);
            }
        }

        let need = if self.subread_all && !for_recovery {
            if have.len() < self.codec.data_chunk_count() {
                return Err(Error::InsufficientShards {
                    available: have.len(),
                    required: self.codec.data_chunk_count(),
                });
            }
            have
        } else {
            self.codec.minimum_to_decode(want, &have)?
        };

        Ok(need
            .iter()
            .map(|&i| {
                *shards
                    .get(&ShardId::from(i))
                    .expect("codec chose a shard with no peer")
            })
            .collect())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Assign a tid, record the op, and send the grouped per-peer
    /// sub-reads.
    pub(crate) fn start_read_op(
        &mut self,
        priority: u8,
        to_read: BTreeMap<ObjectId, ReadRequest>,
    ) {
        let tid = self.listener.next_tid();
        assert!(!self.tid_to_read_map.contains_key(&tid));
        let whoami = self.listener.whoami();
        let mut op = ReadOp {
            tid,
            priority,
            to_read,
            complete: BTreeMap::new(),
            obj_to_source: BTreeMap::new(),
            source_to_obj: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            start: Instant::now(),
        };

        let mut messages: BTreeMap<PgShard, EcRead> = BTreeMap::new();
        for (oid, req) in &op.to_read {
            let result = ReadResult {
                r: 0,
                errors: BTreeMap::new(),
                attrs: None,
                returned: req
                    .to_read
                    .iter()
                    .map(|&(offset, len, _)| ReturnedRange {
                        offset,
                        len,
                        buffers: BTreeMap::new(),
                    })
                    .collect(),
                need: req.need.clone(),
                partial_read: req.partial_read.clone(),
                cinfo: req.cinfo.clone(),
            };
            op.complete.insert(oid.clone(), result);

            let need_attrs = req.want_attrs;
            let mut pg_need: BTreeSet<PgShard> = BTreeSet::new();
            for entry in &req.need {
                for &(peer, _, _) in entry {
                    pg_need.insert(peer);
                }
            }
            for &peer in &pg_need {
                let msg = messages.entry(peer).or_default();
                if need_attrs {
                    msg.attrs_to_read.insert(oid.clone());
                    msg.self_check = true;
                }
                op.obj_to_source.entry(oid.clone()).or_default().insert(peer);
                op.source_to_obj.entry(peer).or_default().insert(oid.clone());
            }
            assert_eq!(req.to_read.len(), req.need.len());
            for (&(_, _, flags), entry) in req.to_read.iter().zip(req.need.iter()) {
                for &(peer, offset, len) in entry {
                    messages
                        .entry(peer)
                        .or_default()
                        .to_read
                        .entry(oid.clone())
                        .or_default()
                        .push((offset, len, flags));
                }
            }
        }

        for (peer, mut msg) in messages {
            op.in_progress.insert(peer);
            self.shard_to_read_map.entry(peer).or_default().insert(tid);
            msg.from = whoami;
            msg.tid = tid;
            self.listener.send_message(peer.node, Message::Read(msg));
        }
        debug!(tid, objects = op.to_read.len(), peers = op.in_progress.len(), "read op started");
        self.tid_to_read_map.insert(tid, op);
    }

    // =========================================================================
    // Sub-Read (every shard)
    // =========================================================================

    /// Serve one peer's sub-read from the local store.
    #[instrument(skip_all, fields(tid = op.tid, from = %op.from))]
    pub fn handle_sub_read(&mut self, op: EcRead) -> EcReadReply {
        let whoami = self.listener.whoami();
        let mut reply = EcReadReply {
            from: whoami,
            tid: op.tid,
            ..Default::default()
        };
        'objects: for (oid, extents) in &op.to_read {
            for &(offset, len, _flags) in extents {
                let gh = self.local_object(oid);
                match self.store.read(&gh, offset, len) {
                    Ok(bl) => {
                        if op.self_check {
                            self.self_check_shard(oid, &bl);
                        }
                        reply
                            .buffers_read
                            .entry(oid.clone())
                            .or_default()
                            .push((offset, bl));
                    }
                    Err(e) => {
                        assert!(
                            self.subread_all,
                            "sub-read of {} failed outside subread_all: {}",
                            gh, e
                        );
                        warn!(oid = %gh, offset, error = %e, "sub-read failed");
                        reply.buffers_read.remove(oid);
                        reply.errors.insert(oid.clone(), EIO);
                        continue 'objects;
                    }
                }
            }
        }
        for oid in &op.attrs_to_read {
            debug!(oid = %oid, "fulfilling attr request");
            if reply.errors.contains_key(oid) {
                continue;
            }
            let attrs = self
                .store
                .getattrs(&self.local_object(oid))
                .unwrap_or_else(|e| panic!("getattrs on {} failed: {}", oid, e));
            reply.attrs_read.insert(oid.clone(), attrs);
        }
        reply
    }

    /// When a checked read covers this shard's whole chunk store, verify
    /// the shard end to end before handing the bytes back.
    fn self_check_shard(&self, oid: &ObjectId, bl: &Bytes) {
        let cinfo = self.get_compact_info(oid, None).unwrap_or_else(|e| {
            panic!("no compact info for {} and no way to recover: {}", oid, e)
        });
        let osize = cinfo.read().total_chunk_size(self.listener.whoami().shard);
        assert!(bl.len() as u64 <= osize);
        if bl.len() as u64 == osize {
            let scrub = self.be_deep_scrub(oid, 0);
            assert!(!scrub.read_error, "self check found {} corrupt", oid);
        }
    }

    // =========================================================================
    // Replies (primary)
    // =========================================================================

    /// Splice one peer's reply into the read op; completes the op when
    /// the criterion for its mode is met. Replies for unknown tids were
    /// canceled and are dropped whole.
    pub fn handle_sub_read_reply(&mut self, reply: EcReadReply, m: &mut RecoveryMessages) {
        let from = reply.from;
        let tid = reply.tid;
        let Some(rop) = self.tid_to_read_map.get_mut(&tid) else {
            debug!(tid, "reply for canceled read; dropping buffers");
            return;
        };
        for (oid, buffers) in reply.buffers_read {
            assert!(!reply.errors.contains_key(&oid));
            if !rop.to_read.contains_key(&oid) {
                // Canceled this object after the sub-read went out.
                continue;
            }
            let result = rop.complete.get_mut(&oid).expect("result missing");
            assert!(buffers.len() <= result.returned.len());
            for ((_, bl), range) in buffers.into_iter().zip(result.returned.iter_mut()) {
                debug!(oid = %oid, from = %from, len = bl.len(), "sub-read buffer");
                range.buffers.insert(from, bl);
            }
        }
        for (oid, attrs) in reply.attrs_read {
            assert!(!reply.errors.contains_key(&oid));
            if !rop.to_read.contains_key(&oid) {
                continue;
            }
            rop.complete.get_mut(&oid).expect("result missing").attrs = Some(attrs);
        }
        for (oid, code) in reply.errors {
            let result = rop.complete.get_mut(&oid).expect("result missing");
            result.errors.insert(from, code);
            if result.r == 0 {
                result.r = code;
            }
        }

        let siter = self
            .shard_to_read_map
            .get_mut(&from)
            .expect("reply from untracked shard");
        assert!(siter.remove(&tid));
        assert!(rop.in_progress.remove(&from));

        if !rop.in_progress.is_empty() {
            if self.subread_all {
                let k = self.codec.data_chunk_count();
                for result in rop.complete.values() {
                    let enough = result
                        .returned
                        .front()
                        .is_some_and(|range| range.buffers.len() >= k);
                    if !enough {
                        debug!(tid, "read op not complete");
                        return;
                    }
                }
                debug!(tid, elapsed = ?rop.start.elapsed(), "read op complete (k responses)");
                rop.in_progress.clear();
                let rop = self.tid_to_read_map.remove(&tid).unwrap();
                self.complete_read_op(rop, m);
            } else {
                debug!(tid, "read op not complete");
            }
        } else {
            debug!(tid, elapsed = ?rop.start.elapsed(), "read op complete");
            let rop = self.tid_to_read_map.remove(&tid).unwrap();
            self.complete_read_op(rop, m);
        }
    }

    /// Run each object's completion over its assembled result.
    pub(crate) fn complete_read_op(&mut self, mut rop: ReadOp, m: &mut RecoveryMessages) {
        assert_eq!(rop.to_read.len(), rop.complete.len());
        for (oid, req) in std::mem::take(&mut rop.to_read) {
            let mut result = rop.complete.remove(&oid).expect("result missing");
            if result.cinfo.is_none() {
                result.cinfo = req.cinfo.clone();
            }
            match req.completion {
                Some(ReadCompletion::ClientRead { status_id, calls }) => {
                    self.finish_client_read(status_id, calls, result);
                }
                Some(ReadCompletion::RecoveryRead) => {
                    self.handle_recovery_read_complete(&oid, result, m);
                }
                None => {}
            }
        }
    }

    /// Decompress, reassemble, and slice each client call's window, then
    /// retire the read status in submission order.
    fn finish_client_read(&mut self, status_id: u64, calls: Vec<ReadCall>, mut result: ReadResult) {
        let cinfo = result
            .cinfo
            .clone()
            .expect("client read completed without compact info");
        let index = cinfo.read();

        // Per-chunk decompression of every returned buffer.
        for (range, entry) in result.returned.iter_mut().zip(result.need.iter()) {
            for &(peer, offset, len) in entry {
                if let Some(buf) = range.buffers.get_mut(&peer) {
                    let decompressed = index
                        .decompact(peer.shard, offset as u32, len as u32, buf, true)
                        .unwrap_or_else(|e| {
                            panic!("shard {} returned undecodable data: {}", peer, e)
                        });
                    *buf = decompressed;
                }
            }
        }

        let chunk_size = self.sinfo.chunk_size();
        for ((mut call, partial), entry) in calls
            .into_iter()
            .zip(result.partial_read.iter())
            .zip(result.need.iter())
        {
            let range = result.returned.pop_front().expect("range missing");
            let outcome: Result<Bytes> = if *partial {
                assert_eq!(result.r, 0);
                assert!(result.errors.is_empty());
                let mut bl = BytesMut::new();
                for &(peer, _, _) in entry {
                    if let Some(buf) = range.buffers.get(&peer) {
                        bl.extend_from_slice(buf);
                    }
                }
                let bl = bl.freeze();
                let start = (call.offset % chunk_size) as usize;
                let take = (call.len as usize).min(bl.len().saturating_sub(start));
                Ok(bl.slice(start..start + take))
            } else {
                if !self.subread_all {
                    assert_eq!(result.r, 0);
                    assert!(result.errors.is_empty());
                }
                let (stripe_off, _) = self.sinfo.offset_len_to_stripe_bounds(call.offset, call.len);
                let k = self.codec.data_chunk_count();
                let mut to_decode: BTreeMap<ShardId, Bytes> = BTreeMap::new();
                for (peer, buf) in &range.buffers {
                    if to_decode.len() >= k {
                        break;
                    }
                    if !buf.is_empty() && buf.len() as u64 % chunk_size == 0 {
                        to_decode.insert(peer.shard, buf.clone());
                    }
                }
                codec::decode_stripes_concat(&self.sinfo, self.codec.as_ref(), &to_decode).map(
                    |bl| {
                        let start = (call.offset - stripe_off) as usize;
                        let take = (call.len as usize).min(bl.len().saturating_sub(start));
                        bl.slice(start..start + take)
                    },
                )
            };
            if let Some(cb) = call.on_done.take() {
                cb(outcome);
            }
        }

        // Retire statuses strictly in submission order.
        for status in self.in_progress_client_reads.iter_mut() {
            if status.id == status_id {
                status.complete = true;
                break;
            }
        }
        while let Some(front) = self.in_progress_client_reads.front_mut() {
            if !front.complete {
                break;
            }
            if let Some(cb) = front.on_complete.take() {
                cb();
            }
            self.in_progress_client_reads.pop_front();
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Drop every object of `op` whose sources include a peer the map
    /// reports down. Callbacks for canceled objects are dropped unfired;
    /// if nothing remains in flight the op is finished via an event.
    pub(crate) fn filter_read_op(&mut self, osdmap: &dyn OsdMapView, op: &mut ReadOp) {
        let mut to_cancel: BTreeSet<ObjectId> = BTreeSet::new();
        for (peer, objs) in &op.source_to_obj {
            if osdmap.is_down(peer.node) {
                to_cancel.extend(objs.iter().cloned());
                op.in_progress.remove(peer);
            }
        }
        if to_cancel.is_empty() {
            return;
        }

        op.source_to_obj.retain(|peer, objs| {
            objs.retain(|oid| !to_cancel.contains(oid));
            if objs.is_empty() {
                false
            } else {
                assert!(!osdmap.is_down(peer.node));
                true
            }
        });

        for oid in &to_cancel {
            self.listener.cancel_pull(oid);
            let req = op.to_read.remove(oid).expect("canceled object not in read op");
            debug!(oid = %oid, tid = op.tid, "canceling read");
            assert!(req.completion.is_some());
            drop(req); // callbacks die here
            op.complete.remove(oid);
            self.recovery_ops.remove(oid);
        }

        if op.in_progress.is_empty() {
            let _ = self.events.send(BackendEvent::FinishReadOp { tid: op.tid });
        }
    }

    /// A new cluster map arrived: filter every read op that was sourcing
    /// from a now-down peer.
    pub fn check_recovery_sources(&mut self, osdmap: &dyn OsdMapView) {
        let mut tids_to_filter: BTreeSet<Tid> = BTreeSet::new();
        self.shard_to_read_map.retain(|peer, tids| {
            if osdmap.is_down(peer.node) {
                tids_to_filter.extend(tids.iter().copied());
                false
            } else {
                true
            }
        });
        for tid in tids_to_filter {
            let mut op = self
                .tid_to_read_map
                .remove(&tid)
                .expect("filtered tid not in read map");
            self.filter_read_op(osdmap, &mut op);
            self.tid_to_read_map.insert(tid, op);
        }
    }
}
