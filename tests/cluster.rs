//! End-to-End Backend Tests
//!
//! Drives a full K+M node cluster in memory: one backend per node, a
//! scripted placement-group listener, and a message queue standing in
//! for the cluster network. Messages and store-completion events are
//! pumped until quiescent, so every test observes the same ordering the
//! group worker would produce.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use stripestor::backend::{BackendConfig, BackendEvent, EcBackend, EcTransaction, ReadCall};
use stripestor::listener::{ObjectContext, ObjectContextRef, PgListener};
use stripestor::messages::{LogEntry, Message, ModDesc, ModOp, RecoveryInfo};
use stripestor::metadata::{CompactInfo, HashInfo, CINFO_KEY, HINFO_KEY};
use stripestor::store::{MemStore, ObjectStore, Transaction};
use stripestor::types::{Attrs, GhObjectId, NodeId, ObjectId, PgShard, ReqId, ShardId, Version};
use stripestor::ReedSolomonCodec;

// =============================================================================
// Test Cluster
// =============================================================================

#[derive(Default)]
struct Topology {
    acting: BTreeSet<PgShard>,
    backfill: BTreeSet<PgShard>,
    missing: BTreeMap<PgShard, BTreeSet<ObjectId>>,
    undersized: bool,
}

struct Shared {
    k: usize,
    net: Mutex<VecDeque<(NodeId, Message)>>,
    delivered: Mutex<Vec<(NodeId, &'static str)>>,
    topo: Mutex<Topology>,
    obcs: Mutex<BTreeMap<ObjectId, ObjectContextRef>>,
    global_recovered: Mutex<Vec<ObjectId>>,
    peer_recovered: Mutex<Vec<(PgShard, ObjectId)>>,
    cancelled_pulls: Mutex<Vec<ObjectId>>,
    next_tid: AtomicU64,
}

struct TestListener {
    whoami: PgShard,
    shared: Arc<Shared>,
}

impl PgListener for TestListener {
    fn whoami(&self) -> PgShard {
        self.whoami
    }

    fn primary_shard(&self) -> PgShard {
        PgShard::new(NodeId(0), ShardId(0))
    }

    fn epoch(&self) -> u64 {
        1
    }

    fn acting_shards(&self) -> BTreeSet<PgShard> {
        self.shared.topo.lock().acting.clone()
    }

    fn acting_backfill_shards(&self) -> BTreeSet<PgShard> {
        let topo = self.shared.topo.lock();
        topo.acting.union(&topo.backfill).copied().collect()
    }

    fn backfill_shards(&self) -> BTreeSet<PgShard> {
        self.shared.topo.lock().backfill.clone()
    }

    fn missing_loc_shards(&self, _oid: &ObjectId) -> BTreeSet<PgShard> {
        BTreeSet::new()
    }

    fn is_missing(&self, shard: PgShard, oid: &ObjectId) -> bool {
        self.shared
            .topo
            .lock()
            .missing
            .get(&shard)
            .is_some_and(|objs| objs.contains(oid))
    }

    fn last_backfill(&self, _shard: PgShard) -> Option<ObjectId> {
        None
    }

    fn is_undersized(&self) -> bool {
        self.shared.topo.lock().undersized
    }

    fn next_tid(&self) -> u64 {
        self.shared.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    fn last_complete(&self) -> Version {
        Version::default()
    }

    fn log_operation(
        &self,
        _log_entries: &[LogEntry],
        _trim_to: Version,
        _trim_rollback_to: Version,
        _transaction_applied: bool,
    ) {
    }

    fn op_applied(&self, _version: Version) {}

    fn update_last_complete_ondisk(&self, _version: Version) {}

    fn update_peer_last_complete_ondisk(&self, _from: PgShard, _version: Version) {}

    fn send_message(&self, to: NodeId, msg: Message) {
        self.shared.net.lock().push_back((to, msg));
    }

    fn object_context(&self, oid: &ObjectId, attrs: &Attrs) -> ObjectContextRef {
        if let Some(obc) = self.shared.obcs.lock().get(oid) {
            return obc.clone();
        }
        // Derive the logical size from the pushed compaction index.
        let size = attrs
            .get(CINFO_KEY)
            .map(|bl| {
                let cinfo = CompactInfo::decode(bl.clone()).unwrap();
                cinfo.total_origin_chunk_size() * self.shared.k as u64
            })
            .unwrap_or(0);
        Arc::new(ObjectContext {
            size,
            version: Version::default(),
        })
    }

    fn begin_peer_recover(&self, _peer: PgShard, _oid: &ObjectId) {}

    fn on_local_recover_start(&self, _oid: &ObjectId, _txn: &mut Transaction) {}

    fn on_local_recover(
        &self,
        _oid: &ObjectId,
        _info: &RecoveryInfo,
        _obc: Option<ObjectContextRef>,
        _txn: &mut Transaction,
    ) {
    }

    fn on_peer_recover(&self, peer: PgShard, oid: &ObjectId, _info: &RecoveryInfo) {
        self.shared.peer_recovered.lock().push((peer, oid.clone()));
    }

    fn on_global_recover(&self, oid: &ObjectId) {
        self.shared.global_recovered.lock().push(oid.clone());
    }

    fn cancel_pull(&self, oid: &ObjectId) {
        self.shared.cancelled_pulls.lock().push(oid.clone());
    }
}

struct Node {
    backend: EcBackend,
    events: UnboundedReceiver<BackendEvent>,
    store: Arc<MemStore>,
}

struct Cluster {
    shared: Arc<Shared>,
    nodes: Vec<Node>,
}

impl Cluster {
    fn new(k: usize, m: usize, stripe_width: u64, cfg: BackendConfig) -> Self {
        let total = k + m;
        let shared = Arc::new(Shared {
            k,
            net: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
            topo: Mutex::new(Topology {
                acting: (0..total)
                    .map(|i| PgShard::new(NodeId(i as u32), ShardId(i as u8)))
                    .collect(),
                ..Default::default()
            }),
            obcs: Mutex::new(BTreeMap::new()),
            global_recovered: Mutex::new(Vec::new()),
            peer_recovered: Mutex::new(Vec::new()),
            cancelled_pulls: Mutex::new(Vec::new()),
            next_tid: AtomicU64::new(1),
        });
        let nodes = (0..total)
            .map(|i| {
                let store = Arc::new(MemStore::new());
                let listener = Arc::new(TestListener {
                    whoami: PgShard::new(NodeId(i as u32), ShardId(i as u8)),
                    shared: shared.clone(),
                });
                let (tx, events) = unbounded_channel();
                let backend = EcBackend::new(
                    cfg.clone(),
                    stripe_width,
                    Arc::new(ReedSolomonCodec::new(k, m).unwrap()),
                    store.clone(),
                    listener,
                    tx,
                )
                .unwrap();
                Node {
                    backend,
                    events,
                    store,
                }
            })
            .collect();
        Self { shared, nodes }
    }

    fn primary(&mut self) -> &mut EcBackend {
        &mut self.nodes[0].backend
    }

    /// Deliver queued messages and drain completion events until the
    /// cluster goes quiet.
    fn pump(&mut self) {
        loop {
            let mut progress = false;
            for node in &mut self.nodes {
                while let Ok(event) = node.events.try_recv() {
                    node.backend.handle_event(event);
                    progress = true;
                }
            }
            let next = self.shared.net.lock().pop_front();
            if let Some((to, msg)) = next {
                self.shared.delivered.lock().push((to, msg.kind()));
                self.nodes[to.0 as usize].backend.handle_message(msg);
                progress = true;
            }
            if !progress {
                break;
            }
        }
    }

    fn delivered_count(&self, kind: &str) -> usize {
        self.shared
            .delivered
            .lock()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    /// Write `data` (stripe aligned) to `name` and pump to completion,
    /// asserting both completion callbacks fire exactly once.
    fn write_object(&mut self, name: &str, data: Vec<u8>, seq: u64) -> ObjectId {
        let oid = ObjectId::new(name);
        let version = Version::new(1, seq);
        let old_size = {
            self.shared
                .obcs
                .lock()
                .get(&oid)
                .map(|o| o.size)
                .unwrap_or(0)
        };
        let new_size = old_size + data.len() as u64;
        let mut txn = EcTransaction::new();
        txn.append(oid.clone(), Bytes::from(data));
        let entry = LogEntry {
            oid: oid.clone(),
            version,
            mod_desc: ModDesc::new(vec![ModOp::Append { old_size }]),
        };
        let applied = Arc::new(Mutex::new(0u32));
        let committed = Arc::new(Mutex::new(0u32));
        let applied2 = applied.clone();
        let committed2 = committed.clone();
        let tid = self.shared.next_tid.fetch_add(1, Ordering::SeqCst);
        self.primary().submit_transaction(
            oid.clone(),
            version,
            txn,
            Version::default(),
            Version::default(),
            vec![entry],
            None,
            None,
            Some(Box::new(move || *applied2.lock() += 1)),
            Some(Box::new(move || *committed2.lock() += 1)),
            tid,
            ReqId::default(),
        );
        self.shared.obcs.lock().insert(
            oid.clone(),
            Arc::new(ObjectContext {
                size: new_size,
                version,
            }),
        );
        self.pump();
        assert_eq!(*applied.lock(), 1, "on_all_applied must fire exactly once");
        assert_eq!(*committed.lock(), 1, "on_all_commit must fire exactly once");
        oid
    }

    /// Read `[offset, offset+len)` of `name` through the async read path.
    fn read_object(&mut self, name: &str, offset: u64, len: u64) -> Bytes {
        let oid = ObjectId::new(name);
        let result: Arc<Mutex<Option<stripestor::Result<Bytes>>>> = Arc::new(Mutex::new(None));
        let r2 = result.clone();
        let done = Arc::new(Mutex::new(false));
        let d2 = done.clone();
        self.primary()
            .objects_read_async(
                &oid,
                vec![ReadCall::new(offset, len, 0, move |out| {
                    *r2.lock() = Some(out);
                })],
                Some(Box::new(move || *d2.lock() = true)),
            )
            .unwrap();
        self.pump();
        assert!(*done.lock(), "read on_complete did not fire");
        let out = result.lock().take().expect("read callback did not fire");
        out.expect("read returned an error")
    }
}

fn default_cluster() -> Cluster {
    Cluster::new(2, 1, 8192, BackendConfig::default())
}

fn gh(name: &str, shard: u8) -> GhObjectId {
    GhObjectId::new(ObjectId::new(name), ShardId(shard))
}

// =============================================================================
// Write Pipeline
// =============================================================================

#[test]
fn test_single_client_write() {
    let mut cluster = default_cluster();
    cluster.write_object("obj", vec![0xAA; 8192], 1);

    // The two non-primary participants each got one sub-write and sent
    // back separate applied and committed acks; the primary applied its
    // own slice locally.
    assert_eq!(cluster.delivered_count("EcWrite"), 2);
    assert_eq!(cluster.delivered_count("EcWriteReply"), 4);

    for shard in 0..3u8 {
        let store = &cluster.nodes[shard as usize].store;
        let data = store.read(&gh("obj", shard), 0, 1 << 20).unwrap();
        assert!(!data.is_empty(), "shard {} got no chunk data", shard);
        assert!(data.len() < 4096, "chunk of 0xAA should compress well");

        let hinfo =
            HashInfo::decode(store.getattr(&gh("obj", shard), HINFO_KEY).unwrap().unwrap())
                .unwrap();
        assert_eq!(hinfo.total_chunk_size(), 4096);

        let cinfo =
            CompactInfo::decode(store.getattr(&gh("obj", shard), CINFO_KEY).unwrap().unwrap())
                .unwrap();
        assert_eq!(cinfo.total_origin_chunk_size(), 4096);
        assert_eq!(cinfo.chunk_compact_range(ShardId(shard)).len(), 1);
        assert_eq!(cinfo.total_chunk_size(ShardId(shard)), data.len() as u64);
    }
    assert_eq!(cluster.primary().inflight_snapshot().writes, 0);
}

#[test]
fn test_writes_complete_in_submission_order() {
    let mut cluster = default_cluster();
    cluster.write_object("a", vec![0x11; 8192], 1);
    cluster.write_object("a", vec![0x22; 8192], 2);

    let store = &cluster.nodes[1].store;
    let cinfo = CompactInfo::decode(store.getattr(&gh("a", 1), CINFO_KEY).unwrap().unwrap())
        .unwrap();
    assert_eq!(cinfo.total_origin_chunk_size(), 8192);
    assert_eq!(cinfo.chunk_compact_range(ShardId(1)).len(), 2);
}

// =============================================================================
// Read Pipeline
// =============================================================================

#[test]
fn test_read_back_round_trip() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    cluster.write_object("obj", data.clone(), 1);

    let out = cluster.read_object("obj", 0, 8192);
    assert_eq!(out.as_ref(), data.as_slice());
}

#[test]
fn test_degraded_read_reconstructs() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 253) as u8).collect();
    cluster.write_object("obj", data.clone(), 1);

    // Shard 1's copy is missing: the codec must pick a surviving set.
    cluster.shared.topo.lock().missing.insert(
        PgShard::new(NodeId(1), ShardId(1)),
        [ObjectId::new("obj")].into_iter().collect(),
    );
    cluster.shared.delivered.lock().clear();

    let out = cluster.read_object("obj", 0, 8192);
    assert_eq!(out.as_ref(), data.as_slice());

    // Reads went to the survivors only.
    let reads: Vec<NodeId> = cluster
        .shared
        .delivered
        .lock()
        .iter()
        .filter(|(_, k)| *k == "EcRead")
        .map(|(n, _)| *n)
        .collect();
    assert_eq!(reads.len(), 2);
    assert!(!reads.contains(&NodeId(1)));
}

#[test]
fn test_partial_read_fast_path_hits_one_shard() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 240) as u8).collect();
    cluster.write_object("obj", data.clone(), 1);
    cluster.shared.delivered.lock().clear();

    let out = cluster.read_object("obj", 64, 16);
    assert_eq!(out.as_ref(), &data[64..80]);

    // 16 bytes at offset 64 live entirely on shard 0; only that shard
    // is read and nothing is decoded.
    let reads: Vec<NodeId> = cluster
        .shared
        .delivered
        .lock()
        .iter()
        .filter(|(_, k)| *k == "EcRead")
        .map(|(n, _)| *n)
        .collect();
    assert_eq!(reads, vec![NodeId(0)]);
}

#[test]
fn test_partial_read_spanning_two_chunks() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 239) as u8).collect();
    cluster.write_object("obj", data.clone(), 1);
    cluster.shared.delivered.lock().clear();

    // Crosses the shard-0 / shard-1 chunk boundary but stays small.
    let out = cluster.read_object("obj", 4000, 200);
    assert_eq!(out.as_ref(), &data[4000..4200]);

    let reads: BTreeSet<NodeId> = cluster
        .shared
        .delivered
        .lock()
        .iter()
        .filter(|(_, k)| *k == "EcRead")
        .map(|(n, _)| *n)
        .collect();
    assert_eq!(reads, [NodeId(0), NodeId(1)].into_iter().collect());
}

#[test]
fn test_partial_read_falls_back_when_shard_missing() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 201) as u8).collect();
    cluster.write_object("obj", data.clone(), 1);

    cluster.shared.topo.lock().missing.insert(
        PgShard::new(NodeId(0), ShardId(0)),
        [ObjectId::new("obj")].into_iter().collect(),
    );

    // The covered chunk's shard is unhealthy: full-stripe path decodes.
    let out = cluster.read_object("obj", 64, 16);
    assert_eq!(out.as_ref(), &data[64..80]);
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn test_recovery_restores_missing_shard() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..16384u32).map(|i| (i % 7) as u8).collect();
    let oid = cluster.write_object("robj", data.clone(), 1);

    // Snapshot what shard 2 is supposed to hold, then lose it.
    let expected = cluster.nodes[2]
        .store
        .read(&gh("robj", 2), 0, 1 << 20)
        .unwrap();
    let expected_cinfo = cluster.nodes[2]
        .store
        .getattr(&gh("robj", 2), CINFO_KEY)
        .unwrap()
        .unwrap();
    let mut txn = Transaction::new();
    txn.remove(gh("robj", 2));
    cluster.nodes[2].store.queue_transaction(txn, None, None);
    let target = PgShard::new(NodeId(2), ShardId(2));
    cluster
        .shared
        .topo
        .lock()
        .missing
        .insert(target, [oid.clone()].into_iter().collect());
    cluster.shared.delivered.lock().clear();

    let obc = cluster.shared.obcs.lock().get(&oid).cloned();
    let primary = cluster.primary();
    let mut handle = primary.open_recovery_op();
    primary.recover_object(&oid, Version::new(1, 1), obc, &mut handle);
    primary.run_recovery_op(handle, 0);
    cluster.pump();

    // The whole object fit one round: one push, one reply, done.
    assert_eq!(cluster.delivered_count("PgPush"), 1);
    assert_eq!(cluster.delivered_count("PgPushReply"), 1);
    assert_eq!(cluster.shared.global_recovered.lock().as_slice(), &[oid.clone()]);
    assert_eq!(
        cluster.shared.peer_recovered.lock().as_slice(),
        &[(target, oid.clone())]
    );
    assert!(cluster.primary().recovery_snapshot().is_empty());

    // The target's on-disk form matches what it held before the loss.
    let restored = cluster.nodes[2]
        .store
        .read(&gh("robj", 2), 0, 1 << 20)
        .unwrap();
    assert_eq!(restored, expected);
    let restored_cinfo = cluster.nodes[2]
        .store
        .getattr(&gh("robj", 2), CINFO_KEY)
        .unwrap()
        .unwrap();
    assert_eq!(restored_cinfo, expected_cinfo);
}

#[test]
fn test_recovery_of_two_missing_shards() {
    let mut cluster = Cluster::new(2, 2, 8192, BackendConfig::default());
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 13) as u8).collect();
    let oid = cluster.write_object("robj", data.clone(), 1);

    let mut expected = Vec::new();
    for shard in [1u8, 3u8] {
        expected.push(
            cluster.nodes[shard as usize]
                .store
                .read(&gh("robj", shard), 0, 1 << 20)
                .unwrap(),
        );
        let mut txn = Transaction::new();
        txn.remove(gh("robj", shard));
        cluster.nodes[shard as usize]
            .store
            .queue_transaction(txn, None, None);
        cluster.shared.topo.lock().missing.insert(
            PgShard::new(NodeId(shard as u32), ShardId(shard)),
            [oid.clone()].into_iter().collect(),
        );
    }

    let obc = cluster.shared.obcs.lock().get(&oid).cloned();
    let primary = cluster.primary();
    let mut handle = primary.open_recovery_op();
    primary.recover_object(&oid, Version::new(1, 1), obc, &mut handle);
    primary.run_recovery_op(handle, 0);
    cluster.pump();

    assert_eq!(cluster.shared.global_recovered.lock().len(), 1);
    for (i, shard) in [1u8, 3u8].into_iter().enumerate() {
        let restored = cluster.nodes[shard as usize]
            .store
            .read(&gh("robj", shard), 0, 1 << 20)
            .unwrap();
        assert_eq!(restored, expected[i], "shard {} restored wrong bytes", shard);
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_peer_loss_cancels_read() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 101) as u8).collect();
    let oid = cluster.write_object("obj", data, 1);

    let fired = Arc::new(Mutex::new(false));
    let f2 = fired.clone();
    cluster
        .primary()
        .objects_read_async(
            &oid,
            vec![ReadCall::new(0, 8192, 0, move |_| *f2.lock() = true)],
            None,
        )
        .unwrap();
    assert_eq!(cluster.primary().inflight_snapshot().reads, 1);

    // One of the read's sources goes down before any reply arrives.
    let down: BTreeSet<NodeId> = [NodeId(1)].into_iter().collect();
    cluster.primary().check_recovery_sources(&down);
    cluster.pump();

    assert!(!*fired.lock(), "canceled read callback must never fire");
    assert_eq!(cluster.primary().inflight_snapshot().reads, 0);
    assert_eq!(cluster.shared.cancelled_pulls.lock().as_slice(), &[oid]);
}

// =============================================================================
// Deep Scrub
// =============================================================================

#[test]
fn test_deep_scrub_clean_and_corrupt() {
    let mut cluster = default_cluster();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 61) as u8).collect();
    let oid = cluster.write_object("sobj", data, 1);

    let clean = cluster.primary().be_deep_scrub(&oid, 0);
    assert!(!clean.read_error);
    assert!(clean.digest.is_some());

    // Flip one byte of the stored shard, past the block's size prefix.
    cluster.nodes[0].store.corrupt(&gh("sobj", 0), 10);
    let dirty = cluster.primary().be_deep_scrub(&oid, 0);
    assert!(dirty.read_error, "scrub must notice the flipped byte");
    // The digest is still reported (shard 0's recorded hash).
    assert_eq!(dirty.digest, clean.digest);
}
