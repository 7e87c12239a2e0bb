//! Object store boundary
//!
//! The backend sits on top of a transaction-capable local object store.
//! Only the interface lives here: [`ObjectStore`] for synchronous metadata
//! reads and asynchronous transaction submission, and [`Transaction`] as
//! the batched mutation payload (also carried on sub-write messages).
//!
//! [`MemStore`] is the in-memory implementation used by tests and by the
//! examples; it applies transactions synchronously and fires the applied
//! and commit completions inline.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Attrs, GhObjectId};

/// Completion callback attached to a queued transaction.
pub type Completion = Box<dyn FnOnce() + Send>;

// =============================================================================
// Transactions
// =============================================================================

/// One mutation inside a [`Transaction`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxnOp {
    /// Ensure the object exists (possibly empty).
    Touch { oid: GhObjectId },
    /// Write `data` at `offset`, extending the object if needed.
    Write {
        oid: GhObjectId,
        offset: u64,
        data: Bytes,
    },
    /// Truncate the object to `size`.
    Truncate { oid: GhObjectId, size: u64 },
    /// Remove the object entirely.
    Remove { oid: GhObjectId },
    /// Set (merge) the given attributes.
    SetAttrs { oid: GhObjectId, attrs: Attrs },
    /// Move a temp-collection object into the canonical collection,
    /// replacing any existing content there.
    MoveFromTemp { oid: GhObjectId },
}

/// Ordered batch of store mutations, applied atomically per submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub ops: Vec<TxnOp>,
    /// Advise the store the written data will not be read soon.
    pub fadvise_dontneed: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set_fadvise_dontneed(&mut self) {
        self.fadvise_dontneed = true;
    }

    /// Append all of `other`'s ops onto this transaction.
    pub fn append(&mut self, other: Transaction) {
        self.ops.extend(other.ops);
        self.fadvise_dontneed |= other.fadvise_dontneed;
    }

    pub fn touch(&mut self, oid: GhObjectId) {
        self.ops.push(TxnOp::Touch { oid });
    }

    pub fn write(&mut self, oid: GhObjectId, offset: u64, data: Bytes) {
        self.ops.push(TxnOp::Write { oid, offset, data });
    }

    pub fn truncate(&mut self, oid: GhObjectId, size: u64) {
        self.ops.push(TxnOp::Truncate { oid, size });
    }

    pub fn remove(&mut self, oid: GhObjectId) {
        self.ops.push(TxnOp::Remove { oid });
    }

    pub fn setattrs(&mut self, oid: GhObjectId, attrs: Attrs) {
        self.ops.push(TxnOp::SetAttrs { oid, attrs });
    }

    pub fn move_from_temp(&mut self, oid: GhObjectId) {
        self.ops.push(TxnOp::MoveFromTemp { oid });
    }
}

// =============================================================================
// Store Interface
// =============================================================================

/// Local transaction-capable object store, one per daemon.
///
/// Small metadata reads are synchronous; mutations are queued as
/// transactions whose completions are delivered asynchronously (possibly
/// inline for stores with no volatile cache).
pub trait ObjectStore: Send + Sync {
    /// Object size, or `None` if it does not exist.
    fn stat(&self, oid: &GhObjectId) -> Result<Option<u64>>;

    /// Read up to `len` bytes at `offset`; short reads happen at EOF.
    fn read(&self, oid: &GhObjectId, offset: u64, len: u64) -> Result<Bytes>;

    /// One extended attribute, or `None` if absent.
    fn getattr(&self, oid: &GhObjectId, key: &str) -> Result<Option<Bytes>>;

    /// All extended attributes of the object.
    fn getattrs(&self, oid: &GhObjectId) -> Result<Attrs>;

    /// Queue `txn`; `on_applied` fires when the mutation is readable,
    /// `on_commit` when it is durable.
    fn queue_transaction(
        &self,
        txn: Transaction,
        on_applied: Option<Completion>,
        on_commit: Option<Completion>,
    );
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Default, Clone)]
struct StoredObject {
    data: Vec<u8>,
    attrs: Attrs,
}

/// In-memory [`ObjectStore`]: applies transactions synchronously and
/// fires both completions inline.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<GhObjectId, StoredObject>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, txn: &Transaction) {
        let mut objects = self.objects.lock();
        for op in &txn.ops {
            match op {
                TxnOp::Touch { oid } => {
                    objects.entry(oid.clone()).or_default();
                }
                TxnOp::Write { oid, offset, data } => {
                    let obj = objects.entry(oid.clone()).or_default();
                    let end = *offset as usize + data.len();
                    if obj.data.len() < end {
                        obj.data.resize(end, 0);
                    }
                    obj.data[*offset as usize..end].copy_from_slice(data);
                }
                TxnOp::Truncate { oid, size } => {
                    let obj = objects.entry(oid.clone()).or_default();
                    obj.data.resize(*size as usize, 0);
                }
                TxnOp::Remove { oid } => {
                    objects.remove(oid);
                }
                TxnOp::SetAttrs { oid, attrs } => {
                    let obj = objects.entry(oid.clone()).or_default();
                    for (k, v) in attrs {
                        obj.attrs.insert(k.clone(), v.clone());
                    }
                }
                TxnOp::MoveFromTemp { oid } => {
                    let temp = GhObjectId::new(oid.oid.to_temp(), oid.shard);
                    if let Some(obj) = objects.remove(&temp) {
                        objects.insert(GhObjectId::new(oid.oid.to_canonical(), oid.shard), obj);
                    }
                }
            }
        }
    }

    /// Flip one byte of a stored object (test hook for corruption).
    pub fn corrupt(&self, oid: &GhObjectId, index: usize) {
        let mut objects = self.objects.lock();
        if let Some(obj) = objects.get_mut(oid) {
            if index < obj.data.len() {
                obj.data[index] ^= 0xFF;
            }
        }
    }

    /// Whether the object exists at all.
    pub fn exists(&self, oid: &GhObjectId) -> bool {
        self.objects.lock().contains_key(oid)
    }
}

impl ObjectStore for MemStore {
    fn stat(&self, oid: &GhObjectId) -> Result<Option<u64>> {
        Ok(self
            .objects
            .lock()
            .get(oid)
            .map(|o| o.data.len() as u64))
    }

    fn read(&self, oid: &GhObjectId, offset: u64, len: u64) -> Result<Bytes> {
        let objects = self.objects.lock();
        let obj = objects
            .get(oid)
            .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
        let start = (offset as usize).min(obj.data.len());
        let end = (offset as usize + len as usize).min(obj.data.len());
        Ok(Bytes::copy_from_slice(&obj.data[start..end]))
    }

    fn getattr(&self, oid: &GhObjectId, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .objects
            .lock()
            .get(oid)
            .and_then(|o| o.attrs.get(key).cloned()))
    }

    fn getattrs(&self, oid: &GhObjectId) -> Result<Attrs> {
        let objects = self.objects.lock();
        let obj = objects
            .get(oid)
            .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
        Ok(obj.attrs.clone())
    }

    fn queue_transaction(
        &self,
        txn: Transaction,
        on_applied: Option<Completion>,
        on_commit: Option<Completion>,
    ) {
        debug!(ops = txn.ops.len(), "applying transaction");
        self.apply(&txn);
        if let Some(cb) = on_applied {
            cb();
        }
        if let Some(cb) = on_commit {
            cb();
        }
    }
}
