//! Core identifier and version types shared across the backend.
//!
//! A placement group stripes every logical object across `K + M` shard
//! positions. The types here name objects, shard positions, peers, and
//! the versions the primary assigns to writes.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transaction id assigned by the primary to each in-flight operation.
pub type Tid = u64;

/// Object extended attributes, keyed by attribute name.
pub type Attrs = BTreeMap<String, Bytes>;

// =============================================================================
// Object Identifiers
// =============================================================================

/// Logical object identifier.
///
/// Carries a flag distinguishing ordinary objects from temporary
/// recovery-staging objects, which live in the group's temp collection
/// until recovery completes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Object name, unique within the placement group
    pub name: String,
    /// True for temporary (recovery-staging) objects
    pub temp: bool,
}

impl ObjectId {
    /// Create an ordinary object id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temp: false,
        }
    }

    /// Create a temporary (recovery-staging) object id.
    pub fn new_temp(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temp: true,
        }
    }

    /// Whether this names a temporary object.
    pub fn is_temp(&self) -> bool {
        self.temp
    }

    /// The same object, in the temp collection.
    pub fn to_temp(&self) -> Self {
        Self {
            name: self.name.clone(),
            temp: true,
        }
    }

    /// The same object, in the canonical collection.
    pub fn to_canonical(&self) -> Self {
        Self {
            name: self.name.clone(),
            temp: false,
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new("")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.temp {
            write!(f, "temp:{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// An object id qualified with the shard it is stored on.
///
/// Names the physical per-shard piece of an object on one store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GhObjectId {
    pub oid: ObjectId,
    pub shard: ShardId,
}

impl GhObjectId {
    pub fn new(oid: ObjectId, shard: ShardId) -> Self {
        Self { oid, shard }
    }
}

impl fmt::Display for GhObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@s{}", self.oid, self.shard.0)
    }
}

// =============================================================================
// Shards and Peers
// =============================================================================

/// Shard position within the placement group, in `[0, K + M)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardId(pub u8);

impl ShardId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for ShardId {
    fn from(v: usize) -> Self {
        ShardId(v as u8)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a daemon (node) in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A shard position bound to the peer currently holding it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PgShard {
    pub node: NodeId,
    pub shard: ShardId,
}

impl PgShard {
    pub fn new(node: NodeId, shard: ShardId) -> Self {
        Self { node, shard }
    }
}

impl fmt::Display for PgShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.node.0, self.shard.0)
    }
}

// =============================================================================
// Versions and Request Ids
// =============================================================================

/// Monotonically increasing (epoch, sequence) version assigned by the
/// primary to every write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version {
    pub epoch: u32,
    pub seq: u64,
}

impl Version {
    pub fn new(epoch: u32, seq: u64) -> Self {
        Self { epoch, seq }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.seq)
    }
}

/// Client request id, echoed through sub-ops for tracing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReqId {
    pub client: u64,
    pub tid: u64,
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}:{}", self.client, self.tid)
    }
}
