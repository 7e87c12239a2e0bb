//! StripeStor - Erasure-Coded Object Backend
//!
//! The per-placement-group storage backend of a distributed object
//! store's node daemon. Logical objects are striped into K data chunks
//! plus M parity chunks across the group's shards; every chunk is
//! LZ4-compressed on its way to disk, with a per-object compaction index
//! mapping logical chunk positions to compressed on-disk ranges.
//!
//! # Architecture
//!
//! ```text
//! client ops          peer sub-ops            store completions
//!     │                    │                        │
//!     ▼                    ▼                        ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 PgWorker (one per group)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │                        EcBackend                         │
//! │   ┌──────────┐ ┌───────────┐ ┌──────────┐ ┌──────────┐  │
//! │   │   read   │ │   write   │ │ recovery │ │  scrub   │  │
//! │   │  engine  │ │  engine   │ │  engine  │ │          │  │
//! │   └────┬─────┘ └─────┬─────┘ └────┬─────┘ └────┬─────┘  │
//! │        └─────────────┴─────┬──────┴────────────┘        │
//! │      ┌────────────┐ ┌──────┴──────┐ ┌───────────────┐   │
//! │      │  geometry  │ │ EC codec    │ │ HashInfo /    │   │
//! │      │            │ │ + LZ4       │ │ CompactInfo   │   │
//! │      └────────────┘ └─────────────┘ └───────────────┘   │
//! └─────────────────────────────────────────────────────────┘
//!                 │                         │
//!            peer daemons             local ObjectStore
//! ```
//!
//! # Modules
//!
//! - [`backend`] - the backend itself: read/write/recovery engines,
//!   deep scrub, EC transactions
//! - [`cache`] - bounded LRU with pinning for the metadata registries
//! - [`codec`] - erasure codec trait and Reed-Solomon implementation
//! - [`compress`] - per-chunk LZ4 helpers
//! - [`error`] - error types
//! - [`geometry`] - stripe/chunk offset arithmetic
//! - [`interval`] - interval sets, including the bounded lossy variant
//! - [`listener`] - the placement-group interface the backend is driven
//!   through
//! - [`messages`] - sub-op wire messages
//! - [`metadata`] - per-object running hashes and the compaction index
//! - [`store`] - local object-store interface and the in-memory store
//! - [`types`] - object, shard, peer, and version identifiers
//! - [`worker`] - the per-group driver task

pub mod backend;
pub mod cache;
pub mod codec;
pub mod compress;
pub mod error;
pub mod geometry;
pub mod interval;
pub mod listener;
pub mod messages;
pub mod metadata;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod proptests;

// Re-export the types most integrations touch.
pub use backend::{BackendConfig, BackendEvent, EcBackend, EcTransaction, ReadCall, RecoveryHandle, ScrubObject};
pub use codec::{ErasureCodec, ReedSolomonCodec};
pub use error::{Error, Result};
pub use geometry::StripeInfo;
pub use listener::{ObjectContext, ObjectContextRef, OsdMapView, PgListener};
pub use messages::Message;
pub use metadata::{CompactInfo, HashInfo};
pub use store::{MemStore, ObjectStore, Transaction};
pub use types::{GhObjectId, NodeId, ObjectId, PgShard, ReqId, ShardId, Tid, Version};
pub use worker::{PgWorker, PgWorkerHandle};
