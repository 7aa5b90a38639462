//! # FlowKV
//!
//! FlowKV is an embedded, eventually-persistent key-value storage engine
//! core: a partitioned hash-table index, a per-partition checkpoint log
//! and flusher write path, a collection lifecycle engine, a DCP-style
//! replication protocol, and a hybrid logical clock for cross-replica
//! conflict resolution.
//!
//! ## Quick start
//!
//! ```rust
//! use flowkv::{Bucket, EngineConfig, StoredKey};
//!
//! let bucket = Bucket::new("default", EngineConfig::balanced());
//! bucket.activate_all()?;
//! bucket.set(0, StoredKey::default_collection(b"user:1".to_vec()), b"payload".to_vec(), 0, 0)?;
//! let value = bucket.get(0, &StoredKey::default_collection(b"user:1".to_vec()))?;
//! assert!(value.is_some());
//! # Ok::<(), flowkv::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Index**: [`hash_table`] — a partitioned, stripe-locked hash table.
//! - **Ordering**: [`checkpoint`] — the durable ordering boundary between
//!   a mutation and its persistence/replication fan-out.
//! - **Persistence**: [`store`], [`flusher`] — the document-store
//!   contract and the per-partition flush loop that commits against it.
//! - **Collections**: [`collections`] — cluster-manifest diffing into
//!   collection lifecycle system events.
//! - **Replication**: [`dcp`], [`failover`] — producer/consumer stream
//!   state machines, wire framing, and rollback negotiation.
//! - **Clock**: [`clock`] — the hybrid logical clock stamping every
//!   mutation's cas.
//! - **Scheduling**: [`scheduler`], [`eviction`], [`access_log`],
//!   [`purge`] — the lane-based task pool and the background sweeps that
//!   run on it.

pub mod access_log;
pub mod bloom;
pub mod bucket;
pub mod checkpoint;
pub mod clock;
pub mod collections;
pub mod config;
pub mod dcp;
pub mod error;
pub mod eviction;
pub mod failover;
pub mod flusher;
pub mod hash_table;
pub mod health;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod partition;
pub mod purge;
pub mod scheduler;
pub mod store;
pub mod value;

pub use crate::bucket::Bucket;
pub use crate::checkpoint::{CheckpointManager, Operation, SystemEvent, SystemEventKind};
pub use crate::clock::Hlc;
pub use crate::collections::{ClusterCollection, ClusterManifest, CollectionManifest};
pub use crate::config::EngineConfig;
pub use crate::error::{EngineError, Result};
pub use crate::failover::{FailoverEntry, FailoverTable};
pub use crate::key::{Namespace, StoredKey};
pub use crate::partition::{MutationStamp, Partition, PartitionState};
pub use crate::value::{ConflictResMode, Datatype, StoredValue};
