//! Error taxonomy for FlowKV operations.
//!
//! All public APIs return `Result<T, EngineError>`. The variants mirror the
//! client- and replica-visible status codes of the engine: callers never see
//! a raw I/O or lock-poisoning error, only one of these.

use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Client- and replica-visible error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// An `add` or a cas-checked mutation found the key already present.
    #[error("key already exists")]
    KeyExists,

    /// The partition is not owned by this node (state is `dead`, or the
    /// partition id is not hosted at all).
    #[error("not my vbucket")]
    NotMyVbucket,

    /// The key's collection is not open on this partition.
    #[error("unknown collection")]
    UnknownCollection,

    /// The partition is `pending`; caller should retry once activated.
    #[error("would block")]
    WouldBlock,

    /// Transient failure: memory pressure, takeover backlog, or a held
    /// soft lock. Caller should retry.
    #[error("temporary failure: {0}")]
    TmpFail(String),

    /// Hard out-of-memory: the mutation was rejected.
    #[error("out of memory")]
    NoMemory,

    /// A caller-supplied argument violates a documented constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A partition id outside `[0, num_vbuckets)`.
    #[error("partition id out of range: {0}")]
    OutOfRange(u16),

    /// I/O error surfaced from the document store collaborator.
    #[error("I/O error: {0}")]
    Io(String),

    /// Corruption detected in a persisted structure (WAL frame, manifest,
    /// metadata record).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Catch-all for conditions that should be unreachable in correct
    /// operation.
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Safely acquires a mutex, converting poisoning into `EngineError::Corruption`
/// instead of panicking. Used wherever a lock is taken on a path a client
/// request can reach.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("lock poisoned - a prior panic left shared state inconsistent");
        EngineError::Corruption("lock poisoned".into())
    })
}
