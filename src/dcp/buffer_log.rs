//! Per-connection flow control (spec.md §4.6). Mirrors the traffic a DCP
//! producer has sent but not yet had acknowledged by the consumer.

use parking_lot::RwLock;

/// The three flow-control states a connection can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLogState {
    /// Flow control is off; every insert succeeds.
    Disabled,
    /// `bytes_sent < max_bytes`; the producer may keep sending.
    SpaceAvailable,
    /// `bytes_sent >= max_bytes`; the producer must pause until acked.
    Full,
}

struct Inner {
    max_bytes: u64,
    bytes_sent: u64,
}

/// Tracks unacknowledged bytes sent down one replication connection.
pub struct BufferLog {
    inner: RwLock<Option<Inner>>,
}

impl BufferLog {
    /// A disabled log (no flow control).
    pub fn disabled() -> Self {
        Self { inner: RwLock::new(None) }
    }

    /// A log enforcing `max_bytes` of unacknowledged data in flight.
    pub fn enabled(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Some(Inner { max_bytes, bytes_sent: 0 })),
        }
    }

    /// Current state.
    pub fn state(&self) -> BufferLogState {
        match &*self.inner.read() {
            None => BufferLogState::Disabled,
            Some(inner) if inner.bytes_sent < inner.max_bytes => BufferLogState::SpaceAvailable,
            Some(_) => BufferLogState::Full,
        }
    }

    /// Attempts to account for `len` bytes about to be sent. Returns
    /// `true` if the insert is admitted (flow control disabled, or the
    /// connection still has headroom).
    pub fn insert(&self, len: u64) -> bool {
        let mut guard = self.inner.write();
        match &mut *guard {
            None => true,
            Some(inner) => {
                if inner.bytes_sent < inner.max_bytes {
                    inner.bytes_sent += len;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Applies a `bufferAcknowledgement(bytes)`, returning `true` if this
    /// ack moved the connection from `Full` back to `SpaceAvailable` (the
    /// producer should be woken).
    pub fn acknowledge(&self, bytes: u64) -> bool {
        let mut guard = self.inner.write();
        match &mut *guard {
            None => false,
            Some(inner) => {
                let was_full = inner.bytes_sent >= inner.max_bytes;
                inner.bytes_sent = inner.bytes_sent.saturating_sub(bytes);
                was_full && inner.bytes_sent < inner.max_bytes
            }
        }
    }
}
