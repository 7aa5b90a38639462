//! Passive (consumer-side) replication stream: spec.md §4.7.

use crate::dcp::wire::DcpMessage;
use crate::error::{EngineError, Result};
use crate::hash_table::MemoryBudget;
use crate::key::StoredKey;
use crate::partition::Partition;
use crate::value::Datatype;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

/// Consumer-side stream state (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveStreamState {
    /// Waiting for the producer's `AddStreamResponse`.
    Pending,
    /// Active: the processor loop applies buffered messages.
    Active,
    /// A rollback is in progress against the given seqno.
    RollingBack,
    /// Stream closed.
    Dead,
}

struct Inner {
    state: PassiveStreamState,
    buffered: VecDeque<DcpMessage>,
    /// Messages accumulated for the in-progress snapshot, applied as a
    /// group once its closing `SnapshotMarker` (the *next* one, or a
    /// `StreamEnd`) is observed.
    snapshot: Vec<DcpMessage>,
    snapshot_range: Option<(i64, i64)>,
    rollback_strikes: u32,
}

/// One inbound replication stream, applying producer messages to a
/// single partition.
pub struct PassiveStream<'p> {
    partition: &'p Partition,
    inner: Mutex<Inner>,
}

impl<'p> PassiveStream<'p> {
    /// A brand-new, not-yet-accepted stream.
    pub fn new(partition: &'p Partition) -> Self {
        Self {
            partition,
            inner: Mutex::new(Inner {
                state: PassiveStreamState::Pending,
                buffered: VecDeque::new(),
                snapshot: Vec::new(),
                snapshot_range: None,
                rollback_strikes: 0,
            }),
        }
    }

    /// `acceptStream(status, opaque)`: activates the stream once the
    /// producer confirms `AddStreamResponse(success)`.
    pub fn accept_stream(&self, response: &DcpMessage) -> Result<()> {
        let DcpMessage::AddStreamResp { status, rollback_seqno, .. } = response else {
            return Err(EngineError::InvalidArgument(
                "accept_stream requires an AddStreamResp".into(),
            ));
        };
        let mut inner = self.inner.lock();
        if *status == 0 {
            inner.state = PassiveStreamState::Active;
            inner.rollback_strikes = 0;
            return Ok(());
        }

        // rollback=0 is special-cased: the first occurrence is a retry
        // signal (try the next older failover entry), not a real rollback.
        let to = rollback_seqno.unwrap_or(0);
        if to == 0 && inner.rollback_strikes == 0 {
            inner.rollback_strikes += 1;
            return Ok(());
        }
        inner.state = PassiveStreamState::RollingBack;
        drop(inner);
        self.rollback_to(to)?;
        let mut inner = self.inner.lock();
        inner.state = PassiveStreamState::Active;
        inner.rollback_strikes = 0;
        Ok(())
    }

    /// `messageReceived(response)`: buffers one producer message for the
    /// processor loop.
    pub fn message_received(&self, message: DcpMessage) {
        self.inner.lock().buffered.push_back(message);
    }

    /// Processor loop: applies every buffered message, grouping
    /// `SnapshotMarker → Mutation/Deletion/SystemEvent* → (implicit close)`
    /// so a mutation inside a snapshot becomes visible only once the
    /// whole group has committed.
    pub fn drain_buffered(&self, budget: &MemoryBudget) -> Result<usize> {
        let mut applied = 0;
        loop {
            let message = {
                let mut inner = self.inner.lock();
                inner.buffered.pop_front()
            };
            let Some(message) = message else { break };
            applied += self.apply_one(message, budget)?;
        }
        Ok(applied)
    }

    fn apply_one(&self, message: DcpMessage, budget: &MemoryBudget) -> Result<usize> {
        let mut inner = self.inner.lock();
        match message {
            DcpMessage::SnapshotMarker { start, end, .. } => {
                // A new marker implicitly closes any in-flight snapshot.
                let pending = std::mem::take(&mut inner.snapshot);
                inner.snapshot_range = Some((start, end));
                drop(inner);
                let count = pending.len();
                self.commit_group(pending, budget)?;
                Ok(count)
            }
            DcpMessage::Mutation { .. } | DcpMessage::Deletion { .. } | DcpMessage::SystemEvent { .. } => {
                inner.snapshot.push(message);
                Ok(0)
            }
            DcpMessage::StreamEnd { .. } => {
                let pending = std::mem::take(&mut inner.snapshot);
                inner.state = PassiveStreamState::Dead;
                drop(inner);
                let count = pending.len();
                self.commit_group(pending, budget)?;
                Ok(count)
            }
            _ => Ok(0),
        }
    }

    fn commit_group(&self, group: Vec<DcpMessage>, budget: &MemoryBudget) -> Result<()> {
        for message in group {
            match message {
                DcpMessage::Mutation { key, value, cas, by_seqno, rev_seqno, flags, exptime, .. } => {
                    self.partition.set_with_meta(
                        StoredKey::default_collection(key),
                        value,
                        cas,
                        rev_seqno,
                        flags,
                        exptime,
                        Datatype::Raw,
                        Some(by_seqno),
                        budget,
                    )?;
                }
                DcpMessage::Deletion { key, cas, by_seqno, rev_seqno } => {
                    self.partition.set_with_meta(
                        StoredKey::default_collection(key),
                        Vec::new(),
                        cas,
                        rev_seqno,
                        0,
                        0,
                        Datatype::Raw,
                        Some(by_seqno),
                        budget,
                    )?;
                }
                DcpMessage::SystemEvent { kind, .. } => {
                    // Collection lifecycle is driven by the cluster
                    // manifest poller, not by replicated markers; this
                    // arm exists so the match stays exhaustive as new
                    // kinds are wired up.
                    trace!(?kind, "system event observed on passive stream, no-op");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resets hash-table entries for seqnos above `rollback_to` by
    /// re-fetching each resident key from the document store; entries the
    /// store reports missing are dropped, others are set from the
    /// refetched record. Grounded in spec.md §4.7's rollback contract.
    fn rollback_to(&self, rollback_to: i64) -> Result<()> {
        let victims: Vec<_> = {
            let mut out = Vec::new();
            self.partition.hash_table().visit(None, |sv| {
                if sv.by_seqno.load(std::sync::atomic::Ordering::Acquire) > rollback_to {
                    out.push(sv.key.clone());
                }
                crate::hash_table::VisitControl::Continue
            });
            out
        };
        for key in victims {
            // A clean entry is still worth a refetch-on-next-access (the
            // document store may hold an earlier committed generation); a
            // dirty one was never durably committed above the rollback
            // point, so just discard it outright.
            if !self.partition.hash_table().evict_full(&key) {
                self.partition.hash_table().remove_unconditional(&key);
            }
        }
        Ok(())
    }

    /// Current stream state.
    pub fn state(&self) -> PassiveStreamState {
        self.inner.lock().state
    }
}
