//! Active (producer-side) replication stream: spec.md §4.6.

use crate::checkpoint::{Operation, SystemEvent, VBucketState};
use crate::dcp::buffer_log::BufferLog;
use crate::dcp::wire::{snapshot_flags, DcpMessage, StreamEndFlag};
use crate::error::{EngineError, Result};
use crate::key::Namespace;
use crate::partition::Partition;
use crate::store::{BackfillRecord, DocumentStore};
use crate::value::StoredValue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Producer-side stream state machine (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Not yet requested.
    Uninitialised,
    /// `streamRequest` accepted, awaiting the first `step`.
    Pending,
    /// Catching up from the document store.
    Backfilling,
    /// Draining the live checkpoint cursor.
    InMemory,
    /// Takeover handoff: draining remaining in-memory items before the
    /// `SetVBucketState(pending)` marker.
    TakeoverSend,
    /// Takeover handoff: `SetVBucketState(pending)` sent, awaiting ack.
    TakeoverWait,
    /// Terminated.
    Dead,
}

fn vbucket_state_to_u8(state: VBucketState) -> u8 {
    match state {
        VBucketState::Active => 0,
        VBucketState::Replica => 1,
        VBucketState::Pending => 2,
        VBucketState::Dead => 3,
    }
}

fn to_mutation(sv: &Arc<StoredValue>, by_seqno: i64) -> DcpMessage {
    DcpMessage::Mutation {
        key: sv.key.bytes.clone(),
        value: sv.value().unwrap_or_default(),
        cas: sv.cas.load(std::sync::atomic::Ordering::Acquire),
        by_seqno,
        rev_seqno: sv.rev_seqno.load(std::sync::atomic::Ordering::Acquire),
        flags: sv.flags,
        exptime: sv.exptime.load(std::sync::atomic::Ordering::Acquire),
        lock: false,
    }
}

fn to_deletion(sv: &Arc<StoredValue>, by_seqno: i64) -> DcpMessage {
    DcpMessage::Deletion {
        key: sv.key.bytes.clone(),
        cas: sv.cas.load(std::sync::atomic::Ordering::Acquire),
        by_seqno,
        rev_seqno: sv.rev_seqno.load(std::sync::atomic::Ordering::Acquire),
    }
}

/// Rebuilds a mutation/deletion message from a document already expired
/// from the in-memory checkpoint log. `revSeqno` is not retained by the
/// document store (spec.md §6.2's metadata record has no such field), so
/// backfilled messages always carry `rev_seqno: 0`; a consumer using
/// revision-seqno conflict resolution against a backfilled stream loses
/// that tie-break input.
fn backfill_to_message(record: BackfillRecord) -> DcpMessage {
    match record.value {
        Some(value) => DcpMessage::Mutation {
            key: record.key.bytes,
            value,
            cas: record.metadata.cas,
            by_seqno: record.by_seqno,
            rev_seqno: 0,
            flags: record.metadata.flags,
            exptime: record.metadata.exptime,
            lock: false,
        },
        None => DcpMessage::Deletion {
            key: record.key.bytes,
            cas: record.metadata.cas,
            by_seqno: record.by_seqno,
            rev_seqno: 0,
        },
    }
}

fn to_system_event(vbucket: u16, event: &SystemEvent, by_seqno: i64) -> DcpMessage {
    DcpMessage::SystemEvent {
        kind: event.kind,
        vbucket,
        by_seqno,
        key: event.collection.clone(),
        data: event.revision.to_le_bytes().to_vec(),
    }
}

/// One outbound replication stream for a single partition.
pub struct ActiveStream<'p> {
    partition: &'p Partition,
    cursor_name: String,
    /// `None` once the cursor has been registered; guards against
    /// double-registration on a re-`streamRequest`.
    phase: Mutex<StreamPhase>,
    pending_snapshot_start: Mutex<Option<i64>>,
    /// The document store backing the Backfill phase's scan of data the
    /// checkpoint log may have already expired (spec.md §4.6).
    store: Arc<dyn DocumentStore>,
    /// Highest seqno the Backfill phase has scanned through so far.
    backfill_progress: Mutex<i64>,
    /// `noopInterval` (spec.md §4.6): a NOOP is due once this much time has
    /// passed with no other traffic on the stream.
    noop_interval: Duration,
    /// Last time `step` emitted anything, or a NOOP was acked.
    last_traffic: Mutex<Instant>,
    /// An outstanding, unacked NOOP's opaque and send time, if any.
    pending_noop: Mutex<Option<(u32, Instant)>>,
    next_noop_opaque: AtomicU32,
    /// Flow control for this connection.
    pub buffer_log: BufferLog,
}

/// Bounded batch size for one backfill scan within a single `step`.
const BACKFILL_BATCH: usize = 256;

impl<'p> ActiveStream<'p> {
    /// Builds a stream against `partition`, not yet requested. `store` is
    /// consulted by the Backfill phase for data no longer resident in the
    /// checkpoint log. `noop_interval` should come from
    /// `EngineConfig::dcp_noop_interval_ms`.
    pub fn new(
        partition: &'p Partition,
        connection_name: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        noop_interval: Duration,
        buffer_log: BufferLog,
    ) -> Self {
        Self {
            partition,
            cursor_name: connection_name.into(),
            phase: Mutex::new(StreamPhase::Uninitialised),
            pending_snapshot_start: Mutex::new(None),
            store,
            backfill_progress: Mutex::new(0),
            noop_interval,
            last_traffic: Mutex::new(Instant::now()),
            pending_noop: Mutex::new(None),
            next_noop_opaque: AtomicU32::new(1),
            buffer_log,
        }
    }

    /// Emits a fresh `DcpMessage::Noop` if no other traffic has occurred in
    /// `noop_interval` and one isn't already outstanding; the caller sends
    /// it and should route the consumer's `Noop` reply to
    /// [`ActiveStream::ack_noop`]. Call this on every poll tick alongside
    /// [`ActiveStream::step`].
    pub fn maybe_noop(&self) -> Option<DcpMessage> {
        let mut pending = self.pending_noop.lock();
        if pending.is_some() {
            return None;
        }
        if self.last_traffic.lock().elapsed() < self.noop_interval {
            return None;
        }
        let opaque = self.next_noop_opaque.fetch_add(1, Ordering::Relaxed);
        *pending = Some((opaque, Instant::now()));
        Some(DcpMessage::Noop { opaque })
    }

    /// Acks a previously emitted NOOP and resets the heartbeat clock.
    pub fn ack_noop(&self, opaque: u32) {
        let mut pending = self.pending_noop.lock();
        if matches!(*pending, Some((o, _)) if o == opaque) {
            *pending = None;
        }
        *self.last_traffic.lock() = Instant::now();
    }

    /// Whether an outstanding NOOP has gone unacked for a full
    /// `noop_interval`: per spec.md §4.6 the caller must disconnect the
    /// stream (e.g. via [`ActiveStream::close`]).
    pub fn noop_timed_out(&self) -> bool {
        match *self.pending_noop.lock() {
            Some((_, sent)) => sent.elapsed() >= self.noop_interval,
            None => false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> StreamPhase {
        *self.phase.lock()
    }

    /// `streamRequest(flags, vb, start, end, vbuuid, snap_start, snap_end)`.
    /// Returns `Ok(None)` if the request is accepted and a cursor is now
    /// registered, or `Ok(Some(rollback_to))` if the caller must roll back
    /// and retry.
    pub fn stream_request(
        &self,
        start: i64,
        vbuuid: u64,
        snap_end: i64,
    ) -> Result<Option<i64>> {
        let mut phase = self.phase.lock();
        if *phase != StreamPhase::Uninitialised {
            return Err(EngineError::InvalidArgument(
                "stream already requested".into(),
            ));
        }
        match self.partition.failover().lock().validate_stream_request(vbuuid, start) {
            Ok(()) => {}
            Err(rollback_to) => return Ok(Some(rollback_to)),
        }
        // the successor branch's start-seqno bounds how much of the
        // requested snapshot we can actually still serve.
        let failover = self.partition.failover().lock();
        if let Some(pos) = failover.entries().iter().position(|e| e.uuid == vbuuid) {
            if let Some(next) = failover.entries().get(pos + 1) {
                if next.start_seqno < snap_end {
                    return Ok(Some(next.start_seqno));
                }
            }
        }
        drop(failover);

        self.partition.checkpoints().lock().register_cursor(self.cursor_name.clone());
        *self.backfill_progress.lock() = start;
        *phase = if start == 0 {
            StreamPhase::Backfilling
        } else {
            StreamPhase::InMemory
        };
        Ok(None)
    }

    /// Scans the document store for the gap between `backfill_progress`
    /// and the checkpoint log's oldest retained seqno, converting each
    /// record into a wire message. Returns `(messages, caught_up)`.
    ///
    /// `Namespace::System` keys are skipped: they are synthetic collection
    /// markers already represented on this stream via the checkpoint log's
    /// `SystemEvent` path, not real backfillable documents.
    fn backfill_from_store(&self) -> (Vec<DcpMessage>, bool) {
        let boundary = self.partition.checkpoints().lock().oldest_retained_seqno();
        let mut progress = self.backfill_progress.lock();
        if *progress >= boundary {
            return (Vec::new(), true);
        }

        let records = self.store.scan_by_seqno(self.partition.id, *progress, boundary, BACKFILL_BATCH);
        if records.is_empty() {
            *progress = boundary;
            return (Vec::new(), true);
        }

        let snap_start = *progress;
        let mut snap_end = snap_start;
        let mut body = Vec::new();
        for record in records {
            if record.key.namespace == Namespace::System {
                snap_end = snap_end.max(record.by_seqno);
                continue;
            }
            snap_end = snap_end.max(record.by_seqno);
            body.push(backfill_to_message(record));
        }
        *progress = snap_end.max(*progress);
        let caught_up = *progress >= boundary;
        drop(progress);

        if body.is_empty() {
            return (Vec::new(), caught_up);
        }
        let mut out = vec![DcpMessage::SnapshotMarker {
            start: snap_start.max(0),
            end: snap_end,
            flags: snapshot_flags::DISK,
        }];
        out.append(&mut body);
        (out, caught_up)
    }

    /// Drains up to `max_items` queued items into wire messages, batched
    /// one checkpoint at a time: a `SnapshotMarker` precedes the
    /// mutations/deletions/system-events it covers. While in the Backfill
    /// phase, first catches the stream up from the document store before
    /// falling through to draining the live checkpoint cursor.
    pub fn step(&self, max_items: usize) -> Vec<DcpMessage> {
        {
            let phase = self.phase.lock();
            if !matches!(
                *phase,
                StreamPhase::Backfilling | StreamPhase::InMemory | StreamPhase::TakeoverSend
            ) {
                return Vec::new();
            }
        }

        let mut out = Vec::new();

        if *self.phase.lock() == StreamPhase::Backfilling {
            let (mut backfilled, caught_up) = self.backfill_from_store();
            out.append(&mut backfilled);
            if caught_up {
                *self.phase.lock() = StreamPhase::InMemory;
            } else {
                let out: Vec<DcpMessage> =
                    out.into_iter().filter(|m| self.buffer_log.insert(estimate_size(m))).collect();
                if !out.is_empty() {
                    *self.last_traffic.lock() = Instant::now();
                }
                return out;
            }
        }

        let mut body = Vec::new();
        let mut snapshot_start = self.pending_snapshot_start.lock();
        let mut snapshot_end = snapshot_start.unwrap_or(0);

        for _ in 0..max_items {
            let next = self.partition.checkpoints().lock().next_for_cursor(&self.cursor_name);
            let Some((checkpoint_id, item_index, by_seqno)) = next else {
                break;
            };
            let operation = self
                .partition
                .checkpoints()
                .lock()
                .get_item(checkpoint_id, item_index)
                .map(|item| item.operation.clone());
            let Some(operation) = operation else { continue };

            match operation {
                Operation::CheckpointStart => {
                    *snapshot_start = Some(by_seqno);
                }
                Operation::CheckpointEnd => {
                    snapshot_end = by_seqno;
                    let start = snapshot_start.take().unwrap_or(snapshot_end);
                    out.push(DcpMessage::SnapshotMarker {
                        start,
                        end: snapshot_end,
                        flags: snapshot_flags::MEMORY,
                    });
                    out.append(&mut body);
                }
                Operation::Set(sv) => {
                    snapshot_end = snapshot_end.max(by_seqno);
                    body.push(to_mutation(&sv, by_seqno));
                }
                Operation::Del(sv) => {
                    snapshot_end = snapshot_end.max(by_seqno);
                    body.push(to_deletion(&sv, by_seqno));
                }
                Operation::SystemEvent(event) => {
                    snapshot_end = snapshot_end.max(by_seqno);
                    body.push(to_system_event(self.partition.id, &event, by_seqno));
                }
                Operation::SetVBucketState(state) => {
                    body.push(DcpMessage::SetVBucketState { state: vbucket_state_to_u8(state) });
                }
                Operation::Flush | Operation::Empty => {}
            }
        }

        // Flush a still-open batch against the checkpoint's live tail so a
        // partial drain (hit `max_items` before `CheckpointEnd`) is still
        // observed by the consumer.
        if !body.is_empty() {
            let start = snapshot_start.unwrap_or(snapshot_end);
            out.push(DcpMessage::SnapshotMarker { start, end: snapshot_end, flags: snapshot_flags::MEMORY });
            out.append(&mut body);
        }

        let out: Vec<DcpMessage> = out.into_iter().filter(|m| self.buffer_log.insert(estimate_size(m))).collect();
        if !out.is_empty() {
            *self.last_traffic.lock() = Instant::now();
        }
        out
    }

    /// Begins takeover handoff: subsequent `step` calls drain any
    /// remaining items, then the caller should call
    /// [`ActiveStream::finish_takeover`].
    pub fn begin_takeover(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != StreamPhase::InMemory {
            return Err(EngineError::InvalidArgument(
                "takeover only valid from the in-memory phase".into(),
            ));
        }
        *phase = StreamPhase::TakeoverSend;
        Ok(())
    }

    /// Emits the `SetVBucketState(pending)` marker and waits for ack;
    /// once the caller observes the ack it should call
    /// [`ActiveStream::complete_takeover`].
    pub fn send_takeover_marker(&self) -> Result<DcpMessage> {
        let mut phase = self.phase.lock();
        if *phase != StreamPhase::TakeoverSend {
            return Err(EngineError::InvalidArgument(
                "takeover marker sent out of order".into(),
            ));
        }
        *phase = StreamPhase::TakeoverWait;
        Ok(DcpMessage::SetVBucketState {
            state: vbucket_state_to_u8(VBucketState::Pending),
        })
    }

    /// Called once the consumer acks the takeover marker: demotes the
    /// source partition to `dead` and ends the stream.
    pub fn complete_takeover(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != StreamPhase::TakeoverWait {
            return Err(EngineError::InvalidArgument(
                "takeover completed out of order".into(),
            ));
        }
        self.partition.transition_to(crate::partition::PartitionState::Dead)?;
        *phase = StreamPhase::Dead;
        Ok(())
    }

    /// Ends the stream with `reason` (consumer close, disconnect, ...).
    pub fn close(&self, reason: StreamEndFlag) -> DcpMessage {
        *self.phase.lock() = StreamPhase::Dead;
        DcpMessage::StreamEnd { reason }
    }
}

fn estimate_size(msg: &DcpMessage) -> u64 {
    match msg {
        DcpMessage::Mutation { key, value, .. } => (key.len() + value.len() + 32) as u64,
        DcpMessage::Deletion { key, .. } => (key.len() + 32) as u64,
        _ => 32,
    }
}
