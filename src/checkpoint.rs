//! Checkpoint log: the durable ordering boundary between mutations and
//! their persistence / replication (spec.md §4.2).

use crate::key::StoredKey;
use crate::value::StoredValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Five-kind discriminator for collection lifecycle markers (spec.md §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    /// A collection was created.
    CreateCollection,
    /// A collection delete began (purge not yet complete).
    BeginDeleteCollection,
    /// A collection's purge finished with nothing re-added.
    DeleteCollectionHard,
    /// A collection's purge finished, but it was already re-created.
    DeleteCollectionSoft,
    /// The manifest's key separator changed.
    CollectionsSeparatorChanged,
}

/// A system-event payload: a collection name plus the manifest revision
/// that produced it.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    /// Which lifecycle transition this marks.
    pub kind: SystemEventKind,
    /// Affected collection name.
    pub collection: Vec<u8>,
    /// Manifest revision this event corresponds to.
    pub revision: u64,
}

/// vbucket states a `SetVBucketState` item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    /// Accepting client reads/writes.
    Active,
    /// Accepting replication ingest only.
    Replica,
    /// Parked, not yet activated.
    Pending,
    /// No longer serving this partition.
    Dead,
}

/// The operation a [`QueuedItem`] carries.
#[derive(Debug, Clone)]
pub enum Operation {
    /// A mutation (including undelete): carries the new value.
    Set(Arc<StoredValue>),
    /// A soft delete: value optional (tombstone may still carry one).
    Del(Arc<StoredValue>),
    /// Wipe-all-data marker.
    Flush,
    /// No-op filler, e.g. for alignment in the backfill stream.
    Empty,
    /// Marks the start of a checkpoint.
    CheckpointStart,
    /// Marks the end of a checkpoint.
    CheckpointEnd,
    /// A vbucket state transition.
    SetVBucketState(VBucketState),
    /// A collection lifecycle marker.
    SystemEvent(SystemEvent),
}

impl Operation {
    /// The key this operation collapses on, if any (only `Set`/`Del` ever
    /// collapse an earlier entry for the same key).
    fn collapse_key(&self) -> Option<&StoredKey> {
        match self {
            Operation::Set(sv) | Operation::Del(sv) => Some(&sv.key),
            _ => None,
        }
    }

    /// Whether this operation forces the checkpoint boundary: the open
    /// checkpoint closes and a fresh one begins around it.
    fn forces_boundary(&self) -> bool {
        matches!(self, Operation::SetVBucketState(_) | Operation::SystemEvent(_))
    }
}

/// An entry in the checkpoint log.
#[derive(Debug)]
pub struct QueuedItem {
    /// The operation itself.
    pub operation: Operation,
    /// Order stamp assigned at enqueue (or supplied by replica ingest).
    pub by_seqno: i64,
    /// Whether a later write to the same key collapsed this entry. A
    /// collapsed entry is skipped by cursors but kept in place so other
    /// cursors' positions stay valid indices.
    collapsed: AtomicBool,
}

impl QueuedItem {
    fn new(operation: Operation, by_seqno: i64) -> Self {
        Self {
            operation,
            by_seqno,
            collapsed: AtomicBool::new(false),
        }
    }

    /// Whether a later write superseded this entry before any cursor read it.
    pub fn is_collapsed(&self) -> bool {
        self.collapsed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointState {
    Open,
    Closed,
}

/// A numbered, ordered segment of [`QueuedItem`]s.
pub struct Checkpoint {
    /// Monotonically increasing checkpoint id.
    pub id: u64,
    state: CheckpointState,
    items: Vec<QueuedItem>,
    /// Last live (non-collapsed) index per key, for the collapse rule.
    key_index: HashMap<StoredKey, usize>,
    bytes: usize,
}

impl Checkpoint {
    fn new(id: u64, by_seqno: i64) -> Self {
        let mut cp = Self {
            id,
            state: CheckpointState::Open,
            items: Vec::new(),
            key_index: HashMap::new(),
            bytes: 0,
        };
        cp.items.push(QueuedItem::new(Operation::CheckpointStart, by_seqno));
        cp
    }

    /// Items in insertion order, including collapsed ones (callers filter).
    pub fn items(&self) -> &[QueuedItem] {
        &self.items
    }

    /// Whether this checkpoint has been closed (no further enqueues).
    pub fn is_closed(&self) -> bool {
        self.state == CheckpointState::Closed
    }
}

/// A named read cursor into the checkpoint log (persistence cursor, a
/// per-replica DCP cursor, ...). Observes items strictly once, in order.
#[derive(Debug, Clone, Copy)]
struct CursorPos {
    checkpoint_id: u64,
    item_index: usize,
}

/// Opaque resume token for a named cursor (see
/// [`CheckpointManager::cursor_token`] / [`CheckpointManager::restore_cursor`]).
#[derive(Debug, Clone, Copy)]
pub struct CursorToken(CursorPos);

/// Owns the ordered sequence of checkpoints for one partition and every
/// named cursor reading from it.
pub struct CheckpointManager {
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, CursorPos>,
    next_checkpoint_id: AtomicI64,
    next_by_seqno: AtomicI64,
    max_items: usize,
    max_bytes: usize,
}

/// Rough per-item byte estimate used against `checkpoint_max_bytes`; the
/// real commit path measures actual serialized size, this just bounds
/// in-memory growth of the open checkpoint.
const ITEM_BYTE_ESTIMATE: usize = 64;

impl CheckpointManager {
    /// Creates a manager seeded at `initial_seqno` (the partition's
    /// persisted `lastSeqno` on warmup, or 0 for a brand-new partition).
    pub fn new(initial_seqno: i64, max_items: usize, max_bytes: usize) -> Self {
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(0, initial_seqno));
        Self {
            checkpoints,
            cursors: HashMap::new(),
            next_checkpoint_id: AtomicI64::new(1),
            next_by_seqno: AtomicI64::new(initial_seqno + 1),
            max_items,
            max_bytes,
        }
    }

    fn alloc_seqno(&self, preassigned: Option<i64>) -> i64 {
        match preassigned {
            Some(s) => {
                // Replica ingest: keep our generator ahead of any
                // pre-assigned seqno we've now observed.
                let mut cur = self.next_by_seqno.load(Ordering::Acquire);
                while cur <= s {
                    match self.next_by_seqno.compare_exchange_weak(
                        cur,
                        s + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(observed) => cur = observed,
                    }
                }
                s
            }
            None => self.next_by_seqno.fetch_add(1, Ordering::AcqRel),
        }
    }

    /// Id of the currently-open checkpoint.
    pub fn open_checkpoint_id(&self) -> u64 {
        self.checkpoints.back().expect("always has an open checkpoint").id
    }

    fn open_mut(&mut self) -> &mut Checkpoint {
        self.checkpoints.back_mut().expect("always has an open checkpoint")
    }

    /// Whether a cursor currently positioned in `checkpoint_id` has
    /// already delivered the item at `item_index` (i.e. collapsing it now
    /// would un-deliver a promise already made).
    fn already_passed(&self, checkpoint_id: u64, item_index: usize) -> bool {
        self.cursors
            .values()
            .any(|c| c.checkpoint_id == checkpoint_id && c.item_index > item_index)
    }

    /// Enqueues a mutation (`Set`/`Del` carried inside `operation`),
    /// applying the collapse rule, and returns the assigned seqno.
    /// `preassigned_seqno` lets replica ingest supply its own order stamp.
    pub fn enqueue_mutation(&mut self, operation: Operation, preassigned_seqno: Option<i64>) -> i64 {
        debug_assert!(!operation.forces_boundary());
        let seqno = self.alloc_seqno(preassigned_seqno);
        let key = operation.collapse_key().cloned();

        let checkpoint_id = self.open_checkpoint_id();
        if let Some(ref key) = key {
            let earlier = self
                .checkpoints
                .back()
                .unwrap()
                .key_index
                .get(key)
                .copied();
            if let Some(earlier_idx) = earlier {
                if !self.already_passed(checkpoint_id, earlier_idx) {
                    self.checkpoints.back().unwrap().items[earlier_idx]
                        .collapsed
                        .store(true, Ordering::Release);
                }
            }
        }

        let cp = self.open_mut();
        let new_idx = cp.items.len();
        cp.items.push(QueuedItem::new(operation, seqno));
        cp.bytes += ITEM_BYTE_ESTIMATE;
        if let Some(key) = key {
            cp.key_index.insert(key, new_idx);
        }

        self.maybe_close_for_limits();
        seqno
    }

    /// Enqueues a forced-boundary item (`SetVBucketState` or
    /// `SystemEvent`): closes the current checkpoint, opens a new one,
    /// then places the item as the first real entry of the new checkpoint.
    pub fn enqueue_forced(&mut self, operation: Operation) -> i64 {
        debug_assert!(operation.forces_boundary());
        self.close_open_checkpoint();
        let seqno = self.alloc_seqno(None);
        let cp = self.open_mut();
        cp.items.push(QueuedItem::new(operation, seqno));
        cp.bytes += ITEM_BYTE_ESTIMATE;
        seqno
    }

    fn maybe_close_for_limits(&mut self) {
        let cp = self.checkpoints.back().unwrap();
        if cp.items.len() >= self.max_items || cp.bytes >= self.max_bytes {
            self.close_open_checkpoint();
        }
    }

    /// Closes the current open checkpoint (appending `CheckpointEnd`) and
    /// opens a fresh one (beginning with `CheckpointStart`).
    pub fn close_open_checkpoint(&mut self) {
        let end_seqno = self.next_by_seqno.load(Ordering::Acquire) - 1;
        let cp = self.open_mut();
        cp.items.push(QueuedItem::new(Operation::CheckpointEnd, end_seqno.max(0)));
        cp.state = CheckpointState::Closed;

        let new_id = self.next_checkpoint_id.fetch_add(1, Ordering::AcqRel) as u64;
        self.checkpoints
            .push_back(Checkpoint::new(new_id, end_seqno.max(0)));
    }

    /// Registers a new named cursor starting at the oldest retained
    /// checkpoint's first item (a fresh persistence cursor on warmup, or
    /// a new replica stream's cursor).
    pub fn register_cursor(&mut self, name: impl Into<String>) {
        let checkpoint_id = self.checkpoints.front().expect("non-empty log").id;
        self.cursors.insert(
            name.into(),
            CursorPos {
                checkpoint_id,
                item_index: 0,
            },
        );
    }

    /// Advances `name`'s cursor to the next non-collapsed item, returning
    /// it, or `None` if the cursor has caught up to the open checkpoint's
    /// tail.
    pub fn next_for_cursor(&mut self, name: &str) -> Option<(u64, usize, i64)> {
        loop {
            let pos = *self.cursors.get(name)?;
            let cp_pos_in_deque = self
                .checkpoints
                .iter()
                .position(|c| c.id == pos.checkpoint_id)?;
            let cp = &self.checkpoints[cp_pos_in_deque];

            if pos.item_index >= cp.items.len() {
                // Exhausted this checkpoint; advance to the next if any.
                if cp_pos_in_deque + 1 < self.checkpoints.len() {
                    let next_id = self.checkpoints[cp_pos_in_deque + 1].id;
                    self.cursors.insert(
                        name.to_string(),
                        CursorPos {
                            checkpoint_id: next_id,
                            item_index: 0,
                        },
                    );
                    continue;
                }
                return None;
            }

            let item = &cp.items[pos.item_index];
            let by_seqno = item.by_seqno;
            let was_collapsed = item.is_collapsed();
            self.cursors.insert(
                name.to_string(),
                CursorPos {
                    checkpoint_id: pos.checkpoint_id,
                    item_index: pos.item_index + 1,
                },
            );
            if was_collapsed {
                continue;
            }
            return Some((pos.checkpoint_id, pos.item_index, by_seqno));
        }
    }

    /// Snapshots `name`'s current read position, so the flusher can roll
    /// back to it if a commit fails after a batch has been drained.
    pub fn cursor_token(&self, name: &str) -> Option<CursorToken> {
        self.cursors.get(name).copied().map(CursorToken)
    }

    /// Restores `name`'s read position to a previously taken token.
    pub fn restore_cursor(&mut self, name: &str, token: CursorToken) {
        self.cursors.insert(name.to_string(), token.0);
    }

    /// Reads back a previously returned item by its `(checkpoint_id, index)`.
    pub fn get_item(&self, checkpoint_id: u64, item_index: usize) -> Option<&QueuedItem> {
        self.checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .and_then(|c| c.items.get(item_index))
    }

    /// The `bySeqno` of the oldest item still resident in the log (the
    /// `CheckpointStart` of the oldest retained checkpoint). Anything at or
    /// below this may already have been expired from memory by
    /// [`Self::expire_unreferenced`]; a cursor wanting data below this point
    /// must fall back to the document store.
    pub fn oldest_retained_seqno(&self) -> i64 {
        self.checkpoints
            .front()
            .expect("always has an open checkpoint")
            .items()
            .first()
            .map(|item| item.by_seqno)
            .unwrap_or(0)
    }

    /// Drops checkpoints that every registered cursor has fully passed and
    /// that are closed; keeps at least one (the open tail).
    pub fn expire_unreferenced(&mut self) {
        while self.checkpoints.len() > 1 {
            let front = &self.checkpoints[0];
            if !front.is_closed() {
                break;
            }
            let id = front.id;
            let len = front.items.len();
            let fully_passed = self
                .cursors
                .values()
                .all(|c| c.checkpoint_id != id || c.item_index >= len);
            if fully_passed {
                self.checkpoints.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StoredKey;
    use crate::value::{ConflictResMode, Datatype};

    fn value(k: &str) -> Arc<StoredValue> {
        Arc::new(StoredValue::new(
            StoredKey::default_collection(k.as_bytes().to_vec()),
            Some(b"v".to_vec()),
            1,
            0,
            0,
            Datatype::Raw,
            ConflictResMode::RevisionSeqno,
        ))
    }

    #[test]
    fn repeated_set_collapses_when_uncollected() {
        let mut mgr = CheckpointManager::new(0, 1000, 1 << 20);
        mgr.enqueue_mutation(Operation::Set(value("a")), None);
        mgr.enqueue_mutation(Operation::Set(value("a")), None);
        let cp = mgr.checkpoints.back().unwrap();
        let live: Vec<_> = cp.items().iter().filter(|i| !i.is_collapsed()).collect();
        // CheckpointStart + the second Set survive; the first Set collapsed.
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn cursor_that_already_read_entry_prevents_collapse() {
        let mut mgr = CheckpointManager::new(0, 1000, 1 << 20);
        mgr.register_cursor("persistence");
        mgr.enqueue_mutation(Operation::Set(value("a")), None);
        // Cursor reads CheckpointStart and the Set.
        mgr.next_for_cursor("persistence");
        mgr.next_for_cursor("persistence");
        mgr.enqueue_mutation(Operation::Set(value("a")), None);
        let cp = mgr.checkpoints.back().unwrap();
        let collapsed_count = cp.items().iter().filter(|i| i.is_collapsed()).count();
        assert_eq!(collapsed_count, 0, "already-delivered entry must not collapse");
    }

    #[test]
    fn forced_boundary_closes_and_reopens() {
        let mut mgr = CheckpointManager::new(0, 1000, 1 << 20);
        let before = mgr.open_checkpoint_id();
        mgr.enqueue_forced(Operation::SetVBucketState(VBucketState::Active));
        let after = mgr.open_checkpoint_id();
        assert_ne!(before, after);
    }

    #[test]
    fn cursor_reads_items_in_strict_order_across_checkpoints() {
        let mut mgr = CheckpointManager::new(0, 2, 1 << 20);
        mgr.register_cursor("persistence");
        mgr.enqueue_mutation(Operation::Set(value("a")), None);
        mgr.enqueue_mutation(Operation::Set(value("b")), None); // hits max_items, closes
        mgr.enqueue_mutation(Operation::Set(value("c")), None);

        let mut seqnos = Vec::new();
        while let Some((cp_id, idx, seqno)) = mgr.next_for_cursor("persistence") {
            if let Some(item) = mgr.get_item(cp_id, idx) {
                if matches!(item.operation, Operation::Set(_)) {
                    seqnos.push(seqno);
                }
            }
        }
        assert_eq!(seqnos, vec![1, 2, 3]);
    }

    #[test]
    fn preassigned_seqno_advances_generator() {
        let mut mgr = CheckpointManager::new(0, 1000, 1 << 20);
        let seqno = mgr.enqueue_mutation(Operation::Set(value("a")), Some(100));
        assert_eq!(seqno, 100);
        let next = mgr.enqueue_mutation(Operation::Set(value("b")), None);
        assert!(next > 100);
    }
}
