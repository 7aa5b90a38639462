//! Partition (vbucket): spec.md §4.3. Owns one shard's hash-table index,
//! checkpoint log, collection manifest, bloom filter, failover history and
//! hybrid logical clock, and interlocks all of it against the vbucket
//! state machine.

use crate::checkpoint::{CheckpointManager, Operation, SystemEvent};
use crate::clock::Hlc;
use crate::collections::CollectionManifest;
use crate::error::{EngineError, Result};
use crate::failover::FailoverTable;
use crate::hash_table::{
    AddOutcome, MemoryBudget, PartitionedHashTable, SetOutcome, WriteOrigin,
};
use crate::key::StoredKey;
use crate::value::{ConflictResMode, Datatype, StoredValue};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Vbucket lifecycle state (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Parked; not yet assigned a role. Writes block until activation.
    Pending,
    /// Serving client reads/writes.
    Active,
    /// Serving replication ingest only.
    Replica,
    /// No longer serving this partition at all.
    Dead,
}

impl PartitionState {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Replica) | (Pending, Dead)
                | (Active, Dead)
                | (Replica, Active)
                | (Replica, Pending)
        )
    }
}

/// Snapshot of a key's metadata without its value, for `getKeyStats`.
#[derive(Debug, Clone, Copy)]
pub struct KeyStats {
    /// Current compare-and-swap token.
    pub cas: i64,
    /// Client flags.
    pub flags: u32,
    /// Absolute expiry.
    pub exptime: u32,
    /// Whether the entry still awaits persistence.
    pub dirty: bool,
    /// Whether the entry is logically deleted.
    pub deleted: bool,
}

/// Result of a successful mutation: the stamps the caller echoes back to
/// the client.
#[derive(Debug, Clone, Copy)]
pub struct MutationStamp {
    /// Assigned cas.
    pub cas: i64,
    /// Assigned revision seqno.
    pub rev_seqno: u64,
    /// Assigned checkpoint order stamp.
    pub by_seqno: i64,
}

/// One partition (vbucket): spec.md §4.3.
pub struct Partition {
    /// This partition's id within its bucket.
    pub id: u16,
    state: RwLock<PartitionState>,
    hash_table: PartitionedHashTable,
    checkpoints: Mutex<CheckpointManager>,
    collections: RwLock<CollectionManifest>,
    failover: Mutex<FailoverTable>,
    clock: Hlc,
    max_cas: AtomicI64,
    purge_seqno: AtomicI64,
    conflict_res_mode: ConflictResMode,
}

impl Partition {
    /// Builds a brand-new, `Pending` partition.
    pub fn new(
        id: u16,
        hash_table_locks: usize,
        checkpoint_max_items: usize,
        checkpoint_max_bytes: usize,
        separator: impl Into<String>,
        conflict_res_mode: ConflictResMode,
        hlc_drift_ahead_us: i64,
        hlc_drift_behind_us: i64,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(PartitionState::Pending),
            hash_table: PartitionedHashTable::new(hash_table_locks),
            checkpoints: Mutex::new(CheckpointManager::new(0, checkpoint_max_items, checkpoint_max_bytes)),
            collections: RwLock::new(CollectionManifest::new(separator)),
            failover: Mutex::new(FailoverTable::new()),
            clock: Hlc::new(hlc_drift_ahead_us, hlc_drift_behind_us),
            max_cas: AtomicI64::new(0),
            purge_seqno: AtomicI64::new(0),
            conflict_res_mode,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PartitionState {
        *self.state.read()
    }

    /// Attempts a state transition; fails if not one of the allowed edges.
    pub fn transition_to(&self, next: PartitionState) -> Result<()> {
        let mut guard = self.state.write();
        if !guard.can_transition_to(next) {
            return Err(EngineError::InvalidArgument(format!(
                "illegal vbucket transition {:?} -> {:?}",
                *guard, next
            )));
        }
        *guard = next;
        Ok(())
    }

    fn guard_writable(&self) -> Result<()> {
        match *self.state.read() {
            PartitionState::Dead => Err(EngineError::NotMyVbucket),
            PartitionState::Pending => Err(EngineError::WouldBlock),
            PartitionState::Active | PartitionState::Replica => Ok(()),
        }
    }

    fn next_cas(&self) -> i64 {
        let cas = self.clock.tick_local();
        self.max_cas.fetch_max(cas, Ordering::AcqRel);
        cas
    }

    /// `set`: unconditional upsert (or cas-checked if `expected_cas` is
    /// given). Takes the partition's collection read lock for the whole
    /// span so the checkpoint ordering contract in spec.md §4.2 holds.
    pub fn set(
        &self,
        key: StoredKey,
        value: Vec<u8>,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        expected_cas: Option<i64>,
        origin: WriteOrigin,
        projected_bytes: usize,
        budget: &MemoryBudget,
    ) -> Result<MutationStamp> {
        self.guard_writable()?;
        self.check_collection(&key)?;

        if let Some(expected) = expected_cas {
            if let Some(existing) = self.hash_table.find(&key) {
                if existing.cas.load(Ordering::Acquire) != expected {
                    return Err(EngineError::KeyExists);
                }
            } else {
                return Err(EngineError::KeyNotFound);
            }
        }

        let cas = self.next_cas();
        let rev_seqno = self
            .hash_table
            .find(&key)
            .map(|sv| sv.rev_seqno.load(Ordering::Acquire) + 1)
            .unwrap_or(1);
        let sv = Arc::new(StoredValue::new(
            key,
            Some(value),
            cas,
            flags,
            exptime,
            datatype,
            self.conflict_res_mode,
        ));
        sv.rev_seqno.store(rev_seqno, Ordering::Release);

        let outcome = self.hash_table.set(sv.clone(), origin, projected_bytes, budget);
        if outcome == SetOutcome::NoMemory {
            return Err(EngineError::TmpFail("memory threshold exceeded".into()));
        }

        let by_seqno = self
            .checkpoints
            .lock()
            .enqueue_mutation(Operation::Set(sv), None);

        Ok(MutationStamp { cas, rev_seqno, by_seqno })
    }

    /// `add`: insert-if-absent.
    pub fn add(
        &self,
        key: StoredKey,
        value: Vec<u8>,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        origin: WriteOrigin,
        projected_bytes: usize,
        budget: &MemoryBudget,
        full_eviction: bool,
    ) -> Result<MutationStamp> {
        self.guard_writable()?;
        self.check_collection(&key)?;

        let cas = self.next_cas();
        let sv = Arc::new(StoredValue::new(
            key,
            Some(value),
            cas,
            flags,
            exptime,
            datatype,
            self.conflict_res_mode,
        ));

        match self
            .hash_table
            .add(sv.clone(), origin, projected_bytes, budget, full_eviction)
        {
            AddOutcome::Success | AddOutcome::Undeleted => {
                let by_seqno = self
                    .checkpoints
                    .lock()
                    .enqueue_mutation(Operation::Set(sv), None);
                Ok(MutationStamp { cas, rev_seqno: 1, by_seqno })
            }
            AddOutcome::Exists => Err(EngineError::KeyExists),
            AddOutcome::NoMemory => Err(EngineError::TmpFail("memory threshold exceeded".into())),
            AddOutcome::BgFetch | AddOutcome::TmpBgFetch => {
                Err(EngineError::TmpFail("background fetch required".into()))
            }
        }
    }

    /// `replace`: like `set`, but fails if the key is absent.
    pub fn replace(
        &self,
        key: StoredKey,
        value: Vec<u8>,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        expected_cas: Option<i64>,
        origin: WriteOrigin,
        projected_bytes: usize,
        budget: &MemoryBudget,
    ) -> Result<MutationStamp> {
        if self.hash_table.find(&key).is_none() {
            return Err(EngineError::KeyNotFound);
        }
        self.set(
            key,
            value,
            flags,
            exptime,
            datatype,
            expected_cas,
            origin,
            projected_bytes,
            budget,
        )
    }

    /// `delete`: soft-deletes, marking the entry dirty.
    pub fn delete(&self, key: &StoredKey, expected_cas: Option<i64>) -> Result<MutationStamp> {
        self.guard_writable()?;
        let existing = self
            .hash_table
            .find(key)
            .ok_or(EngineError::KeyNotFound)?;
        if let Some(expected) = expected_cas {
            if existing.cas.load(Ordering::Acquire) != expected {
                return Err(EngineError::KeyExists);
            }
        }
        let cas = self.next_cas();
        self.hash_table
            .soft_delete(key, cas)
            .ok_or(EngineError::KeyNotFound)?;
        let sv = self.hash_table.find(key).expect("just deleted");
        let rev_seqno = sv.rev_seqno.load(Ordering::Acquire);
        let by_seqno = self
            .checkpoints
            .lock()
            .enqueue_mutation(Operation::Del(sv), None);
        Ok(MutationStamp { cas, rev_seqno, by_seqno })
    }

    /// Applies a replication-ingressed mutation (`setWithMeta`),
    /// resolving conflicts per spec.md §4.3: revision-seqno mode compares
    /// `(revSeqno, cas, exptime, flags)`; HLC mode compares `cas` first.
    /// Rejects (returns `Ok(false)`) if the incoming record loses.
    #[allow(clippy::too_many_arguments)]
    pub fn set_with_meta(
        &self,
        key: StoredKey,
        value: Vec<u8>,
        cas: i64,
        rev_seqno: u64,
        flags: u32,
        exptime: u32,
        datatype: Datatype,
        by_seqno: Option<i64>,
        budget: &MemoryBudget,
    ) -> Result<bool> {
        self.guard_writable()?;
        self.check_collection(&key)?;

        if let Some(existing) = self.hash_table.find(&key) {
            if !incoming_wins(
                self.conflict_res_mode,
                (rev_seqno, cas, exptime, flags),
                (
                    existing.rev_seqno.load(Ordering::Acquire),
                    existing.cas.load(Ordering::Acquire),
                    existing.exptime.load(Ordering::Acquire),
                    existing.flags,
                ),
            ) {
                return Ok(false);
            }
        }

        self.max_cas.fetch_max(cas, Ordering::AcqRel);
        self.clock.observe_remote(cas);

        let sv = Arc::new(StoredValue::new(
            key,
            Some(value),
            cas,
            flags,
            exptime,
            datatype,
            self.conflict_res_mode,
        ));
        sv.rev_seqno.store(rev_seqno, Ordering::Release);

        let projected_bytes = 0; // replica ingest is exempt from client-side estimation
        self.hash_table
            .set(sv.clone(), WriteOrigin::Replication, projected_bytes, budget);
        self.checkpoints
            .lock()
            .enqueue_mutation(Operation::Set(sv), by_seqno);
        Ok(true)
    }

    /// Soft lock for `getLocked`. Subsequent non-lock-cas access returns
    /// `TmpFail` until the lock expires or is released with the right cas.
    pub fn get_locked(&self, key: &StoredKey, ttl_ms: u64, now_ms: u64, lock_cas: i64) -> Result<Arc<StoredValue>> {
        self.guard_writable()?;
        let sv = self.hash_table.find(key).ok_or(EngineError::KeyNotFound)?;
        if sv.is_locked(now_ms) {
            return Err(EngineError::TmpFail("item is locked".into()));
        }
        sv.lock(now_ms, ttl_ms, lock_cas);
        Ok(sv)
    }

    /// Refreshes a key's TTL without bumping cas.
    pub fn get_and_update_ttl(&self, key: &StoredKey, new_exptime: u32) -> Result<Arc<StoredValue>> {
        let sv = self.hash_table.find(key).ok_or(EngineError::KeyNotFound)?;
        sv.exptime.store(new_exptime, Ordering::Release);
        Ok(sv)
    }

    /// Plain lookup. A key whose collection is mid-purge (`Deleting`)
    /// reads as `unknown_collection` even though the underlying record is
    /// still present in the hash table (spec.md §8 scenario C); a key
    /// whose collection was never created at all simply isn't found,
    /// same as any other absent key (spec.md §8 scenario A).
    pub fn get(&self, key: &StoredKey) -> Result<Option<Arc<StoredValue>>> {
        let manifest = self.collections.read();
        if let Some(name) = key.collection_name(manifest.separator()) {
            let name = String::from_utf8_lossy(name).to_string();
            if matches!(
                manifest.get(&name).map(|e| e.lifecycle),
                Some(crate::collections::CollectionLifecycle::Deleting)
            ) {
                return Err(EngineError::UnknownCollection);
            }
        }
        drop(manifest);
        Ok(self.hash_table.find(key))
    }

    fn check_collection(&self, key: &StoredKey) -> Result<()> {
        let separator = self.collections.read().separator().to_string();
        if let Some(name) = key.collection_name(&separator) {
            let name = String::from_utf8_lossy(name).to_string();
            if !self.collections.read().accepts_writes(&name) {
                return Err(EngineError::UnknownCollection);
            }
        }
        Ok(())
    }

    /// Metadata-only lookup.
    pub fn get_key_stats(&self, key: &StoredKey) -> Option<KeyStats> {
        self.hash_table.find(key).map(|sv| KeyStats {
            cas: sv.cas.load(Ordering::Acquire),
            flags: sv.flags,
            exptime: sv.exptime.load(Ordering::Acquire),
            dirty: sv.is_dirty(),
            deleted: sv.is_deleted(),
        })
    }

    /// Picks a live key uniformly at random.
    pub fn get_random_key(&self) -> Option<Arc<StoredValue>> {
        self.hash_table.random_entry()
    }

    /// Read-only access to the checkpoint manager, for the flusher and
    /// DCP producer.
    pub fn checkpoints(&self) -> &Mutex<CheckpointManager> {
        &self.checkpoints
    }

    /// Read-only access to the collection manifest.
    pub fn collections(&self) -> &RwLock<CollectionManifest> {
        &self.collections
    }

    /// Read-only access to the failover table.
    pub fn failover(&self) -> &Mutex<FailoverTable> {
        &self.failover
    }

    /// Read-only access to the hash-table index (used by eviction, the
    /// access scanner, and the collection purge task).
    pub fn hash_table(&self) -> &PartitionedHashTable {
        &self.hash_table
    }

    /// Applies an incoming cluster manifest, enqueuing the resulting
    /// system events under the collection write-lock span required by
    /// spec.md §4.5's ordering contract.
    pub fn apply_cluster_manifest(&self, incoming: &crate::collections::ClusterManifest) -> Vec<SystemEvent> {
        let events = self.collections.read().diff(incoming);
        let mut manifest = self.collections.write();
        let mut applied = Vec::with_capacity(events.len());
        for event in events {
            let seqno = self
                .checkpoints
                .lock()
                .enqueue_forced(Operation::SystemEvent(event.clone()));
            match event.kind {
                crate::checkpoint::SystemEventKind::CreateCollection => {
                    let name = String::from_utf8_lossy(&event.collection).to_string();
                    manifest.record_created(&name, event.revision, seqno);
                }
                crate::checkpoint::SystemEventKind::BeginDeleteCollection => {
                    let name = String::from_utf8_lossy(&event.collection).to_string();
                    manifest.record_deleting(&name, seqno);
                }
                crate::checkpoint::SystemEventKind::CollectionsSeparatorChanged => {
                    manifest.record_separator_changed(incoming.separator.clone(), event.revision);
                }
                _ => {}
            }
            applied.push(event);
        }
        applied
    }

    /// Current maximum cas observed by this partition (persisted at flush
    /// time, fed to `Hlc::with_seed` on warmup).
    pub fn max_cas(&self) -> i64 {
        self.max_cas.load(Ordering::Acquire)
    }

    /// Highest seqno the collection-purge task has fully swept through
    /// (persisted as `PersistedState.purge_seqno` at the next flush).
    pub fn purge_seqno(&self) -> i64 {
        self.purge_seqno.load(Ordering::Acquire)
    }

    /// Records purge progress up to `seqno`; monotonic, never regresses.
    pub fn record_purge_progress(&self, seqno: i64) {
        self.purge_seqno.fetch_max(seqno, Ordering::AcqRel);
    }
}

fn incoming_wins(
    mode: ConflictResMode,
    incoming: (u64, i64, u32, u32),
    existing: (u64, i64, u32, u32),
) -> bool {
    match mode {
        ConflictResMode::RevisionSeqno => incoming > existing,
        ConflictResMode::LogicalClock => {
            if incoming.1 != existing.1 {
                incoming.1 > existing.1
            } else {
                incoming > existing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new(0, 7, 1000, 1 << 20, "::", ConflictResMode::RevisionSeqno, 5_000_000, 5_000_000)
    }

    fn budget() -> MemoryBudget {
        MemoryBudget {
            max_data_size: 1_000_000,
            mutation_threshold: 0.9,
            replication_threshold: 0.93,
        }
    }

    #[test]
    fn pending_partition_blocks_writes() {
        let p = partition();
        let result = p.set(
            StoredKey::default_collection(b"a".to_vec()),
            b"v".to_vec(),
            0,
            0,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            10,
            &budget(),
        );
        assert_eq!(result.unwrap_err(), EngineError::WouldBlock);
    }

    #[test]
    fn dead_partition_rejects_with_not_my_vbucket() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        p.transition_to(PartitionState::Dead).unwrap();
        let result = p.get_locked(&StoredKey::default_collection(b"a".to_vec()), 1000, 0, 1);
        assert_eq!(result.unwrap_err(), EngineError::NotMyVbucket);
    }

    #[test]
    fn active_partition_accepts_set_and_get() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        let stamp = p
            .set(
                StoredKey::default_collection(b"a".to_vec()),
                b"v".to_vec(),
                0,
                0,
                Datatype::Raw,
                None,
                WriteOrigin::Client,
                10,
                &budget(),
            )
            .unwrap();
        assert!(stamp.cas > 0);
        let sv = p.get(&StoredKey::default_collection(b"a".to_vec())).unwrap().unwrap();
        assert_eq!(sv.value(), Some(b"v".to_vec()));
    }

    #[test]
    fn unknown_collection_rejects_writes() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        let key = StoredKey::collections(b"meat::ribeye".to_vec());
        let result = p.set(
            key,
            b"v".to_vec(),
            0,
            0,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            10,
            &budget(),
        );
        assert_eq!(result.unwrap_err(), EngineError::UnknownCollection);
    }

    #[test]
    fn collection_create_then_write_succeeds() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        let cluster = crate::collections::ClusterManifest {
            revision: 1,
            separator: "::".to_string(),
            collections: vec![crate::collections::ClusterCollection {
                name: "meat".to_string(),
            }],
        };
        p.apply_cluster_manifest(&cluster);
        let key = StoredKey::collections(b"meat::ribeye".to_vec());
        let result = p.set(
            key,
            b"v".to_vec(),
            0,
            0,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            10,
            &budget(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn collection_delete_then_write_is_denied() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        let with = crate::collections::ClusterManifest {
            revision: 1,
            separator: "::".to_string(),
            collections: vec![crate::collections::ClusterCollection {
                name: "meat".to_string(),
            }],
        };
        p.apply_cluster_manifest(&with);
        let without = crate::collections::ClusterManifest {
            revision: 2,
            separator: "::".to_string(),
            collections: vec![],
        };
        p.apply_cluster_manifest(&without);
        let key = StoredKey::collections(b"meat::ribeye".to_vec());
        let result = p.set(
            key,
            b"v".to_vec(),
            0,
            0,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            10,
            &budget(),
        );
        assert_eq!(result.unwrap_err(), EngineError::UnknownCollection);
    }

    #[test]
    fn get_locked_blocks_second_access_until_cas_presented() {
        let p = partition();
        p.transition_to(PartitionState::Active).unwrap();
        let key = StoredKey::default_collection(b"a".to_vec());
        p.set(
            key.clone(),
            b"v".to_vec(),
            0,
            0,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            10,
            &budget(),
        )
        .unwrap();
        p.get_locked(&key, 15_000, 1_000, 42).unwrap();
        let second = p.get_locked(&key, 15_000, 1_500, 99);
        assert_eq!(second.unwrap_err(), EngineError::TmpFail("item is locked".into()));
    }

    #[test]
    fn set_with_meta_rejects_stale_revision() {
        let p = partition();
        p.transition_to(PartitionState::Replica).unwrap();
        let key = StoredKey::default_collection(b"a".to_vec());
        p.set_with_meta(key.clone(), b"v1".to_vec(), 10, 5, 0, 0, Datatype::Raw, Some(1), &budget())
            .unwrap();
        let accepted = p
            .set_with_meta(key, b"v0".to_vec(), 1, 1, 0, 0, Datatype::Raw, Some(2), &budget())
            .unwrap();
        assert!(!accepted, "stale revision must be rejected");
    }
}
