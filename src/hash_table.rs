//! Partitioned hash-table index (spec.md §4.1).
//!
//! One instance guards a single partition's resident keyspace. Chain heads
//! are grouped into `L` stripes (the teacher's `concurrent_lru.rs` shards a
//! `DashMap` the same way, trading one global lock for many narrow ones);
//! bucket `i` always lives in stripe `i % L`, so a stripe holds roughly
//! `ht_size / L` chains. `unsafe_code = "deny"` at the crate level rules out
//! a truly intrusive linked list, so each chain is a `Vec<Arc<StoredValue>>`
//! instead — same O(1) amortized insert/erase contract, plain safe Rust.

use crate::key::StoredKey;
use crate::value::StoredValue;
use parking_lot::{Mutex, RwLock};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ascending prime bucket-count table; resize always lands on one of these,
/// never a value synthesized at runtime.
const PRIME_SIZES: &[usize] = &[
    3, 7, 13, 31, 61, 127, 251, 509, 1_021, 2_039, 4_093, 8_191, 16_381, 32_749, 65_521, 131_071,
    262_139, 524_287, 1_048_573, 2_097_143, 4_194_301, 8_388_593, 16_777_213, 33_554_393,
    67_108_859, 134_217_689, 268_435_399, 536_870_909, 1_073_741_789, 1_600_000_000,
];

fn nearest_prime_for(num_items: usize) -> usize {
    // Aim for a load factor near 1.5 items per bucket, then pick the prime
    // table entry whose distance from that target is minimal.
    let target = (num_items.max(1) * 2 / 3).max(3);
    *PRIME_SIZES
        .iter()
        .min_by_key(|&&p| (p as i64 - target as i64).abs())
        .unwrap()
}

fn hash_key(key: &StoredKey) -> u64 {
    let mut h = ahash::AHasher::default();
    key.hash(&mut h);
    h.finish()
}

/// Outcome of [`PartitionedHashTable::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// An existing clean (persisted) entry was overwritten.
    WasClean,
    /// An existing dirty (unpersisted) entry was overwritten.
    WasDirty,
    /// No prior entry existed; a new one was inserted.
    NotFoundAndInserted,
    /// Rejected: projected resident memory exceeds the configured threshold.
    NoMemory,
}

/// Outcome of [`PartitionedHashTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted; no prior entry existed.
    Success,
    /// A live, non-deleted entry already exists.
    Exists,
    /// Rejected: projected resident memory exceeds the configured threshold.
    NoMemory,
    /// In value-eviction mode, a non-resident placeholder must be
    /// fetched from the document store before `add` can be resolved.
    BgFetch,
    /// A previously soft-deleted entry was resurrected in place.
    Undeleted,
    /// In full-eviction mode, the key is absent from memory entirely; a
    /// temp placeholder was installed and the caller must background-fetch
    /// to learn whether it exists on disk.
    TmpBgFetch,
}

/// Outcome of [`PartitionedHashTable::soft_delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The entry was clean (persisted) before the delete.
    WasClean,
    /// The entry was dirty (unpersisted) before the delete.
    WasDirty,
}

/// Which memory-admission threshold applies to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A direct client mutation; gated by `mutation_threshold`.
    Client,
    /// A replicated mutation ingressed via DCP; gated by the looser
    /// `replication_threshold` so replica ingest can outrun eviction.
    Replication,
}

/// A resumable cursor into a cooperative full-table visit. Invalidated by
/// any resize that changes `ht_size`; the caller must restart from scratch
/// if `ht_size` no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Stripe the cursor paused in.
    pub lock_index: usize,
    /// Bucket within that stripe the cursor paused at.
    pub bucket_index: usize,
    /// Table size in effect when the cursor was issued.
    pub ht_size: usize,
    /// Offset within `bucket_index`'s chain already delivered to the
    /// visitor, so resuming does not re-deliver or skip chained entries.
    item_index: usize,
}

struct Stripe {
    /// `buckets[j]` holds the chain for global bucket `j * num_stripes + stripe_idx`.
    buckets: Vec<Vec<Arc<StoredValue>>>,
}

/// Memory admission policy, evaluated before `set`/`add` mutate the table.
pub struct MemoryBudget {
    /// Soft cap on resident bytes across the owning bucket.
    pub max_data_size: usize,
    /// Fraction of `max_data_size` above which client writes are rejected.
    pub mutation_threshold: f64,
    /// Fraction of `max_data_size` above which replicated writes are rejected.
    pub replication_threshold: f64,
}

impl MemoryBudget {
    fn admits(&self, projected_bytes: usize, origin: WriteOrigin) -> bool {
        let threshold = match origin {
            WriteOrigin::Client => self.mutation_threshold,
            WriteOrigin::Replication => self.replication_threshold,
        };
        (projected_bytes as f64) <= (self.max_data_size as f64) * threshold
    }
}

/// A single partition's resident key -> [`StoredValue`] index.
pub struct PartitionedHashTable {
    ht_size: AtomicUsize,
    num_stripes: usize,
    stripes: Vec<Mutex<Stripe>>,
    /// Guards the `ht_size`/stripe-layout invariant during resize; readers
    /// and writers of individual chains only ever touch `stripes[i]`, this
    /// lock is taken for resize alone.
    layout: RwLock<()>,
    num_items: AtomicUsize,
    active_visitors: AtomicUsize,
    resize_in_progress: AtomicBool,
}

impl PartitionedHashTable {
    /// Builds a new table with `num_stripes` mutexes (the configured
    /// `hash_table_locks`) and an initial size from the prime table.
    pub fn new(num_stripes: usize) -> Self {
        let ht_size = PRIME_SIZES[0].max(num_stripes);
        let ht_size = *PRIME_SIZES.iter().find(|&&p| p >= ht_size).unwrap();
        let num_stripes = num_stripes.max(1);
        let stripes = (0..num_stripes)
            .map(|_| {
                let local_count = ht_size.div_ceil(num_stripes);
                Mutex::new(Stripe {
                    buckets: vec![Vec::new(); local_count],
                })
            })
            .collect();
        Self {
            ht_size: AtomicUsize::new(ht_size),
            num_stripes,
            stripes,
            layout: RwLock::new(()),
            num_items: AtomicUsize::new(0),
            active_visitors: AtomicUsize::new(0),
            resize_in_progress: AtomicBool::new(false),
        }
    }

    fn locate(&self, key: &StoredKey) -> (usize, usize) {
        let ht_size = self.ht_size.load(Ordering::Acquire);
        let bucket = (hash_key(key) as usize) % ht_size;
        let stripe = bucket % self.num_stripes;
        let local = bucket / self.num_stripes;
        (stripe, local)
    }

    /// Looks up a key. Cheap under a single stripe lock.
    pub fn find(&self, key: &StoredKey) -> Option<Arc<StoredValue>> {
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(key);
        let stripe = self.stripes[stripe_idx].lock();
        stripe.buckets[local]
            .iter()
            .find(|sv| &sv.key == key)
            .cloned()
    }

    /// Unconditional upsert. `origin` selects the memory-admission
    /// threshold; `projected_bytes` is the caller's estimate of resident
    /// bytes after this write lands.
    pub fn set(
        &self,
        value: Arc<StoredValue>,
        origin: WriteOrigin,
        projected_bytes: usize,
        budget: &MemoryBudget,
    ) -> SetOutcome {
        if !budget.admits(projected_bytes, origin) {
            return SetOutcome::NoMemory;
        }
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(&value.key);
        let mut stripe = self.stripes[stripe_idx].lock();
        let chain = &mut stripe.buckets[local];
        if let Some(pos) = chain.iter().position(|sv| sv.key == value.key) {
            let was_dirty = chain[pos].is_dirty();
            chain[pos] = value;
            if was_dirty {
                SetOutcome::WasDirty
            } else {
                SetOutcome::WasClean
            }
        } else {
            chain.push(value);
            self.num_items.fetch_add(1, Ordering::Relaxed);
            SetOutcome::NotFoundAndInserted
        }
    }

    /// Insert-if-absent. See [`AddOutcome`] for the full contract,
    /// including the value/full eviction-mode distinctions.
    pub fn add(
        &self,
        value: Arc<StoredValue>,
        origin: WriteOrigin,
        projected_bytes: usize,
        budget: &MemoryBudget,
        full_eviction: bool,
    ) -> AddOutcome {
        if !budget.admits(projected_bytes, origin) {
            return AddOutcome::NoMemory;
        }
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(&value.key);
        let mut stripe = self.stripes[stripe_idx].lock();
        let chain = &mut stripe.buckets[local];
        match chain.iter().position(|sv| sv.key == value.key) {
            Some(pos) if chain[pos].is_temp() => {
                if full_eviction {
                    AddOutcome::TmpBgFetch
                } else {
                    AddOutcome::BgFetch
                }
            }
            Some(pos) if chain[pos].is_deleted() => {
                chain[pos] = value;
                AddOutcome::Undeleted
            }
            Some(_) => AddOutcome::Exists,
            None => {
                if full_eviction {
                    chain.push(Arc::new(StoredValue::new_temp(value.key.clone())));
                    self.num_items.fetch_add(1, Ordering::Relaxed);
                    AddOutcome::TmpBgFetch
                } else {
                    chain.push(value);
                    self.num_items.fetch_add(1, Ordering::Relaxed);
                    AddOutcome::Success
                }
            }
        }
    }

    /// Marks an entry deleted, bumping its revision and stamping `cas`.
    /// Returns `None` if the key is absent.
    pub fn soft_delete(&self, key: &StoredKey, cas: i64) -> Option<DeleteOutcome> {
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(key);
        let mut stripe = self.stripes[stripe_idx].lock();
        let chain = &mut stripe.buckets[local];
        let pos = chain.iter().position(|sv| &sv.key == key)?;
        let sv = &chain[pos];
        let was_dirty = sv.is_dirty();
        sv.apply_mutation(None, cas, sv.rev_seqno.load(Ordering::Acquire) + 1, (0, 0), true);
        Some(if was_dirty {
            DeleteOutcome::WasDirty
        } else {
            DeleteOutcome::WasClean
        })
    }

    /// Drops the value payload only, leaving the record addressable.
    pub fn evict_value_only(&self, key: &StoredKey) -> bool {
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(key);
        let stripe = self.stripes[stripe_idx].lock();
        match stripe.buckets[local].iter().find(|sv| &sv.key == key) {
            Some(sv) if !sv.is_dirty() => {
                sv.evict_value();
                true
            }
            _ => false,
        }
    }

    /// Drops the record entirely (full eviction). A later access installs
    /// a temp placeholder and background-fetches.
    pub fn evict_full(&self, key: &StoredKey) -> bool {
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(key);
        let mut stripe = self.stripes[stripe_idx].lock();
        let chain = &mut stripe.buckets[local];
        if let Some(pos) = chain.iter().position(|sv| &sv.key == key && !sv.is_dirty()) {
            chain.remove(pos);
            self.num_items.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Drops the record entirely regardless of its dirty bit. Used only by
    /// rollback: an entry above the rollback point was never durably
    /// committed, so there is nothing to preserve for a later refetch.
    pub fn remove_unconditional(&self, key: &StoredKey) -> bool {
        let _layout = self.layout.read();
        let (stripe_idx, local) = self.locate(key);
        let mut stripe = self.stripes[stripe_idx].lock();
        let chain = &mut stripe.buckets[local];
        if let Some(pos) = chain.iter().position(|sv| &sv.key == key) {
            chain.remove(pos);
            self.num_items.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Current number of live entries (including non-resident / temp).
    pub fn len(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks one live (non-temp) entry uniformly at random via reservoir
    /// sampling over a single visit pass.
    pub fn random_entry(&self) -> Option<Arc<StoredValue>> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut chosen: Option<Arc<StoredValue>> = None;
        let mut seen = 0u64;
        self.visit(None, |sv| {
            if !sv.is_temp() {
                seen += 1;
                if rng.gen_range(0..seen) == 0 {
                    chosen = Some(sv.clone());
                }
            }
            VisitControl::Continue
        });
        chosen
    }

    /// Resizes the table to the prime bucket count nearest the current
    /// item count. Refuses (returns `false`) while a visit is in progress.
    pub fn resize(&self) -> bool {
        if self.active_visitors.load(Ordering::Acquire) > 0 {
            return false;
        }
        self.resize_in_progress.store(true, Ordering::Release);
        let _layout = self.layout.write();
        let mut guards: Vec<_> = self.stripes.iter().map(|s| s.lock()).collect();

        let new_size = nearest_prime_for(self.num_items.load(Ordering::Relaxed));
        let old_size = self.ht_size.load(Ordering::Acquire);
        if new_size == old_size {
            self.resize_in_progress.store(false, Ordering::Release);
            return true;
        }

        let mut all_entries = Vec::with_capacity(self.num_items.load(Ordering::Relaxed));
        for guard in guards.iter_mut() {
            for chain in guard.buckets.iter_mut() {
                all_entries.append(chain);
            }
        }

        self.ht_size.store(new_size, Ordering::Release);
        let new_local_count = new_size.div_ceil(self.num_stripes);
        for guard in guards.iter_mut() {
            guard.buckets = vec![Vec::new(); new_local_count];
        }

        for sv in all_entries {
            let bucket = (hash_key(&sv.key) as usize) % new_size;
            let stripe = bucket % self.num_stripes;
            let local = bucket / self.num_stripes;
            guards[stripe].buckets[local].push(sv);
        }

        self.resize_in_progress.store(false, Ordering::Release);
        true
    }

    /// Begins (or resumes, from `from`) a cooperative full-table visit,
    /// calling `f` for every entry. Returns the position to resume from if
    /// `f` asks to pause, or `None` if the visit completed. A resize
    /// in-flight concurrently with this call is blocked by `active_visitors`.
    pub fn visit<F>(&self, from: Option<Position>, mut f: F) -> Option<Position>
    where
        F: FnMut(&Arc<StoredValue>) -> VisitControl,
    {
        let ht_size = self.ht_size.load(Ordering::Acquire);
        if let Some(pos) = from {
            if pos.ht_size != ht_size {
                // Table resized since the cursor was issued; caller restarts.
                return Some(Position {
                    lock_index: 0,
                    bucket_index: 0,
                    ht_size,
                    item_index: 0,
                });
            }
        }
        self.active_visitors.fetch_add(1, Ordering::AcqRel);
        let (start_stripe, start_local, start_item) = from
            .map(|p| (p.lock_index, p.bucket_index, p.item_index))
            .unwrap_or((0, 0, 0));

        let result = 'outer: loop {
            for stripe_idx in start_stripe..self.num_stripes {
                let stripe = self.stripes[stripe_idx].lock();
                let local_start = if stripe_idx == start_stripe { start_local } else { 0 };
                for (local, chain) in stripe.buckets.iter().enumerate().skip(local_start) {
                    let item_start = if stripe_idx == start_stripe && local == start_local {
                        start_item
                    } else {
                        0
                    };
                    for (item_idx, sv) in chain.iter().enumerate().skip(item_start) {
                        if let VisitControl::Pause = f(sv) {
                            break 'outer Some(Position {
                                lock_index: stripe_idx,
                                bucket_index: local,
                                ht_size,
                                item_index: item_idx + 1,
                            });
                        }
                    }
                }
            }
            break 'outer None;
        };
        self.active_visitors.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

/// Signal returned by a [`PartitionedHashTable::visit`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitControl {
    /// Keep visiting.
    Continue,
    /// Stop; the caller receives a [`Position`] to resume from later.
    Pause,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ConflictResMode, Datatype};

    fn budget() -> MemoryBudget {
        MemoryBudget {
            max_data_size: 1_000_000,
            mutation_threshold: 0.9,
            replication_threshold: 0.93,
        }
    }

    fn sv(k: &str) -> Arc<StoredValue> {
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
    fn set_then_find_round_trips() {
        let ht = PartitionedHashTable::new(7);
        let outcome = ht.set(sv("a"), WriteOrigin::Client, 10, &budget());
        assert_eq!(outcome, SetOutcome::NotFoundAndInserted);
        let found = ht.find(&StoredKey::default_collection(b"a".to_vec()));
        assert!(found.is_some());
    }

    #[test]
    fn set_over_memory_threshold_rejects() {
        let ht = PartitionedHashTable::new(7);
        let tight = MemoryBudget {
            max_data_size: 100,
            mutation_threshold: 0.9,
            replication_threshold: 0.93,
        };
        let outcome = ht.set(sv("a"), WriteOrigin::Client, 1000, &tight);
        assert_eq!(outcome, SetOutcome::NoMemory);
    }

    #[test]
    fn add_reports_exists_for_live_entry() {
        let ht = PartitionedHashTable::new(7);
        ht.set(sv("a"), WriteOrigin::Client, 10, &budget());
        let outcome = ht.add(sv("a"), WriteOrigin::Client, 10, &budget(), false);
        assert_eq!(outcome, AddOutcome::Exists);
    }

    #[test]
    fn add_undeletes_a_soft_deleted_entry() {
        let ht = PartitionedHashTable::new(7);
        ht.set(sv("a"), WriteOrigin::Client, 10, &budget());
        ht.soft_delete(&StoredKey::default_collection(b"a".to_vec()), 2);
        let outcome = ht.add(sv("a"), WriteOrigin::Client, 10, &budget(), false);
        assert_eq!(outcome, AddOutcome::Undeleted);
    }

    #[test]
    fn full_eviction_add_installs_temp_placeholder() {
        let ht = PartitionedHashTable::new(7);
        let outcome = ht.add(sv("a"), WriteOrigin::Client, 10, &budget(), true);
        assert_eq!(outcome, AddOutcome::TmpBgFetch);
        let found = ht
            .find(&StoredKey::default_collection(b"a".to_vec()))
            .unwrap();
        assert!(found.is_temp());
    }

    #[test]
    fn resize_preserves_all_entries() {
        let ht = PartitionedHashTable::new(7);
        for i in 0..200 {
            ht.set(sv(&format!("k{i}")), WriteOrigin::Client, 10, &budget());
        }
        assert_eq!(ht.len(), 200);
        assert!(ht.resize());
        assert_eq!(ht.len(), 200);
        for i in 0..200 {
            assert!(ht
                .find(&StoredKey::default_collection(format!("k{i}").into_bytes()))
                .is_some());
        }
    }

    #[test]
    fn visit_can_pause_and_resume() {
        let ht = PartitionedHashTable::new(3);
        for i in 0..10 {
            ht.set(sv(&format!("k{i}")), WriteOrigin::Client, 10, &budget());
        }
        let mut seen = 0;
        let pos = ht.visit(None, |_| {
            seen += 1;
            if seen == 3 {
                VisitControl::Pause
            } else {
                VisitControl::Continue
            }
        });
        assert!(pos.is_some());
        let mut total = seen;
        let resumed = ht.visit(pos, |_| {
            total += 1;
            VisitControl::Continue
        });
        assert!(resumed.is_none());
        assert_eq!(total, 10);
    }

    #[test]
    fn resize_refuses_while_visit_in_progress() {
        let ht = PartitionedHashTable::new(3);
        ht.set(sv("a"), WriteOrigin::Client, 10, &budget());
        ht.active_visitors.fetch_add(1, Ordering::AcqRel);
        assert!(!ht.resize());
        ht.active_visitors.fetch_sub(1, Ordering::AcqRel);
    }
}
