//! Item pager: an NRU-driven eviction sweep run against the memory
//! budget (spec.md §5). Generalizes the teacher's approximate-LRU
//! eviction loop (`db/cache/concurrent_lru.rs`'s "evict until under
//! capacity" shape) from a single map to the partitioned, per-bucket
//! hash table.

use crate::bucket::Bucket;
use crate::hash_table::VisitControl;
use crate::scheduler::Task;
use std::sync::Arc;
use tracing::debug;

/// One pass of the item pager over a bucket: ages every resident entry's
/// NRU counter, then value-evicts the coldest (`nru == NRU_MAX`, clean,
/// resident) entries until resident bytes drop back under the mutation
/// threshold.
pub struct ItemPager {
    bucket: Arc<Bucket>,
}

impl ItemPager {
    /// Builds a pager over `bucket`.
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self { bucket }
    }

    /// Runs a single age-and-evict sweep, returning the number of
    /// entries value-evicted.
    pub fn sweep(&self) -> usize {
        let budget_bytes = (self.bucket.config().max_data_size as f64
            * self.bucket.config().mutation_threshold) as usize;
        let mut evicted = 0;

        for partition in self.bucket.partitions() {
            if self.bucket.resident_bytes() <= budget_bytes {
                break;
            }
            let mut candidates = Vec::new();
            partition.hash_table().visit(None, |sv| {
                if sv.is_resident() && !sv.is_dirty() && !sv.is_deleted() {
                    sv.age();
                    if sv.nru() >= crate::value::NRU_MAX {
                        candidates.push(sv.key.clone());
                    }
                }
                VisitControl::Continue
            });
            for key in candidates {
                let freed = partition.hash_table().find(&key).and_then(|sv| sv.value()).map(|v| v.len());
                if partition.hash_table().evict_value_only(&key) {
                    evicted += 1;
                    if let Some(len) = freed {
                        self.bucket.deaccount(len);
                    }
                }
                if self.bucket.resident_bytes() <= budget_bytes {
                    break;
                }
            }
        }
        if evicted > 0 {
            debug!(evicted, bucket = %self.bucket.name, "item pager sweep evicted entries");
        }
        evicted
    }
}

/// A [`Task`] driving [`ItemPager::sweep`] on a fixed cadence. Runs
/// forever; `sleep_seconds` backs off when a sweep found nothing to do.
pub struct ItemPagerTask {
    pager: ItemPager,
    idle_sleep_secs: f64,
    busy_sleep_secs: f64,
}

impl ItemPagerTask {
    /// Builds a recurring pager task: sleeps `busy_sleep_secs` between
    /// sweeps that evicted something, `idle_sleep_secs` otherwise.
    pub fn new(bucket: Arc<Bucket>, idle_sleep_secs: f64, busy_sleep_secs: f64) -> Self {
        Self { pager: ItemPager::new(bucket), idle_sleep_secs, busy_sleep_secs }
    }
}

impl Task for ItemPagerTask {
    fn run(&mut self) -> (bool, f64) {
        let evicted = self.pager.sweep();
        let sleep = if evicted > 0 { self.busy_sleep_secs } else { self.idle_sleep_secs };
        (true, sleep)
    }

    fn name(&self) -> &str {
        "item_pager"
    }
}
