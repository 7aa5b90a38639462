//! Collection purge: the low-priority sweep that reclaims a `deleting`
//! collection's records from the hash table (spec.md §4.5). Generalizes
//! `eviction.rs`'s `ItemPager` sweep-and-report shape (bucket-wide,
//! per-partition visit, task wrapper with idle/busy backoff) to a
//! collection-scoped, seqno-bounded unlink pass instead of an NRU-driven
//! one.

use crate::bucket::Bucket;
use crate::checkpoint::{Operation, SystemEventKind};
use crate::hash_table::VisitControl;
use crate::scheduler::Task;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// One pass of the collection purge over a bucket: for every partition,
/// snapshots the collections currently `deleting`, walks the hash table
/// once unlinking every entry whose key's collection prefix names one of
/// them and whose `bySeqno` is at or below its recorded end-seqno, then
/// completes the purge for each snapshotted collection.
///
/// A single full-table visit (`from = None`, always `Continue`) already
/// observes every resident entry exactly once, so no second pass is needed
/// to tell whether a collection's old generation has been fully swept: by
/// construction, any record still written under a *new* generation (after
/// a recreate) carries a `bySeqno` past the snapshotted end-seqno and is
/// never a unlink candidate in the first place.
pub struct CollectionPurge {
    bucket: Arc<Bucket>,
}

impl CollectionPurge {
    /// Builds a purge sweep over `bucket`.
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self { bucket }
    }

    /// Runs a single sweep, returning the number of entries unlinked.
    pub fn sweep(&self) -> usize {
        let mut unlinked = 0;

        for partition in self.bucket.partitions() {
            let separator = partition.collections().read().separator().to_string();
            let deleting: Vec<(Vec<u8>, i64)> = partition
                .collections()
                .read()
                .deleting()
                .map(|(name, entry)| (name.as_bytes().to_vec(), entry.end_seqno.unwrap_or(i64::MAX)))
                .collect();
            if deleting.is_empty() {
                continue;
            }

            let mut victims = Vec::new();
            partition.hash_table().visit(None, |sv| {
                if let Some(prefix) = sv.key.collection_name(&separator) {
                    let by_seqno = sv.by_seqno.load(Ordering::Acquire);
                    if deleting.iter().any(|(name, end_seqno)| name.as_slice() == prefix && by_seqno <= *end_seqno) {
                        victims.push(sv.key.clone());
                    }
                }
                VisitControl::Continue
            });

            let mut freed_bytes = Vec::new();
            for key in &victims {
                if let Some(len) = partition.hash_table().find(key).and_then(|sv| sv.value()).map(|v| v.len()) {
                    freed_bytes.push(len);
                }
                if partition.hash_table().remove_unconditional(key) {
                    unlinked += 1;
                }
            }
            for len in freed_bytes {
                self.bucket.deaccount(len);
            }

            for (name_bytes, end_seqno) in &deleting {
                let name = String::from_utf8_lossy(name_bytes).into_owned();
                let mut manifest = partition.collections().write();
                let Some(event) = manifest.complete_purge(&name) else { continue };
                let hard = event.kind == SystemEventKind::DeleteCollectionHard;
                partition.checkpoints().lock().enqueue_forced(Operation::SystemEvent(event));
                if hard {
                    manifest.forget(&name);
                }
                drop(manifest);
                partition.record_purge_progress(*end_seqno);
            }
        }

        if unlinked > 0 {
            debug!(unlinked, bucket = %self.bucket.name, "collection purge sweep unlinked entries");
        }
        unlinked
    }
}

/// A [`Task`] driving [`CollectionPurge::sweep`] on a fixed cadence.
pub struct CollectionPurgeTask {
    purge: CollectionPurge,
    idle_sleep_secs: f64,
    busy_sleep_secs: f64,
}

impl CollectionPurgeTask {
    /// Builds a recurring purge task: sleeps `busy_sleep_secs` between
    /// sweeps that unlinked something, `idle_sleep_secs` otherwise.
    pub fn new(bucket: Arc<Bucket>, idle_sleep_secs: f64, busy_sleep_secs: f64) -> Self {
        Self { purge: CollectionPurge::new(bucket), idle_sleep_secs, busy_sleep_secs }
    }
}

impl Task for CollectionPurgeTask {
    fn run(&mut self) -> (bool, f64) {
        let unlinked = self.purge.sweep();
        let sleep = if unlinked > 0 { self.busy_sleep_secs } else { self.idle_sleep_secs };
        (true, sleep)
    }

    fn name(&self) -> &str {
        "collection_purge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::ClusterCollection;
    use crate::collections::ClusterManifest;
    use crate::config::EngineConfig;
    use crate::key::StoredKey;

    fn cluster(rev: u64, names: &[&str]) -> ClusterManifest {
        ClusterManifest {
            revision: rev,
            separator: "::".to_string(),
            collections: names.iter().map(|n| ClusterCollection { name: n.to_string() }).collect(),
        }
    }

    #[test]
    fn sweep_unlinks_deleted_collections_records_and_completes_hard() {
        let bucket = Arc::new(Bucket::new("default", EngineConfig::balanced()));
        bucket.activate_all().unwrap();
        bucket.apply_cluster_manifest(&cluster(1, &["meat"]));
        bucket
            .set(0, StoredKey::collections(b"meat::ribeye".to_vec()), b"12oz".to_vec(), 0, 0)
            .unwrap();
        bucket.apply_cluster_manifest(&cluster(2, &[]));

        let purge = CollectionPurge::new(bucket.clone());
        let unlinked = purge.sweep();
        assert_eq!(unlinked, 1);

        let partition = bucket.partition(0).unwrap();
        assert!(partition.collections().read().get("meat").is_none());
        assert!(partition.purge_seqno() > 0);
    }

    #[test]
    fn sweep_is_a_no_op_with_nothing_deleting() {
        let bucket = Arc::new(Bucket::new("default", EngineConfig::balanced()));
        bucket.activate_all().unwrap();
        bucket.apply_cluster_manifest(&cluster(1, &["meat"]));
        bucket
            .set(0, StoredKey::collections(b"meat::ribeye".to_vec()), b"12oz".to_vec(), 0, 0)
            .unwrap();

        let purge = CollectionPurge::new(bucket);
        assert_eq!(purge.sweep(), 0);
    }

    #[test]
    fn sweep_completes_soft_when_recreated_before_sweep() {
        let bucket = Arc::new(Bucket::new("default", EngineConfig::balanced()));
        bucket.activate_all().unwrap();
        bucket.apply_cluster_manifest(&cluster(1, &["meat"]));
        bucket
            .set(0, StoredKey::collections(b"meat::ribeye".to_vec()), b"12oz".to_vec(), 0, 0)
            .unwrap();
        bucket.apply_cluster_manifest(&cluster(2, &[]));
        bucket.apply_cluster_manifest(&cluster(3, &["meat"]));

        let partition = bucket.partition(0).unwrap();
        assert!(partition.collections().read().accepts_writes("meat"));

        let purge = CollectionPurge::new(bucket.clone());
        purge.sweep();

        // The re-created entry survives (its writes never matched the old
        // generation's end-seqno filter), and the manifest still accepts
        // writes for it.
        assert!(partition.collections().read().accepts_writes("meat"));
    }
}
