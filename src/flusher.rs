//! Flusher: one shared task draining dirty partitions across co-tenant
//! buckets into the document store (spec.md §4.4).

use crate::bucket::Bucket;
use crate::checkpoint::{Operation, SystemEventKind};
use crate::collections::CollectionManifest;
use crate::key::StoredKey;
use crate::store::{CommitBatch, DocumentMutation, DocumentStore, MetadataRecord, PersistedState};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PERSISTENCE_CURSOR: &str = "persistence";

/// Outcome of one `flushOne` pass over a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Nothing,
    /// A batch committed successfully.
    Committed { items: usize },
    /// The partition's flush mutex was already held; try again next wake.
    Contended,
    /// The commit failed; the batch will be retried on the next wake.
    Failed,
}

/// Per-bucket dirty/paused partition bookkeeping the flusher wakes on.
#[derive(Default)]
struct BucketFlushState {
    dirty: DashSet<u16>,
    paused: DashSet<u16>,
    flushing: DashSet<u16>,
}

/// The shared flusher task. One instance services every bucket registered
/// with it.
pub struct Flusher {
    store: Arc<dyn DocumentStore>,
    buckets: dashmap::DashMap<String, BucketFlushState>,
    batch_size: usize,
}

impl Flusher {
    /// Builds a flusher backed by `store`, draining up to `batch_size`
    /// items per partition per wake.
    pub fn new(store: Arc<dyn DocumentStore>, batch_size: usize) -> Self {
        Self {
            store,
            buckets: dashmap::DashMap::new(),
            batch_size,
        }
    }

    /// Marks `(bucket, partition)` dirty, waking the flusher for it on the
    /// next pass.
    pub fn mark_dirty(&self, bucket: &str, partition_id: u16) {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .dirty
            .insert(partition_id);
    }

    /// Pauses persistence for a partition (e.g. during a takeover).
    pub fn pause(&self, bucket: &str, partition_id: u16) {
        let state = self.buckets.entry(bucket.to_string()).or_default();
        state.paused.insert(partition_id);
    }

    /// Resumes a paused partition; it rejoins the dirty set on the next wake.
    pub fn resume(&self, bucket: &str, partition_id: u16) {
        if let Some(state) = self.buckets.get(bucket) {
            state.paused.remove(&partition_id);
            state.dirty.insert(partition_id);
        }
    }

    /// One wake: for every bucket not entirely paused, merges resumed
    /// partitions back into the dirty set and flushes each pending
    /// partition. Returns the per-partition outcomes, in no particular
    /// order.
    pub fn wake(&self, bucket: &Bucket) -> Vec<(u16, FlushOutcome)> {
        let state = self.buckets.entry(bucket.name.clone()).or_default();
        let pending: Vec<u16> = state
            .dirty
            .iter()
            .map(|e| *e)
            .filter(|id| !state.paused.contains(id))
            .collect();
        drop(state);

        pending
            .into_iter()
            .map(|id| {
                let outcome = self.flush_one(bucket, id);
                if !matches!(outcome, FlushOutcome::Contended) {
                    if let Some(state) = self.buckets.get(&bucket.name) {
                        state.dirty.remove(&id);
                    }
                }
                (id, outcome)
            })
            .collect()
    }

    /// Drains one partition's persistence cursor and commits a batch.
    /// Non-blocking on contention: if the partition is already mid-flush
    /// (e.g. a concurrent wake raced us), returns `Contended` immediately.
    pub fn flush_one(&self, bucket: &Bucket, partition_id: u16) -> FlushOutcome {
        let state = self.buckets.entry(bucket.name.clone()).or_default();
        if !state.flushing.insert(partition_id) {
            return FlushOutcome::Contended;
        }
        drop(state);

        let result = self.flush_one_inner(bucket, partition_id);

        if let Some(state) = self.buckets.get(&bucket.name) {
            state.flushing.remove(&partition_id);
        }
        result
    }

    fn flush_one_inner(&self, bucket: &Bucket, partition_id: u16) -> FlushOutcome {
        let partition = match bucket.partition(partition_id) {
            Ok(p) => p,
            Err(_) => return FlushOutcome::Nothing,
        };

        {
            let mut mgr = partition.checkpoints().lock();
            if mgr.cursor_token(PERSISTENCE_CURSOR).is_none() {
                mgr.register_cursor(PERSISTENCE_CURSOR);
            }
        }

        let token = partition
            .checkpoints()
            .lock()
            .cursor_token(PERSISTENCE_CURSOR)
            .expect("just registered");

        let mut drained = Vec::new();
        {
            let mut mgr = partition.checkpoints().lock();
            for _ in 0..self.batch_size {
                match mgr.next_for_cursor(PERSISTENCE_CURSOR) {
                    Some((cp_id, idx, _seqno)) => drained.push((cp_id, idx)),
                    None => break,
                }
            }
        }

        if drained.is_empty() {
            return FlushOutcome::Nothing;
        }

        let mut documents: Vec<DocumentMutation> = Vec::new();
        let mut to_mark_clean: Vec<Arc<crate::value::StoredValue>> = Vec::new();
        let mut last_seqno = 0i64;

        {
            let mgr = partition.checkpoints().lock();
            for &(cp_id, idx) in &drained {
                let Some(item) = mgr.get_item(cp_id, idx) else {
                    continue;
                };
                if item.is_collapsed() {
                    continue;
                }
                last_seqno = last_seqno.max(item.by_seqno);
                match &item.operation {
                    Operation::Set(sv) => {
                        documents.retain(|d| d.key != sv.key);
                        documents.push(DocumentMutation {
                            key: sv.key.clone(),
                            metadata: MetadataRecord {
                                cas: sv.cas.load(std::sync::atomic::Ordering::Acquire),
                                exptime: sv.exptime.load(std::sync::atomic::Ordering::Acquire),
                                flags: sv.flags,
                                datatype: Some(sv.datatype),
                                conflict_res_mode: Some(sv.conflict_res_mode),
                            },
                            value: sv.value(),
                            by_seqno: item.by_seqno,
                        });
                        to_mark_clean.push(sv.clone());
                    }
                    Operation::Del(sv) => {
                        documents.retain(|d| d.key != sv.key);
                        documents.push(DocumentMutation {
                            key: sv.key.clone(),
                            metadata: MetadataRecord {
                                cas: sv.cas.load(std::sync::atomic::Ordering::Acquire),
                                exptime: 0,
                                flags: 0,
                                datatype: Some(sv.datatype),
                                conflict_res_mode: Some(sv.conflict_res_mode),
                            },
                            value: None,
                            by_seqno: item.by_seqno,
                        });
                        to_mark_clean.push(sv.clone());
                    }
                    Operation::SystemEvent(event) => {
                        apply_system_event_marker(&mut documents, event, item.by_seqno);
                    }
                    Operation::Flush
                    | Operation::Empty
                    | Operation::CheckpointStart
                    | Operation::CheckpointEnd
                    | Operation::SetVBucketState(_) => {}
                }
            }
        }

        let manifest_json = serialize_manifest(&partition.collections().read());

        let batch = CommitBatch {
            documents,
            state: PersistedState {
                last_seqno: last_seqno.max(partition.max_cas()),
                last_snap_start: last_seqno,
                last_snap_end: last_seqno,
                max_cas: partition.max_cas(),
                purge_seqno: partition.purge_seqno(),
                max_deleted_rev_seqno: 0,
                failover: partition.failover().lock().entries().to_vec(),
            },
            collections_manifest_json: manifest_json,
        };

        let committed = batch.documents.len();
        match self.store.commit(partition_id, batch) {
            Ok(()) => {
                for sv in &to_mark_clean {
                    sv.mark_clean();
                }
                debug!(partition_id, committed, "flush committed");
                FlushOutcome::Committed { items: committed }
            }
            Err(err) => {
                warn!(partition_id, %err, "flush commit failed, rolling back cursor");
                partition
                    .checkpoints()
                    .lock()
                    .restore_cursor(PERSISTENCE_CURSOR, token);
                FlushOutcome::Failed
            }
        }
    }

    /// Synchronously drains every dirty partition in `bucket`, used on
    /// bucket shutdown ("flush and wait").
    pub fn flush_and_wait(&self, bucket: &Bucket, poll_interval: Duration) {
        loop {
            let results = self.wake(bucket);
            let still_pending = results
                .iter()
                .any(|(_, outcome)| matches!(outcome, FlushOutcome::Contended | FlushOutcome::Failed));
            let state = self.buckets.entry(bucket.name.clone()).or_default();
            if state.dirty.is_empty() && !still_pending {
                return;
            }
            drop(state);
            std::thread::sleep(poll_interval);
        }
    }
}

/// Rewrites a system-event queued-item into the kvstore operation it
/// corresponds to: a create-collection event upserts a marker document; a
/// begin-delete event deletes it; hard/soft-delete events carry no
/// document mutation of their own (the manifest update is the only
/// side effect), spec.md §4.4.
fn apply_system_event_marker(
    documents: &mut Vec<DocumentMutation>,
    event: &crate::checkpoint::SystemEvent,
    by_seqno: i64,
) {
    let marker_key = match event.kind {
        SystemEventKind::CreateCollection => {
            Some((format!("$collections::create:{}", String::from_utf8_lossy(&event.collection)), true))
        }
        SystemEventKind::BeginDeleteCollection => {
            Some((format!("$collections::delete:{}", String::from_utf8_lossy(&event.collection)), false))
        }
        SystemEventKind::DeleteCollectionHard
        | SystemEventKind::DeleteCollectionSoft
        | SystemEventKind::CollectionsSeparatorChanged => None,
    };
    let Some((marker, upsert)) = marker_key else {
        return;
    };
    let key = StoredKey::system(marker.into_bytes());
    documents.retain(|d| d.key != key);
    documents.push(DocumentMutation {
        key,
        metadata: MetadataRecord {
            cas: by_seqno,
            exptime: 0,
            flags: 0,
            datatype: None,
            conflict_res_mode: None,
        },
        by_seqno,
        value: if upsert {
            Some(event.revision.to_le_bytes().to_vec())
        } else {
            None
        },
    });
}

fn serialize_manifest(manifest: &CollectionManifest) -> Vec<u8> {
    serde_json::json!({
        "revision": manifest.revision(),
        "separator": manifest.separator(),
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::memory_store::MemoryStore;

    #[test]
    fn flush_one_commits_a_dirty_set() {
        let bucket = Bucket::new("default", EngineConfig::balanced());
        bucket.activate_all().unwrap();
        bucket
            .set(0, StoredKey::default_collection(b"a".to_vec()), b"v".to_vec(), 0, 0)
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let flusher = Flusher::new(store.clone(), 100);
        let outcome = flusher.flush_one(&bucket, 0);
        assert!(matches!(outcome, FlushOutcome::Committed { items: 1 }));

        let (_, value) = store
            .get(0, &StoredKey::default_collection(b"a".to_vec()))
            .unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
    }

    #[test]
    fn flush_one_with_nothing_pending_is_a_noop() {
        let bucket = Bucket::new("default", EngineConfig::balanced());
        bucket.activate_all().unwrap();
        let store = Arc::new(MemoryStore::new());
        let flusher = Flusher::new(store, 100);
        assert_eq!(flusher.flush_one(&bucket, 0), FlushOutcome::Nothing);
    }

    #[test]
    fn repeated_sets_to_same_key_dedupe_to_the_last() {
        let bucket = Bucket::new("default", EngineConfig::balanced());
        bucket.activate_all().unwrap();
        bucket
            .set(0, StoredKey::default_collection(b"a".to_vec()), b"v1".to_vec(), 0, 0)
            .unwrap();
        bucket
            .set(0, StoredKey::default_collection(b"a".to_vec()), b"v2".to_vec(), 0, 0)
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let flusher = Flusher::new(store.clone(), 100);
        flusher.flush_one(&bucket, 0);
        let (_, value) = store
            .get(0, &StoredKey::default_collection(b"a".to_vec()))
            .unwrap();
        assert_eq!(value, Some(b"v2".to_vec()));
    }
}
