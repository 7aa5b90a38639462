//! A reference, in-process [`DocumentStore`] collaborator used by tests
//! and the demo CLI. Not a production persistence layer — spec.md places
//! the real store outside this crate's scope.

use super::{BackfillRecord, CommitBatch, DocumentStore, MetadataRecord, PersistedState};
use crate::error::Result;
use crate::key::StoredKey;
use parking_lot::Mutex;
use std::collections::HashMap;

struct StoredDocument {
    metadata: MetadataRecord,
    value: Option<Vec<u8>>,
    by_seqno: i64,
}

struct PartitionData {
    documents: HashMap<StoredKey, StoredDocument>,
    state: PersistedState,
    collections_manifest_json: Option<Vec<u8>>,
}

impl Default for PartitionData {
    fn default() -> Self {
        Self {
            documents: HashMap::new(),
            state: PersistedState::default(),
            collections_manifest_json: None,
        }
    }
}

/// An in-memory `DocumentStore`, organized as one map per partition behind
/// a single mutex; good enough for tests, wholly inadequate for a real
/// deployment (no durability at all).
#[derive(Default)]
pub struct MemoryStore {
    partitions: Mutex<HashMap<u16, PartitionData>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn commit(&self, partition_id: u16, batch: CommitBatch) -> Result<()> {
        let mut partitions = self.partitions.lock();
        let entry = partitions.entry(partition_id).or_default();
        for doc in batch.documents {
            entry.documents.insert(
                doc.key,
                StoredDocument {
                    metadata: doc.metadata,
                    value: doc.value,
                    by_seqno: doc.by_seqno,
                },
            );
        }
        entry.state = batch.state;
        entry.collections_manifest_json = Some(batch.collections_manifest_json);
        Ok(())
    }

    fn persisted_state(&self, partition_id: u16) -> Option<PersistedState> {
        self.partitions
            .lock()
            .get(&partition_id)
            .map(|p| p.state.clone())
    }

    fn get(&self, partition_id: u16, key: &StoredKey) -> Option<(MetadataRecord, Option<Vec<u8>>)> {
        self.partitions
            .lock()
            .get(&partition_id)?
            .documents
            .get(key)
            .map(|d| (d.metadata, d.value.clone()))
    }

    fn collections_manifest_json(&self, partition_id: u16) -> Option<Vec<u8>> {
        self.partitions
            .lock()
            .get(&partition_id)
            .and_then(|p| p.collections_manifest_json.clone())
    }

    fn scan_by_seqno(
        &self,
        partition_id: u16,
        after_seqno: i64,
        through_seqno: i64,
        limit: usize,
    ) -> Vec<BackfillRecord> {
        let partitions = self.partitions.lock();
        let Some(entry) = partitions.get(&partition_id) else {
            return Vec::new();
        };
        let mut out: Vec<BackfillRecord> = entry
            .documents
            .iter()
            .filter(|(_, doc)| doc.by_seqno > after_seqno && doc.by_seqno <= through_seqno)
            .map(|(key, doc)| BackfillRecord {
                key: key.clone(),
                metadata: doc.metadata,
                value: doc.value.clone(),
                by_seqno: doc.by_seqno,
            })
            .collect();
        out.sort_by_key(|r| r.by_seqno);
        out.truncate(limit);
        out
    }
}
