//! Bucket: groups a bucket's partitions under one public set/get/delete
//! surface and owns the bucket-wide resident-memory budget.

use crate::collections::ClusterManifest;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hash_table::{MemoryBudget, WriteOrigin};
use crate::key::StoredKey;
use crate::partition::{MutationStamp, Partition, PartitionState};
use crate::value::{ConflictResMode, Datatype, StoredValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A named collection of partitions sharing one memory budget.
pub struct Bucket {
    /// Bucket name, used as the DCP stream namespace.
    pub name: String,
    partitions: Vec<Partition>,
    resident_bytes: AtomicUsize,
    config: EngineConfig,
}

impl Bucket {
    /// Builds a bucket with `config.num_vbuckets` brand-new `Pending`
    /// partitions.
    pub fn new(name: impl Into<String>, config: EngineConfig) -> Self {
        let partitions = (0..config.num_vbuckets)
            .map(|id| {
                Partition::new(
                    id,
                    config.hash_table_locks,
                    config.checkpoint_max_items,
                    config.checkpoint_max_bytes,
                    "::",
                    ConflictResMode::RevisionSeqno,
                    config.hlc_drift_ahead_threshold_us,
                    config.hlc_drift_behind_threshold_us,
                )
            })
            .collect();
        Self {
            name: name.into(),
            partitions,
            resident_bytes: AtomicUsize::new(0),
            config,
        }
    }

    /// Number of partitions in this bucket.
    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    /// Looks up a partition by id.
    pub fn partition(&self, id: u16) -> Result<&Partition> {
        self.partitions
            .get(id as usize)
            .ok_or(EngineError::OutOfRange(id))
    }

    /// All partitions, for the flusher/scheduler/collection-purge task.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    fn budget(&self) -> MemoryBudget {
        MemoryBudget {
            max_data_size: self.config.max_data_size,
            mutation_threshold: self.config.mutation_threshold,
            replication_threshold: self.config.replication_threshold,
        }
    }

    fn projected_bytes(&self, value_len: usize) -> usize {
        self.resident_bytes.load(Ordering::Relaxed) + value_len
    }

    fn account(&self, value_len: usize) {
        self.resident_bytes.fetch_add(value_len, Ordering::Relaxed);
    }

    /// Credits back `value_len` bytes freed by a value eviction.
    pub fn deaccount(&self, value_len: usize) {
        self.resident_bytes.fetch_sub(value_len, Ordering::Relaxed);
    }

    /// Stores a document (client-facing `set`).
    pub fn set(
        &self,
        partition_id: u16,
        key: StoredKey,
        value: Vec<u8>,
        flags: u32,
        exptime: u32,
    ) -> Result<MutationStamp> {
        let projected = self.projected_bytes(value.len());
        let stamp = self.partition(partition_id)?.set(
            key,
            value.clone(),
            flags,
            exptime,
            Datatype::Raw,
            None,
            WriteOrigin::Client,
            projected,
            &self.budget(),
        )?;
        self.account(value.len());
        Ok(stamp)
    }

    /// Inserts a document only if absent.
    pub fn add(
        &self,
        partition_id: u16,
        key: StoredKey,
        value: Vec<u8>,
        flags: u32,
        exptime: u32,
    ) -> Result<MutationStamp> {
        let projected = self.projected_bytes(value.len());
        let stamp = self.partition(partition_id)?.add(
            key,
            value.clone(),
            flags,
            exptime,
            Datatype::Raw,
            WriteOrigin::Client,
            projected,
            &self.budget(),
            false,
        )?;
        self.account(value.len());
        Ok(stamp)
    }

    /// Looks up a document.
    pub fn get(&self, partition_id: u16, key: &StoredKey) -> Result<Option<Arc<StoredValue>>> {
        self.partition(partition_id)?.get(key)
    }

    /// Soft-deletes a document.
    pub fn delete(&self, partition_id: u16, key: &StoredKey) -> Result<MutationStamp> {
        self.partition(partition_id)?.delete(key, None)
    }

    /// Applies an incoming cluster manifest to every partition.
    pub fn apply_cluster_manifest(&self, incoming: &ClusterManifest) {
        for p in &self.partitions {
            p.apply_cluster_manifest(incoming);
        }
    }

    /// Current resident-byte estimate for this bucket.
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    /// The bucket's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Activates every still-pending partition (single-node convenience;
    /// a clustered deployment would activate only the partitions this
    /// node owns).
    pub fn activate_all(&self) -> Result<()> {
        for p in &self.partitions {
            if p.state() == PartitionState::Pending {
                p.transition_to(PartitionState::Active)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let bucket = Bucket::new("default", EngineConfig::balanced());
        bucket.activate_all().unwrap();
        bucket
            .set(0, StoredKey::default_collection(b"a".to_vec()), b"v".to_vec(), 0, 0)
            .unwrap();
        let got = bucket.get(0, &StoredKey::default_collection(b"a".to_vec())).unwrap();
        assert_eq!(got.unwrap().value(), Some(b"v".to_vec()));
    }

    #[test]
    fn out_of_range_partition_errors() {
        let bucket = Bucket::new("default", EngineConfig::balanced());
        let result = bucket.get(9999, &StoredKey::default_collection(b"a".to_vec()));
        assert!(matches!(result, Err(EngineError::OutOfRange(9999))));
    }
}
