//! Engine-wide configuration.
//!
//! Mirrors the teacher crate's `Config` module: a plain struct with a
//! `Default` plus named presets. Loading these values from a file or
//! environment is outside this crate's scope — callers construct an
//! `EngineConfig` however suits their deployment and pass it in.

/// Tunables for the partitioned index, checkpoints, flusher, and DCP.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of partitions (vbuckets) in the bucket. Production
    /// deployments typically use 1024.
    pub num_vbuckets: u16,

    /// Number of stripe mutexes guarding the hash-table chain array.
    pub hash_table_locks: usize,

    /// Fraction of `max_data_size` at which client mutations are rejected
    /// with `TmpFail` (spec default 0.9).
    pub mutation_threshold: f64,

    /// Fraction of `max_data_size` at which *replicated* mutations are
    /// rejected (spec default 0.93, looser than client writes so replica
    /// ingest can drain ahead of eviction catching up).
    pub replication_threshold: f64,

    /// Soft cap, in bytes, on resident data across the bucket.
    pub max_data_size: usize,

    /// Max items in an open checkpoint before it closes.
    pub checkpoint_max_items: usize,

    /// Max bytes in an open checkpoint before it closes.
    pub checkpoint_max_bytes: usize,

    /// Target false-positive rate for the per-partition bloom filter.
    pub bloom_false_positive_rate: f64,

    /// Resident-ratio threshold (0.0-1.0) below which the access scanner
    /// runs a sweep.
    pub access_scanner_resident_ratio: f64,

    /// Block size used when writing `MutationLog` access-log files.
    pub access_log_block_size: usize,

    /// TTL, in milliseconds, of a soft lock acquired via `getLocked`.
    pub soft_lock_ttl_ms: u64,

    /// DCP NOOP interval, in milliseconds.
    pub dcp_noop_interval_ms: u64,

    /// Default flow-control buffer size, in bytes, for a new DCP stream.
    pub dcp_buffer_size: usize,

    /// Max items drained from a single partition's checkpoint cursor per
    /// flusher pass.
    pub flusher_batch_size: usize,

    /// Minimum flusher sleep between wake-ups with no checkpoint waiters.
    pub flusher_min_sleep_ms: u64,

    /// Number of worker threads per scheduler lane.
    pub scheduler_threads_per_lane: usize,

    /// Warn threshold, in microseconds, for HLC drift-ahead detection.
    pub hlc_drift_ahead_threshold_us: i64,

    /// Warn threshold, in microseconds, for HLC drift-behind detection.
    pub hlc_drift_behind_threshold_us: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_vbuckets: 1024,
            hash_table_locks: 47,
            mutation_threshold: 0.9,
            replication_threshold: 0.93,
            max_data_size: 1 << 30,
            checkpoint_max_items: 10_000,
            checkpoint_max_bytes: 8 << 20,
            bloom_false_positive_rate: 0.01,
            access_scanner_resident_ratio: 0.9,
            access_log_block_size: 4096,
            soft_lock_ttl_ms: 15_000,
            dcp_noop_interval_ms: 20_000,
            dcp_buffer_size: 10 << 20,
            flusher_batch_size: 4_000,
            flusher_min_sleep_ms: 1,
            scheduler_threads_per_lane: 4,
            hlc_drift_ahead_threshold_us: 5_000_000,
            hlc_drift_behind_threshold_us: 5_000_000,
        }
    }
}

impl EngineConfig {
    /// Conservative preset: small checkpoints, tight memory admission,
    /// frequent access scanning. Suited to small/constrained nodes.
    pub fn production() -> Self {
        Self {
            num_vbuckets: 1024,
            hash_table_locks: 47,
            mutation_threshold: 0.9,
            replication_threshold: 0.93,
            max_data_size: 1 << 30,
            checkpoint_max_items: 10_000,
            checkpoint_max_bytes: 8 << 20,
            bloom_false_positive_rate: 0.01,
            access_scanner_resident_ratio: 0.9,
            access_log_block_size: 4096,
            soft_lock_ttl_ms: 15_000,
            dcp_noop_interval_ms: 20_000,
            dcp_buffer_size: 10 << 20,
            flusher_batch_size: 4_000,
            flusher_min_sleep_ms: 1,
            scheduler_threads_per_lane: 4,
            hlc_drift_ahead_threshold_us: 5_000_000,
            hlc_drift_behind_threshold_us: 5_000_000,
        }
    }

    /// Higher-throughput preset: larger checkpoints and batches, looser
    /// admission thresholds. Suited to bulk-load or benchmark workloads.
    pub fn benchmark() -> Self {
        Self {
            num_vbuckets: 128,
            hash_table_locks: 31,
            mutation_threshold: 0.97,
            replication_threshold: 0.98,
            max_data_size: 4 << 30,
            checkpoint_max_items: 50_000,
            checkpoint_max_bytes: 64 << 20,
            bloom_false_positive_rate: 0.05,
            access_scanner_resident_ratio: 0.5,
            access_log_block_size: 4096,
            soft_lock_ttl_ms: 15_000,
            dcp_noop_interval_ms: 20_000,
            dcp_buffer_size: 64 << 20,
            flusher_batch_size: 20_000,
            flusher_min_sleep_ms: 0,
            scheduler_threads_per_lane: 8,
            hlc_drift_ahead_threshold_us: 10_000_000,
            hlc_drift_behind_threshold_us: 10_000_000,
        }
    }

    /// Small, single-node preset used by tests and examples.
    pub fn balanced() -> Self {
        Self {
            num_vbuckets: 8,
            hash_table_locks: 7,
            ..Self::default()
        }
    }
}
