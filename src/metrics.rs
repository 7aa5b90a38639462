//! Engine-wide performance counters.
//!
//! A touchpoint, not a reporting surface: exporting these to statsd/Prometheus
//! is outside this crate's scope. Callers snapshot the struct periodically.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters covering the hot paths of the engine.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    /// Hash-table `find` hits.
    pub cache_hits: AtomicU64,
    /// Hash-table `find` misses (including background-fetch triggers).
    pub cache_misses: AtomicU64,
    /// Flush batches committed successfully.
    pub flush_success: AtomicU64,
    /// Flush batches that failed and were re-queued.
    pub flush_failed: AtomicU64,
    /// Items evicted (value-only or full).
    pub evictions: AtomicU64,
    /// Rollback tasks executed by a replication consumer.
    pub rollbacks: AtomicU64,
    /// Checkpoints closed (open -> closed transition).
    pub checkpoints_closed: AtomicU64,
    /// System events enqueued by the collection engine.
    pub system_events: AtomicU64,
}

impl PerformanceMetrics {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cache hit rate in `[0.0, 1.0]`; `0.0` when no lookups yet.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.flush_success.store(0, Ordering::Relaxed);
        self.flush_failed.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.checkpoints_closed.store(0, Ordering::Relaxed);
        self.system_events.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_with_no_samples_is_zero() {
        let m = PerformanceMetrics::new();
        assert_eq!(m.cache_hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_counters() {
        let m = PerformanceMetrics::new();
        m.cache_hits.fetch_add(3, Ordering::Relaxed);
        m.cache_misses.fetch_add(1, Ordering::Relaxed);
        assert_eq!(m.cache_hit_rate(), 0.75);
    }
}
