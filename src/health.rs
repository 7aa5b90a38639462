//! Health-check surface.
//!
//! A touchpoint for an external monitoring layer, not a reporting pipeline:
//! this module only computes a snapshot, it does not export one anywhere.

use serde::{Deserialize, Serialize};

/// Overall health rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All checks passing.
    Healthy,
    /// At least one check failing but the engine is still serving requests.
    Degraded,
    /// A check indicates the engine cannot make forward progress.
    Unhealthy,
}

/// An individual health signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    /// Fraction of checkpoint items still awaiting persistence, per bucket.
    PersistenceLag {
        /// Partitions whose persistence cursor trails the high seqno.
        lagging_partitions: usize,
        /// Threshold above which this check is considered unhealthy.
        threshold: usize,
        /// Whether the check currently passes.
        healthy: bool,
    },
    /// Consecutive flush failures observed.
    FlushFailures {
        /// Failures observed since the counter was last reset.
        count: u64,
        /// Whether the check currently passes.
        healthy: bool,
    },
    /// Resident memory against the configured budget.
    MemoryPressure {
        /// Fraction of `max_data_size` currently in use.
        used_fraction: f64,
        /// Threshold above which this check is considered unhealthy.
        threshold: f64,
        /// Whether the check currently passes.
        healthy: bool,
    },
}

impl Check {
    fn is_healthy(&self) -> bool {
        match self {
            Check::PersistenceLag { healthy, .. }
            | Check::FlushFailures { healthy, .. }
            | Check::MemoryPressure { healthy, .. } => *healthy,
        }
    }
}

/// A point-in-time health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Rolled-up status across all checks.
    pub status: HealthStatus,
    /// Individual checks contributing to `status`.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Starts a new, healthy report with no checks yet recorded.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Records a check, downgrading `status` if it fails. A failing
    /// `FlushFailures` check (flush retries forever per spec, so it never
    /// blocks writes) only degrades; a failing `PersistenceLag` or
    /// `MemoryPressure` check marks the node unhealthy.
    pub fn add_check(&mut self, check: Check) {
        if !check.is_healthy() {
            let escalate = matches!(
                check,
                Check::PersistenceLag { .. } | Check::MemoryPressure { .. }
            );
            self.status = match (self.status, escalate) {
                (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
                (_, true) => HealthStatus::Unhealthy,
                (_, false) => HealthStatus::Degraded,
            };
        }
        self.checks.push(check);
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_checks_healthy_stays_healthy() {
        let mut h = HealthCheck::new();
        h.add_check(Check::FlushFailures {
            count: 0,
            healthy: true,
        });
        assert_eq!(h.status, HealthStatus::Healthy);
    }

    #[test]
    fn flush_failures_only_degrade() {
        let mut h = HealthCheck::new();
        h.add_check(Check::FlushFailures {
            count: 5,
            healthy: false,
        });
        assert_eq!(h.status, HealthStatus::Degraded);
    }

    #[test]
    fn memory_pressure_marks_unhealthy() {
        let mut h = HealthCheck::new();
        h.add_check(Check::MemoryPressure {
            used_fraction: 0.99,
            threshold: 0.9,
            healthy: false,
        });
        assert_eq!(h.status, HealthStatus::Unhealthy);
    }
}
