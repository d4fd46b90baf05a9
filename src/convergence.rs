//! Convergence tracker (spec §4.12): per-algorithm rolling success rate,
//! exposed without taking any consensus lock.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

const ALPHA: f64 = 0.1;
const CONVERGED_THRESHOLD: f64 = 0.8;
const DIVERGING_THRESHOLD: f64 = 0.3;
const VIEW_CHANGE_DIVERGENCE_FLOOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    Initialized,
    Converged,
    Diverging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceSnapshot {
    pub algorithm: String,
    pub success_rate: f64,
    pub status: ConvergenceStatus,
    pub height: u64,
    pub view_changes: u64,
}

struct AlgorithmRecord {
    success_rate: f64,
    status: ConvergenceStatus,
    view_changes: u64,
}

impl Default for AlgorithmRecord {
    fn default() -> Self {
        AlgorithmRecord {
            success_rate: 0.0,
            status: ConvergenceStatus::Initialized,
            view_changes: 0,
        }
    }
}

/// Tracks, per algorithm name, an EWMA(α = 0.1) success rate and the
/// `initialized → converged → diverging` status transitions it implies.
#[derive(Default)]
pub struct ConvergenceTracker {
    records: HashMap<String, AlgorithmRecord>,
    height: u64,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        ConvergenceTracker::default()
    }

    fn record_mut(&mut self, algorithm: &str) -> &mut AlgorithmRecord {
        self.records.entry(algorithm.to_string()).or_default()
    }

    /// Record a round outcome for `algorithm` at chain `height`.
    pub fn record(&mut self, algorithm: &str, success: bool, height: u64, view_changes: u64) {
        self.height = height;
        let record = self.record_mut(algorithm);
        record.success_rate = if success {
            ALPHA + (1.0 - ALPHA) * record.success_rate
        } else {
            (1.0 - ALPHA) * record.success_rate
        };
        record.view_changes = view_changes;

        record.status = if view_changes > VIEW_CHANGE_DIVERGENCE_FLOOR {
            ConvergenceStatus::Diverging
        } else if record.success_rate > CONVERGED_THRESHOLD {
            ConvergenceStatus::Converged
        } else if record.success_rate < DIVERGING_THRESHOLD && record.status != ConvergenceStatus::Initialized {
            ConvergenceStatus::Diverging
        } else {
            record.status
        };
    }

    pub fn snapshot(&self, algorithm: &str) -> ConvergenceSnapshot {
        let record = self.records.get(algorithm);
        ConvergenceSnapshot {
            algorithm: algorithm.to_string(),
            success_rate: record.map(|r| r.success_rate).unwrap_or(0.0),
            status: record.map(|r| r.status).unwrap_or(ConvergenceStatus::Initialized),
            height: self.height,
            view_changes: record.map(|r| r.view_changes).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_success_converges() {
        let mut tracker = ConvergenceTracker::new();
        for h in 1..30 {
            tracker.record("pow", true, h, 0);
        }
        let snap = tracker.snapshot("pow");
        assert_eq!(snap.status, ConvergenceStatus::Converged);
        assert!(snap.success_rate > CONVERGED_THRESHOLD);
    }

    #[test]
    fn repeated_failure_diverges_after_convergence() {
        let mut tracker = ConvergenceTracker::new();
        for h in 1..30 {
            tracker.record("pbft", true, h, 0);
        }
        for h in 30..60 {
            tracker.record("pbft", false, h, 0);
        }
        assert_eq!(tracker.snapshot("pbft").status, ConvergenceStatus::Diverging);
    }

    #[test]
    fn excessive_view_changes_force_diverging_regardless_of_success_rate() {
        let mut tracker = ConvergenceTracker::new();
        tracker.record("pbft", true, 1, 11);
        assert_eq!(tracker.snapshot("pbft").status, ConvergenceStatus::Diverging);
    }

    #[test]
    fn unknown_algorithm_snapshots_as_initialized() {
        let tracker = ConvergenceTracker::new();
        let snap = tracker.snapshot("lscc");
        assert_eq!(snap.status, ConvergenceStatus::Initialized);
        assert_eq!(snap.success_rate, 0.0);
    }
}
