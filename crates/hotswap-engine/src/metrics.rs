//! Engine-wide transaction metrics
//!
//! Counters are plain atomics so that recording never takes a lock on the
//! commit path. [`MetricsRecorder::snapshot`] copies them into an
//! [`EngineMetrics`] value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_failed: u64,
    /// Transactions currently open
    pub active_transactions: u64,
    pub conflicts_detected: u64,
    pub conflicts_auto_resolved: u64,
    pub average_commit_us: u64,
    pub max_commit_us: u64,
    pub average_rollback_us: u64,
    pub max_rollback_us: u64,
    pub recoveries: u64,
    pub recovery_budget_overruns: u64,
    /// Calls refused by an open breaker
    pub circuit_rejections: u64,
}

impl EngineMetrics {
    /// Committed share of finished transactions
    pub fn commit_rate(&self) -> f64 {
        let finished =
            self.transactions_committed + self.transactions_aborted + self.transactions_failed;
        if finished == 0 {
            0.0
        } else {
            self.transactions_committed as f64 / finished as f64
        }
    }
}

#[derive(Debug, Default)]
struct Latency {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl Latency {
    fn record(&self, us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn average(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        self.total_us
            .load(Ordering::Relaxed)
            .checked_div(count)
            .unwrap_or(0)
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_us.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

/// Lock-free counters updated by the engine
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    conflicts: AtomicU64,
    auto_resolved: AtomicU64,
    commit: Latency,
    rollback: Latency,
    recoveries: AtomicU64,
    overruns: AtomicU64,
    rejections: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn finished(&self) {
        // Never underflow if reset ran while transactions were open
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn committed(&self, commit_us: u64) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.commit.record(commit_us);
        self.finished();
    }

    pub(crate) fn aborted(&self, rollback_us: u64) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
        self.rollback.record(rollback_us);
        self.finished();
    }

    pub(crate) fn failed(&self, rollback_us: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.rollback.record(rollback_us);
        self.finished();
    }

    pub(crate) fn conflict(&self, auto_resolved: bool) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        if auto_resolved {
            self.auto_resolved.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn recovery(&self, over_budget: bool) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        if over_budget {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn rejected(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineMetrics {
        EngineMetrics {
            transactions_started: self.started.load(Ordering::Relaxed),
            transactions_committed: self.committed.load(Ordering::Relaxed),
            transactions_aborted: self.aborted.load(Ordering::Relaxed),
            transactions_failed: self.failed.load(Ordering::Relaxed),
            active_transactions: self.active.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts.load(Ordering::Relaxed),
            conflicts_auto_resolved: self.auto_resolved.load(Ordering::Relaxed),
            average_commit_us: self.commit.average(),
            max_commit_us: self.commit.max_us.load(Ordering::Relaxed),
            average_rollback_us: self.rollback.average(),
            max_rollback_us: self.rollback.max_us.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recovery_budget_overruns: self.overruns.load(Ordering::Relaxed),
            circuit_rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter except the number of open transactions
    pub(crate) fn reset(&self) {
        for counter in [
            &self.started,
            &self.committed,
            &self.aborted,
            &self.failed,
            &self.conflicts,
            &self.auto_resolved,
            &self.recoveries,
            &self.overruns,
            &self.rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.commit.reset();
        self.rollback.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_latency() {
        let m = MetricsRecorder::default();
        m.started();
        m.started();
        m.started();
        m.committed(100);
        m.committed(300);
        m.aborted(50);
        m.conflict(true);
        m.conflict(false);

        let s = m.snapshot();
        assert_eq!(s.transactions_started, 3);
        assert_eq!(s.active_transactions, 0);
        assert_eq!(s.average_commit_us, 200);
        assert_eq!(s.max_commit_us, 300);
        assert_eq!(s.max_rollback_us, 50);
        assert_eq!(s.conflicts_detected, 2);
        assert_eq!(s.conflicts_auto_resolved, 1);
        assert!((s.commit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_active() {
        let m = MetricsRecorder::default();
        m.started();
        m.started();
        m.committed(10);
        m.reset();

        let s = m.snapshot();
        assert_eq!(s.transactions_started, 0);
        assert_eq!(s.transactions_committed, 0);
        assert_eq!(s.average_commit_us, 0);
        assert_eq!(s.active_transactions, 1);

        m.aborted(5);
        assert_eq!(m.snapshot().active_transactions, 0);
    }
}
