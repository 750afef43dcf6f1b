//! Cumulative dispatch statistics
//!
//! Counters survive across dispatch rounds on the same dispatcher and can be
//! read from any thread while a round is in flight.

use crate::aggregate::Summary;
use crate::worker::{FailureKind, WorkResult};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Dispatch rounds completed
    pub rounds: AtomicU64,

    /// Device runs that exited 0
    pub runs_succeeded: AtomicU64,

    /// Device runs that failed for any reason
    pub runs_failed: AtomicU64,

    pub launch_failures: AtomicU64,
    pub timeouts: AtomicU64,

    /// Total execution time across all device runs (milliseconds)
    pub total_execution_time_ms: AtomicU64,

    /// Device runs currently in flight
    pub active_workers: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one settled device run
    pub fn record(&self, result: &WorkResult) {
        if result.success {
            self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }

        match result.failure_kind() {
            Some(FailureKind::LaunchFailure) => {
                self.launch_failures.fetch_add(1, Ordering::Relaxed);
            }
            Some(FailureKind::Timeout) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        self.total_execution_time_ms
            .fetch_add(result.elapsed_ms, Ordering::Relaxed);
    }

    /// Record a completed round
    pub fn record_round(&self, summary: &Summary) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        for result in &summary.results {
            self.record(result);
        }
    }

    pub fn start_worker(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_worker(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Total device runs (succeeded + failed)
    pub fn total_runs(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed) + self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn avg_execution_time_ms(&self) -> f64 {
        let total_runs = self.total_runs();
        if total_runs == 0 {
            return 0.0;
        }

        let total_time = self.total_execution_time_ms.load(Ordering::Relaxed);
        total_time as f64 / total_runs as f64
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total_runs = self.total_runs();
        if total_runs == 0 {
            return 0.0;
        }

        let succeeded = self.runs_succeeded.load(Ordering::Relaxed);
        succeeded as f64 / total_runs as f64
    }

    pub fn active_workers(&self) -> u64 {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn print_summary(&self) {
        info!(
            rounds = self.rounds.load(Ordering::Relaxed),
            total_runs = self.total_runs(),
            succeeded = self.runs_succeeded.load(Ordering::Relaxed),
            failed = self.runs_failed.load(Ordering::Relaxed),
            launch_failures = self.launch_failures.load(Ordering::Relaxed),
            timeouts = self.timeouts.load(Ordering::Relaxed),
            avg_execution_time_ms = format!("{:.2}", self.avg_execution_time_ms()),
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            "Dispatch statistics"
        );
    }
}
