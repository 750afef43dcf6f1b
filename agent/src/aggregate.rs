//! Reduction of per-device results into a dispatch summary
//!
//! Pure functions only. Whatever order results arrive in, the summary lists
//! them by ascending device id and its counters always add up:
//! `successes + failures == results.len()`.

use crate::worker::{FailureKind, WorkResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one dispatch round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Correlates this round with its log lines
    pub dispatch_id: Uuid,

    pub total_gpus_used: usize,
    pub successes: usize,
    pub failures: usize,

    /// Iterations issued across all devices
    pub total_iterations: u64,

    /// No accelerator was found; a single logical slot was used
    pub degraded: bool,

    /// The round was cancelled; some entries were terminated early
    pub partial: bool,

    /// One entry per dispatched device, ascending by device id
    pub results: Vec<WorkResult>,
}

impl Summary {
    pub fn launch_failures(&self) -> usize {
        self.count_kind(FailureKind::LaunchFailure)
    }

    pub fn timeouts(&self) -> usize {
        self.count_kind(FailureKind::Timeout)
    }

    pub fn successful(&self) -> impl Iterator<Item = &WorkResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures == 0
    }

    fn count_kind(&self, kind: FailureKind) -> usize {
        self.results
            .iter()
            .filter(|r| r.failure_kind() == Some(kind))
            .count()
    }
}

/// Flags carried alongside the results of a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundFlags {
    pub degraded: bool,
    pub partial: bool,
}

/// True if any entry was terminated by round-level cancellation.
pub fn any_cancelled(results: &[WorkResult]) -> bool {
    results
        .iter()
        .any(|r| r.failure_kind() == Some(FailureKind::Cancelled))
}

/// Fold `results` into a [`Summary`].
///
/// `total_iterations` saturates at `u64::MAX`.
pub fn aggregate(dispatch_id: Uuid, mut results: Vec<WorkResult>, flags: RoundFlags) -> Summary {
    results.sort_by_key(|r| r.device_id);

    let successes = results.iter().filter(|r| r.success).count();
    let failures = results.len() - successes;
    let total_iterations = results
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.iterations));

    Summary {
        dispatch_id,
        total_gpus_used: results.len(),
        successes,
        failures,
        total_iterations,
        degraded: flags.degraded,
        partial: flags.partial,
        results,
    }
}
