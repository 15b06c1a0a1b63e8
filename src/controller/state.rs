//! Run state, statistics and early-stopping bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::candidate::CandidateId;

/// Why a run reached [`RunState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The iteration budget was used up.
    BudgetExhausted,
    /// No improvement for `early_stopping_patience` evaluated iterations.
    EarlyStopped,
    /// An external stop signal was received.
    Cancelled,
    /// A fatal error ended the run.
    Aborted,
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, `start` not called yet.
    Idle,
    /// Dispatching and ingesting iterations.
    Running,
    /// No new dispatches; waiting for in-flight workers.
    Draining,
    /// Terminal.
    Stopped(StopReason),
}

/// Per-run counters. Recoverable failures are absorbed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Iterations whose candidate went through the cascade.
    pub evaluated: u64,
    /// Evaluated candidates that passed every stage and had usable features.
    pub valid: u64,
    /// Evaluated candidates that were rejected or failed.
    pub invalid: u64,
    /// Iterations abandoned because generation failed.
    pub abandoned: u64,
    /// Valid candidates that took over a grid cell.
    pub accepted_into_grid: u64,
    /// Failure counts keyed by failure kind (`timeout`, `generation:rate_limited`, …).
    pub failures: BTreeMap<String, u64>,
    /// Threshold rejections keyed by stage index.
    pub rejected_at_stage: BTreeMap<usize, u64>,
    /// Migration rounds run.
    pub migrations: u64,
    /// Migrant copies accepted by destination grids.
    pub migrants_accepted: u64,
    /// Checkpoints written.
    pub checkpoints_written: u64,
    /// Checkpoint attempts that failed.
    pub checkpoints_failed: u64,
}

impl RunStats {
    /// Count one failure under the kind derived from `reason`.
    pub fn record_failure(&mut self, reason: &str) {
        *self.failures.entry(failure_kind(reason)).or_default() += 1;
    }
}

/// Collapse a free-form failure reason to a stable statistics key.
///
/// The key is the text before the first `:` or `(`, trimmed, so
/// `"crashed: signal 9"` and `"crashed: oom"` share the key `crashed`.
pub fn failure_kind(reason: &str) -> String {
    let end = reason.find([':', '(']).unwrap_or(reason.len());
    let kind = reason[..end].trim();
    if kind.is_empty() {
        "unknown".to_string()
    } else {
        kind.to_string()
    }
}

/// What an external observer sees, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Iterations processed so far.
    pub iteration: u64,
    /// Best score so far.
    pub best_score: Option<f64>,
    /// Id of the best candidate so far.
    pub best_candidate_id: Option<CandidateId>,
    /// Lifecycle state.
    pub state: RunState,
    /// Counters.
    pub stats: RunStats,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            iteration: 0,
            best_score: None,
            best_candidate_id: None,
            state: RunState::Idle,
            stats: RunStats::default(),
        }
    }
}

/// Tracks improvement of the best score across evaluated iterations.
///
/// An evaluated iteration improves the run when its candidate is valid and
/// beats the best score by more than the convergence threshold. Every other
/// evaluated iteration increments the stale count; abandoned iterations are
/// not observed at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    best_score: Option<f64>,
    last_improvement: u64,
    stale: u64,
}

impl EarlyStopping {
    /// Record an evaluated iteration. `score` is `None` for invalid candidates.
    ///
    /// Returns `true` if this iteration improved the best score.
    pub fn observe(&mut self, iteration: u64, score: Option<f64>, threshold: f64) -> bool {
        let improved = match (score, self.best_score) {
            (Some(s), None) => s.is_finite(),
            (Some(s), Some(best)) => s - best > threshold,
            (None, _) => false,
        };
        if improved {
            self.best_score = score;
            self.last_improvement = iteration;
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        improved
    }

    /// Whether the stale count has reached `patience`.
    pub fn should_stop(&self, patience: Option<u64>) -> bool {
        patience.is_some_and(|p| self.stale >= p)
    }

    /// Iteration of the last improvement.
    pub fn last_improvement(&self) -> u64 {
        self.last_improvement
    }

    /// Evaluated iterations since the last improvement.
    pub fn stale(&self) -> u64 {
        self.stale
    }
}
