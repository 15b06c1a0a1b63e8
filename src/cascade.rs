//! # Cascade Evaluation
//!
//! ## Responsibility
//! Drive one candidate through the ordered evaluation stages, stopping at
//! the first stage that fails or scores below its threshold.
//!
//! ## Guarantees
//! - Early exit: once a stage fails or rejects, later stages are never invoked
//! - Bounded: every stage call is wrapped in `tokio::time::timeout` with the
//!   stage's own limit; an overrun is a failure with reason `"timeout"`
//! - Explicit outcome: the result is a [`StageOutcome`] value, never an error
//!   that callers must catch
//!
//! ## NOT Responsible For
//! - Running candidate code (see: `evaluator`)
//! - Validating metrics or computing coordinates (see: `controller`)

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::config::StageConfig;
use crate::evaluator::{EvaluationError, Evaluator};
use crate::metrics;

/// How a cascade run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Every configured stage passed.
    Passed,
    /// Stage `i` succeeded but its threshold metric was below the threshold.
    RejectedAtStage(usize),
    /// Stage `stage` could not produce a usable result.
    Failed {
        /// 0-based stage index.
        stage: usize,
        /// Failure reason (e.g. `"timeout"`).
        reason: String,
    },
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::RejectedAtStage(i) => write!(f, "rejected_at_stage_{i}"),
            Self::Failed { reason, .. } => write!(f, "{reason}"),
        }
    }
}

/// Everything the cascade learned about one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeReport {
    /// Final outcome.
    pub outcome: StageOutcome,
    /// Metrics returned by the last executed stage, empty if it returned none.
    pub metrics: BTreeMap<String, f64>,
    /// Artifacts from every executed stage; later stages overwrite earlier keys.
    pub artifacts: BTreeMap<String, Vec<u8>>,
    /// Number of stages invoked.
    pub stages_run: usize,
}

impl CascadeReport {
    /// Whether the candidate passed every stage.
    pub fn is_valid(&self) -> bool {
        self.outcome == StageOutcome::Passed
    }

    /// Failure reason for statistics, `None` when valid.
    pub fn failure_reason(&self) -> Option<String> {
        match self.outcome {
            StageOutcome::Passed => None,
            _ => Some(self.outcome.to_string()),
        }
    }
}

/// Run `source` through `stages` in order.
///
/// Stage `i` outcome:
/// - evaluator error or timeout → [`StageOutcome::Failed`], stop
/// - `valid == false` → [`StageOutcome::Failed`] with the evaluator's reason, stop
/// - threshold set and `metrics[threshold_metric] < threshold` →
///   [`StageOutcome::RejectedAtStage`], stop
/// - threshold metric absent → [`StageOutcome::Failed`] with
///   `missing_metric:<name>`, stop
///
/// An empty stage list passes with no metrics; the caller then rejects the
/// candidate for lacking a score.
///
/// # Panics
///
/// This function never panics.
pub async fn run_cascade(
    evaluator: &dyn Evaluator,
    source: &str,
    stages: &[StageConfig],
) -> CascadeReport {
    let mut report = CascadeReport {
        outcome: StageOutcome::Passed,
        metrics: BTreeMap::new(),
        artifacts: BTreeMap::new(),
        stages_run: 0,
    };

    for (index, stage) in stages.iter().enumerate() {
        let timeout = stage.timeout();
        let started = Instant::now();
        let result =
            match tokio::time::timeout(timeout, evaluator.evaluate(source, index, stage, timeout))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EvaluationError::Timeout),
            };
        metrics::record_stage_latency(&stage.name, started.elapsed());
        report.stages_run += 1;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                debug!(stage = %stage.name, error = %e, "cascade: stage failed");
                report.outcome = StageOutcome::Failed {
                    stage: index,
                    reason: e.to_string(),
                };
                return report;
            }
        };

        report.artifacts.extend(output.artifacts);
        report.metrics = output.metrics;

        if !output.valid {
            report.outcome = StageOutcome::Failed {
                stage: index,
                reason: output.failure_reason.unwrap_or_else(|| "invalid".to_string()),
            };
            return report;
        }

        if let Some(threshold) = stage.threshold {
            match report.metrics.get(&stage.threshold_metric) {
                None => {
                    report.outcome = StageOutcome::Failed {
                        stage: index,
                        reason: format!("missing_metric:{}", stage.threshold_metric),
                    };
                    return report;
                }
                Some(value) if *value < threshold => {
                    debug!(stage = %stage.name, value, threshold, "cascade: below threshold");
                    report.outcome = StageOutcome::RejectedAtStage(index);
                    return report;
                }
                Some(_) => {}
            }
        }
    }

    report
}
