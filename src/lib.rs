//! # tokio-evolve-orchestrator
//!
//! Quality-diversity program evolution over Tokio.
//!
//! ## Architecture
//!
//! One controller task owns the island archive and the RNG; a bounded pool of
//! workers runs the slow `generate → evaluate` half of each iteration:
//! ```text
//! Sample ─► Job ─► [worker × W: Generate(retry) → Cascade(stage 0..n)] ─► JobResult ─► Ingest
//!   ▲                                                                                  │
//!   └──────────── migrate every N · checkpoint every M · early stop ◄──────────────────┘
//! ```
//!
//! - [`archive`]: feature grids (MAP-Elites cells) per island, plus migration
//! - [`registry`]: append-only store of every accepted candidate
//! - [`cascade`]: staged evaluation with early exit and per-stage timeouts
//! - [`controller`]: the iteration loop, worker pool, and cancellation
//! - [`checkpoint`]: atomic, versioned snapshots for resuming a run

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod archive;
pub mod candidate;
pub mod cascade;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod evaluator;
pub mod generator;
pub mod metrics;
pub mod prompt;
pub mod providers;
pub mod registry;
pub mod retry;

// Re-exports for convenience
pub use candidate::{Candidate, CandidateId, FeatureCoord, Metrics};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager};
pub use config::{ConfigError, EvolveConfig};
pub use controller::{
    EvolutionController, Progress, RunOutcome, RunState, RunStats, StopHandle, StopReason,
};
pub use evaluator::{CommandEvaluator, EvaluationError, EvaluationOutput, Evaluator};
pub use generator::{EchoGenerator, GenerationError, Generator, OpenAiCompatibleGenerator};
pub use prompt::{PromptBuilder, TemplatePromptBuilder};
pub use providers::Providers;
pub use registry::ProgramRegistry;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`EvolveError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_evolve_orchestrator::{init_tracing, EvolveError};
/// # fn example() -> Result<(), EvolveError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), EvolveError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| {
        EvolveError::Config(ConfigError::Validation(format!("tracing init failed: {e}")))
    })
}

/// Top-level run errors.
///
/// Per [`EvolveError::is_fatal`], only configuration errors and invariant
/// violations end a run; the other kinds are absorbed per iteration and
/// counted in [`RunStats`].
#[derive(Error, Debug)]
pub enum EvolveError {
    /// Configuration is malformed or references unknown providers.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The generator failed after all retries.
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// An evaluation stage failed.
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),

    /// A checkpoint could not be written or read.
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Internal state is inconsistent; the run must stop.
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl EvolveError {
    /// Whether this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Invariant(_))
    }
}

/// Bug-class inconsistencies detected in archive, registry, or checkpoint state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// A grid write would have lowered a cell's score.
    #[error("score regression at {coordinate}: {previous} -> {attempted}")]
    ScoreRegression {
        /// Cell coordinate.
        coordinate: FeatureCoord,
        /// Occupant score before the write.
        previous: f64,
        /// Score of the rejected write.
        attempted: f64,
    },

    /// A candidate id was registered twice.
    #[error("duplicate candidate id {0}")]
    DuplicateId(CandidateId),

    /// A candidate was placed in a cell other than its own coordinate.
    #[error("candidate {id} stored at {cell} but has coordinate {recorded}")]
    CoordinateMismatch {
        /// Candidate id.
        id: CandidateId,
        /// Cell it was stored in.
        cell: FeatureCoord,
        /// Its own coordinate.
        recorded: FeatureCoord,
    },

    /// Two occupants were recorded for the same cell.
    #[error("cell {0} recorded twice")]
    DuplicateCell(FeatureCoord),

    /// A registered candidate's cell on its island has no occupant.
    #[error("candidate {id} is registered on island {island} at {coordinate}, but that cell is empty")]
    EmptyCell {
        /// Candidate id.
        id: CandidateId,
        /// Island owning the candidate.
        island: usize,
        /// The candidate's coordinate.
        coordinate: FeatureCoord,
    },

    /// A coordinate has the wrong number of components.
    #[error("candidate {id} has {actual} coordinate components, expected {expected}")]
    CoordinateArity {
        /// Candidate id.
        id: CandidateId,
        /// Configured dimension count.
        expected: usize,
        /// Components present.
        actual: usize,
    },

    /// A candidate names an island outside the island set.
    #[error("candidate {id} names island {island}, but there are {islands} islands")]
    UnknownIsland {
        /// Candidate id.
        id: CandidateId,
        /// Island it claims.
        island: usize,
        /// Island count.
        islands: usize,
    },

    /// A reference points at a candidate that is not registered.
    #[error("unknown candidate {id} referenced by {referenced_by}")]
    UnknownCandidate {
        /// Missing id.
        id: CandidateId,
        /// What held the reference (e.g. `best_candidate_id`).
        referenced_by: String,
    },

    /// A checkpoint was written for a different island count.
    #[error("checkpoint has {checkpoint} islands, configuration has {configured}")]
    IslandCountMismatch {
        /// Configured island count.
        configured: usize,
        /// Island count in the checkpoint.
        checkpoint: usize,
    },

    /// Island records in a checkpoint are not in index order.
    #[error("checkpoint island record at position {position} has id {id}")]
    IslandOrder {
        /// Position in the record list.
        position: usize,
        /// Id found there.
        id: usize,
    },

    /// A checkpoint uses an unsupported schema version.
    #[error("checkpoint schema version {found} is not supported (expected {expected})")]
    SchemaVersion {
        /// Supported version.
        expected: u32,
        /// Version found on disk.
        found: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_and_invariant_are_fatal() {
        let config = EvolveError::from(ConfigError::Validation("x".into()));
        let invariant = EvolveError::from(InvariantViolation::DuplicateId(CandidateId::new("a")));
        let generation = EvolveError::from(GenerationError::Timeout);
        let evaluation = EvolveError::from(EvaluationError::Timeout);
        assert!(config.is_fatal());
        assert!(invariant.is_fatal());
        assert!(!generation.is_fatal());
        assert!(!evaluation.is_fatal());
    }

    #[test]
    fn test_invariant_messages_name_the_cell() {
        let err = InvariantViolation::ScoreRegression {
            coordinate: FeatureCoord::new(vec![2, 3]),
            previous: 0.7,
            attempted: 0.6,
        };
        assert_eq!(err.to_string(), "score regression at (2,3): 0.7 -> 0.6");
    }

    #[test]
    fn test_init_tracing_second_call_errors() {
        let _ = init_tracing();
        assert!(init_tracing().is_err());
    }
}
