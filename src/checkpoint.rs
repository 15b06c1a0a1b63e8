//! # Checkpoint Manager
//!
//! ## Responsibility
//! Snapshot the reproducible state of a run (island grids, program
//! registry, RNG position, loop counters) and restore it at startup.
//!
//! ## Guarantees
//! - Atomic: `checkpoint.json` is written to a temp file in the same
//!   directory, fsynced, then renamed over the previous file; a crash leaves
//!   either the old or the new checkpoint, never a torn one
//! - Versioned: every file carries `schema_version`; other versions are refused
//! - Validated: [`Checkpoint::restore`] rejects any inconsistency as an
//!   [`InvariantViolation`] instead of resuming from corrupt state
//! - Non-fatal writes: a failed save returns an error and leaves the prior
//!   checkpoint untouched; the caller decides whether to continue
//!
//! ## NOT Responsible For
//! - Deciding when to checkpoint (see: `controller`)

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::IslandSet;
use crate::candidate::{unix_now_ms, Candidate, CandidateId, FeatureCoord};
use crate::config::EvolveConfig;
use crate::controller::state::{EarlyStopping, RunStats};
use crate::registry::ProgramRegistry;
use crate::InvariantViolation;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the checkpoint inside the checkpoint directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Source text of the best candidate, written next to the checkpoint.
pub const BEST_PROGRAM_FILE: &str = "best_program.txt";

/// Metadata of the best candidate, written next to the checkpoint.
pub const BEST_PROGRAM_INFO_FILE: &str = "best_program_info.json";

/// Errors from writing or reading checkpoint files.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Filesystem operation failed.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint could not be encoded.
    #[error("checkpoint encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The checkpoint file is not valid JSON for this schema.
    #[error("checkpoint decode error in {path}: {source}")]
    Decode {
        /// Path read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The blocking writer task panicked or was cancelled.
    #[error("checkpoint writer task failed: {0}")]
    Background(String),
}

/// Exact position of the controller RNG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    /// ChaCha key.
    pub seed: [u8; 32],
    /// Stream id.
    pub stream: u64,
    /// High 64 bits of the word position.
    pub word_pos_hi: u64,
    /// Low 64 bits of the word position.
    pub word_pos_lo: u64,
}

impl RngState {
    /// Capture the generator's current position.
    pub fn capture(rng: &ChaCha8Rng) -> Self {
        let pos = rng.get_word_pos();
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos_hi: (pos >> 64) as u64,
            word_pos_lo: pos as u64,
        }
    }

    /// Rebuild a generator that continues exactly where the captured one was.
    pub fn restore(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos((u128::from(self.word_pos_hi) << 64) | u128::from(self.word_pos_lo));
        rng
    }
}

/// One occupied cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Cell coordinate.
    pub coordinate: FeatureCoord,
    /// Occupant id.
    pub candidate_id: CandidateId,
}

/// One island's grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandRecord {
    /// Island index.
    pub id: usize,
    /// Occupied cells in coordinate order.
    pub grid: Vec<CellRecord>,
}

/// Versioned, resumable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version, see [`SCHEMA_VERSION`].
    pub schema_version: u32,
    /// Iterations processed when the snapshot was taken.
    pub iteration: u64,
    /// Best candidate at snapshot time.
    pub best_candidate_id: Option<CandidateId>,
    /// Grid contents per island.
    pub islands: Vec<IslandRecord>,
    /// Every registered candidate, in registration order.
    pub programs: Vec<Candidate>,
    /// Controller RNG position.
    pub rng_state: RngState,
    /// Unix milliseconds at snapshot time.
    pub timestamp_ms: u64,
    /// Early-stopping bookkeeping.
    #[serde(default)]
    pub early_stop: EarlyStopping,
    /// Counters.
    #[serde(default)]
    pub stats: RunStats,
    /// Seed text used as parent while islands are empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_source: Option<String>,
}

/// Everything needed to continue a run, rebuilt from a [`Checkpoint`].
#[derive(Debug)]
pub struct RestoredRun {
    /// Iterations already processed.
    pub iteration: u64,
    /// Rebuilt islands.
    pub islands: IslandSet,
    /// Rebuilt registry.
    pub registry: ProgramRegistry,
    /// RNG positioned where the snapshot left it.
    pub rng: ChaCha8Rng,
    /// Best candidate.
    pub best: Option<Arc<Candidate>>,
    /// Early-stopping bookkeeping.
    pub early_stop: EarlyStopping,
    /// Counters.
    pub stats: RunStats,
    /// Seed fallback text.
    pub fallback_source: Option<String>,
}

/// Loop state captured alongside the archive.
#[derive(Debug, Clone)]
pub struct LoopSnapshot<'a> {
    /// Iterations processed.
    pub iteration: u64,
    /// Best candidate id.
    pub best_candidate_id: Option<CandidateId>,
    /// Controller RNG.
    pub rng: &'a ChaCha8Rng,
    /// Early-stopping bookkeeping.
    pub early_stop: &'a EarlyStopping,
    /// Counters.
    pub stats: &'a RunStats,
    /// Seed fallback text.
    pub fallback_source: Option<&'a str>,
}

impl Checkpoint {
    /// Snapshot the archive and loop state.
    pub fn capture(islands: &IslandSet, registry: &ProgramRegistry, state: LoopSnapshot<'_>) -> Self {
        let islands = islands
            .islands()
            .iter()
            .map(|island| IslandRecord {
                id: island.id(),
                grid: island
                    .grid()
                    .cells()
                    .map(|(coord, c)| CellRecord {
                        coordinate: coord.clone(),
                        candidate_id: c.id.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            iteration: state.iteration,
            best_candidate_id: state.best_candidate_id,
            islands,
            programs: registry.snapshot().iter().map(|c| (**c).clone()).collect(),
            rng_state: RngState::capture(state.rng),
            timestamp_ms: unix_now_ms(),
            early_stop: state.early_stop.clone(),
            stats: state.stats.clone(),
            fallback_source: state.fallback_source.map(str::to_string),
        }
    }

    /// Validate the snapshot against `config` and rebuild the run state.
    ///
    /// # Errors
    ///
    /// Returns an [`InvariantViolation`] when:
    /// - the schema version is not [`SCHEMA_VERSION`]
    /// - the island count differs from `database.num_islands`
    /// - island records are out of order
    /// - a program id repeats
    /// - a cell references an unregistered id, or a candidate whose own
    ///   coordinate or island differs from the cell
    /// - the best id is not registered
    pub fn restore(self, config: &EvolveConfig) -> Result<RestoredRun, InvariantViolation> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(InvariantViolation::SchemaVersion {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        let configured = config.database.num_islands;
        if self.islands.len() != configured {
            return Err(InvariantViolation::IslandCountMismatch {
                configured,
                checkpoint: self.islands.len(),
            });
        }

        let registry = ProgramRegistry::from_programs(self.programs)?;

        let mut cells = Vec::with_capacity(self.islands.len());
        for (position, record) in self.islands.into_iter().enumerate() {
            if record.id != position {
                return Err(InvariantViolation::IslandOrder {
                    position,
                    id: record.id,
                });
            }
            let island_cells = record
                .grid
                .into_iter()
                .map(|cell| {
                    let candidate = registry.get(&cell.candidate_id).ok_or_else(|| {
                        InvariantViolation::UnknownCandidate {
                            id: cell.candidate_id.clone(),
                            referenced_by: format!("island {position} cell {}", cell.coordinate),
                        }
                    })?;
                    Ok((cell.coordinate, candidate))
                })
                .collect::<Result<Vec<_>, InvariantViolation>>()?;
            cells.push(island_cells);
        }

        let islands = IslandSet::restore(
            configured,
            config.database.topology,
            config.database.feature_dimensions.len(),
            cells,
            &registry,
        )?;

        let best = match &self.best_candidate_id {
            None => None,
            Some(id) => Some(registry.get(id).ok_or_else(|| {
                InvariantViolation::UnknownCandidate {
                    id: id.clone(),
                    referenced_by: "best_candidate_id".to_string(),
                }
            })?),
        };

        Ok(RestoredRun {
            iteration: self.iteration,
            islands,
            registry,
            rng: self.rng_state.restore(),
            best,
            early_stop: self.early_stop,
            stats: self.stats,
            fallback_source: self.fallback_source,
        })
    }

    fn best_program(&self) -> Option<&Candidate> {
        let id = self.best_candidate_id.as_ref()?;
        self.programs.iter().find(|c| &c.id == id)
    }
}

/// Reads and atomically writes checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manage checkpoints under `dir` (created on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of `checkpoint.json`.
    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Write `checkpoint` atomically, then export the best program.
    ///
    /// The best-program files are best effort: failures there are logged
    /// and do not fail the save.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the checkpoint itself could not be
    /// written; the previous `checkpoint.json` is then left as it was.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(CheckpointError::Encode)?;
        self.write_atomic(CHECKPOINT_FILE, &bytes)?;
        info!(
            iteration = checkpoint.iteration,
            programs = checkpoint.programs.len(),
            path = %self.path().display(),
            "checkpoint saved"
        );

        if let Some(best) = checkpoint.best_program() {
            if let Err(e) = self.export_best(best, checkpoint.iteration) {
                warn!(error = %e, "best program export failed");
            }
        }
        Ok(())
    }

    /// [`save`](Self::save) on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// As [`save`](Self::save), plus [`CheckpointError::Background`] if the
    /// blocking task could not complete.
    pub async fn save_in_background(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.save(&checkpoint))
            .await
            .map_err(|e| CheckpointError::Background(e.to_string()))?
    }

    /// Load `checkpoint.json` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file exists but cannot be read or decoded.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load a checkpoint from an explicit file.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be read or decoded.
    pub fn load_from(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Decode {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), CheckpointError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CheckpointError::Io { path, source }
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
        tmp.flush().map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        let target = self.dir.join(name);
        tmp.persist(&target).map_err(|e| CheckpointError::Io {
            path: target.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    fn export_best(&self, best: &Candidate, iteration: u64) -> Result<(), CheckpointError> {
        self.write_atomic(BEST_PROGRAM_FILE, best.source.as_bytes())?;
        let info = serde_json::json!({
            "id": best.id,
            "parent_id": best.parent_id,
            "generation": best.generation,
            "island_id": best.island_id,
            "iteration": iteration,
            "score": best.score(),
            "metrics": best.metrics,
            "coordinate": best.coordinate,
        });
        let bytes = serde_json::to_vec_pretty(&info).map_err(CheckpointError::Encode)?;
        self.write_atomic(BEST_PROGRAM_INFO_FILE, &bytes)
    }
}
