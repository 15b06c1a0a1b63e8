//! # Evolution Controller
//!
//! ## Responsibility
//! Drive the `Sample → Generate → Evaluate → Ingest` loop until the
//! iteration budget is used up, early stopping fires, or a stop signal
//! arrives. Schedules migration and checkpointing on fixed cadences.
//!
//! ## Guarantees
//! - Single owner: the island set and the RNG live on the controller task;
//!   `Sample` and `Ingest` run there and nowhere else
//! - Bounded: at most `workers.count` iterations are in flight
//! - Atomic ingest: registering and inserting a candidate happen without an
//!   intervening `.await`, so cancellation never leaves half an ingest behind
//! - Fail-loud: an [`InvariantViolation`](crate::InvariantViolation) aborts the
//!   run and is returned; generation, evaluation and checkpoint failures are
//!   counted in [`RunStats`] and the loop continues
//!
//! ## NOT Responsible For
//! - Generating or scoring programs (see: `worker`, `cascade`)
//! - Parsing configuration files (see: `config::loader`)

pub mod state;
mod worker;

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::{Discretizer, IslandSet, SampleStrategy};
use crate::candidate::{unix_now_ms, Candidate, CandidateId, Metrics};
use crate::cascade::{run_cascade, CascadeReport, StageOutcome};
use crate::checkpoint::{Checkpoint, CheckpointManager, LoopSnapshot, RestoredRun};
use crate::config::loader::validate_config;
use crate::config::{ConfigError, EvolveConfig, IslandSelection};
use crate::evaluator::Evaluator;
use crate::generator::GenerationParams;
use crate::metrics;
use crate::prompt::FeatureContext;
use crate::providers::{GeneratorEnsemble, Providers};
use crate::registry::ProgramRegistry;
use crate::retry::RetryPolicy;
use crate::{EvolveError, InvariantViolation};

pub use state::{EarlyStopping, Progress, RunState, RunStats, StopReason};

use worker::{run_worker, Job, JobOutcome, JobResult, WorkerContext};

/// Requests a graceful stop of a running controller.
///
/// Cloneable and usable from any task; stopping twice is harmless.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Stop dispatching; in-flight iterations get the configured grace period.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Result of a run that ended without a fatal error.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Best candidate seen, if any candidate was ever valid.
    pub best: Option<Arc<Candidate>>,
    /// Iterations processed, including those from a resumed checkpoint.
    pub iteration: u64,
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Final counters.
    pub stats: RunStats,
    /// Every accepted candidate.
    pub registry: ProgramRegistry,
}

/// Owns the configuration and collaborators for one evolution run.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tokio_evolve_orchestrator::*;
/// # async fn example() -> Result<(), EvolveError> {
/// let providers = Providers::builder()
///     .generator("default", Arc::new(EchoGenerator::new()))
///     .build();
/// let controller = EvolutionController::new(EvolveConfig::default(), providers)?;
/// let evaluator = Arc::new(CommandEvaluator::new("python3").with_args(["eval.py"]));
/// let outcome = controller.start("def f(): return 1", evaluator, 100, None).await?;
/// println!("best: {:?}", outcome.best.map(|c| c.score()));
/// # Ok(()) }
/// ```
pub struct EvolutionController {
    config: EvolveConfig,
    providers: Providers,
    ensemble: GeneratorEnsemble,
    discretizer: Discretizer,
    checkpoints: Option<CheckpointManager>,
    island_weights: Option<WeightedIndex<f64>>,
    strategies: [SampleStrategy; 3],
    strategy_weights: WeightedIndex<f64>,
    progress_tx: watch::Sender<Progress>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl EvolutionController {
    /// Validate `config` and resolve every provider key it names.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::Config`] for invalid configuration, an
    /// unknown generator key, or weights that cannot form a distribution.
    pub fn new(config: EvolveConfig, providers: Providers) -> Result<Self, EvolveError> {
        validate_config(&config)?;
        let ensemble = providers.ensemble(&config.generation)?;
        let discretizer = Discretizer::new(config.database.feature_dimensions.clone());
        let checkpoints = config.run.checkpoint_dir.clone().map(CheckpointManager::new);

        let island_weights = match config.database.island_selection {
            IslandSelection::RoundRobin => None,
            IslandSelection::Weighted => Some(
                WeightedIndex::new(config.database.island_weights.iter().copied())
                    .map_err(|e| weights_error("database.island_weights", e))?,
            ),
        };
        let pairs = config.database.strategy_weights();
        let strategies = pairs.map(|(s, _)| s);
        let strategy_weights = WeightedIndex::new(pairs.iter().map(|(_, w)| *w))
            .map_err(|e| weights_error("database.*_ratio", e))?;

        let (progress_tx, _) = watch::channel(Progress::default());
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            providers,
            ensemble,
            discretizer,
            checkpoints,
            island_weights,
            strategies,
            strategy_weights,
            progress_tx,
            stop_tx: Arc::new(stop_tx),
        })
    }

    /// Use `manager` for checkpoints instead of `run.checkpoint_dir`.
    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// The validated configuration.
    pub fn config(&self) -> &EvolveConfig {
        &self.config
    }

    /// Observe progress. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// Handle for stopping the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Run until the budget is used up, early stopping fires, or a stop is
    /// requested.
    ///
    /// Without `resume`, `initial_source` is evaluated as iteration 0 and,
    /// if valid, seeds every island. With `resume`, the archive, registry,
    /// RNG and counters come from the checkpoint and `initial_source` is
    /// only a fallback parent for empty islands. `iteration_budget` counts
    /// the iterations dispatched by this call.
    ///
    /// A final checkpoint is written whenever the run ends without error.
    ///
    /// # Errors
    ///
    /// - [`EvolveError::Invariant`] if the checkpoint is inconsistent or an
    ///   invariant breaks during the run.
    ///
    /// Generation, evaluation and checkpoint failures never surface here.
    pub async fn start(
        &self,
        initial_source: &str,
        evaluator: Arc<dyn Evaluator>,
        iteration_budget: u64,
        resume: Option<Checkpoint>,
    ) -> Result<RunOutcome, EvolveError> {
        let mut run = match resume {
            Some(checkpoint) => {
                let restored = match checkpoint.restore(&self.config) {
                    Ok(restored) => restored,
                    Err(e) => {
                        error!(error = %e, "checkpoint rejected");
                        self.publish_aborted();
                        return Err(e.into());
                    }
                };
                info!(iteration = restored.iteration, "resuming from checkpoint");
                RunLoop::resumed(self, restored, initial_source)
            }
            None => {
                let mut run = RunLoop::fresh(self, initial_source);
                if let Err(e) = run.seed(initial_source, evaluator.as_ref()).await {
                    error!(error = %e, "seeding failed");
                    self.publish_aborted();
                    return Err(e);
                }
                run
            }
        };

        run.publish(RunState::Running);
        match run.drive(evaluator, iteration_budget).await {
            Ok(reason) => {
                run.checkpoint().await;
                run.publish(RunState::Stopped(reason));
                info!(
                    iteration = run.iteration,
                    reason = ?reason,
                    best_score = run.best.as_ref().map(|c| c.score()),
                    "run stopped"
                );
                Ok(run.into_outcome(reason))
            }
            Err(e) => {
                error!(iteration = run.iteration, error = %e, "run aborted");
                run.publish(RunState::Stopped(StopReason::Aborted));
                Err(e)
            }
        }
    }

    fn publish_aborted(&self) {
        self.progress_tx.send_modify(|p| p.state = RunState::Stopped(StopReason::Aborted));
    }
}

fn weights_error(field: &str, e: rand::distributions::WeightedError) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: "weights".to_string(),
        reason: e.to_string(),
    }
}

// ============================================================================
// Run loop
// ============================================================================

/// Mutable state of one `start` call. Lives on the controller task only.
struct RunLoop<'a> {
    ctl: &'a EvolutionController,
    islands: IslandSet,
    registry: ProgramRegistry,
    rng: ChaCha8Rng,
    /// Iterations whose results have been processed.
    iteration: u64,
    best: Option<Arc<Candidate>>,
    early: EarlyStopping,
    stats: RunStats,
    fallback_source: Option<String>,
    state: RunState,
}

impl<'a> RunLoop<'a> {
    fn fresh(ctl: &'a EvolutionController, initial_source: &str) -> Self {
        let db = &ctl.config.database;
        Self {
            ctl,
            islands: IslandSet::new(db.num_islands, db.topology, ctl.discretizer.dimensions()),
            registry: ProgramRegistry::new(),
            rng: ChaCha8Rng::seed_from_u64(ctl.config.run.random_seed),
            iteration: 0,
            best: None,
            early: EarlyStopping::default(),
            stats: RunStats::default(),
            fallback_source: Some(initial_source.to_string()),
            state: RunState::Idle,
        }
    }

    fn resumed(ctl: &'a EvolutionController, restored: RestoredRun, initial_source: &str) -> Self {
        if let Some(best) = &restored.best {
            metrics::set_best_score(best.score());
        }
        Self {
            ctl,
            islands: restored.islands,
            registry: restored.registry,
            rng: restored.rng,
            iteration: restored.iteration,
            best: restored.best,
            early: restored.early_stop,
            stats: restored.stats,
            fallback_source: restored
                .fallback_source
                .or_else(|| Some(initial_source.to_string())),
            state: RunState::Idle,
        }
    }

    // ── Seed ────────────────────────────────────────────────────────────

    /// Evaluate the initial program and, if valid, place it on island 0
    /// with a copy on every other island.
    async fn seed(&mut self, source: &str, evaluator: &dyn Evaluator) -> Result<(), EvolveError> {
        let report = run_cascade(evaluator, source, &self.ctl.config.evaluation.stages).await;
        if let Some(reason) = report.failure_reason() {
            warn!(reason = %reason, "initial program is invalid; using it as fallback parent only");
            return Ok(());
        }
        let (metrics, coordinate) = match self.features(report.metrics, source) {
            Ok(v) => v,
            Err(reason) => {
                warn!(reason = %reason, "initial program has unusable metrics; using it as fallback parent only");
                return Ok(());
            }
        };

        let seed = Candidate {
            id: CandidateId::mint(&mut self.rng),
            source: source.to_string(),
            parent_id: None,
            generation: 0,
            island_id: 0,
            metrics,
            coordinate,
            valid: true,
            created_at_ms: unix_now_ms(),
            artifacts: report.artifacts,
        };
        let seed = self.registry.append(seed)?;
        self.islands.insert(Arc::clone(&seed))?;
        for island in 1..self.islands.len() {
            let copy = seed.migrant_copy(CandidateId::mint(&mut self.rng), island);
            let copy = self.registry.append(copy)?;
            self.islands.insert(copy)?;
        }

        self.early
            .observe(0, Some(seed.score()), self.ctl.config.run.convergence_threshold);
        metrics::set_best_score(seed.score());
        metrics::set_occupied_cells(self.islands.occupied_cells());
        info!(candidate_id = %seed.id, score = seed.score(), "initial program seeded");
        self.best = Some(seed);
        Ok(())
    }

    // ── Main loop ───────────────────────────────────────────────────────

    async fn drive(
        &mut self,
        evaluator: Arc<dyn Evaluator>,
        budget: u64,
    ) -> Result<StopReason, EvolveError> {
        let ctl = self.ctl;
        let config = &ctl.config;
        let workers = config.workers.count.max(1);
        let ctx = Arc::new(WorkerContext {
            evaluator,
            stages: config.evaluation.stages.clone(),
            params: GenerationParams::from(&config.generation),
            retry: RetryPolicy::from_config(&config.generation),
            generation_timeout: config.generation.timeout(),
            max_source_len: config.run.max_source_len,
        });

        let (job_tx, job_rx) = mpsc::channel::<Job>(workers);
        let (result_tx, mut result_rx) = mpsc::channel::<JobResult>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&ctx),
                    Arc::clone(&job_rx),
                    result_tx.clone(),
                ))
            })
            .collect();
        drop(result_tx);
        debug!(workers, budget, "worker pool started");

        let result = self.pump(&job_tx, &mut result_rx, workers, budget).await;

        drop(job_tx);
        for handle in &handles {
            handle.abort();
        }
        result
    }

    async fn pump(
        &mut self,
        job_tx: &mpsc::Sender<Job>,
        result_rx: &mut mpsc::Receiver<JobResult>,
        workers: usize,
        budget: u64,
    ) -> Result<StopReason, EvolveError> {
        let grace = self.ctl.config.run.shutdown_grace();
        let mut stop_rx = self.ctl.stop_tx.subscribe();
        let base = self.iteration;
        let mut dispatched = 0u64;
        let mut in_flight = 0usize;
        let mut stopping: Option<(StopReason, tokio::time::Instant)> = None;

        if *stop_rx.borrow_and_update() {
            stopping = Some(self.begin_drain(StopReason::Cancelled, grace, in_flight));
        }

        loop {
            if stopping.is_none() {
                while in_flight < workers && dispatched < budget {
                    dispatched += 1;
                    let job = self.sample_job(base + dispatched);
                    if job_tx.send(job).await.is_err() {
                        warn!("job channel closed; no workers left");
                        return Ok(StopReason::Aborted);
                    }
                    in_flight += 1;
                }
            }
            if in_flight == 0 {
                return Ok(stopping.map_or(StopReason::BudgetExhausted, |(r, _)| r));
            }

            let received = match stopping {
                None => {
                    tokio::select! {
                        biased;
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow_and_update() {
                                info!(in_flight, "stop requested");
                                stopping = Some(self.begin_drain(StopReason::Cancelled, grace, in_flight));
                            }
                            continue;
                        }
                        received = result_rx.recv() => received,
                    }
                }
                Some((reason, deadline)) => {
                    match tokio::time::timeout_at(deadline, result_rx.recv()).await {
                        Ok(received) => received,
                        Err(_) => {
                            warn!(in_flight, "grace period elapsed; dropping in-flight iterations");
                            return Ok(reason);
                        }
                    }
                }
            };

            let Some(result) = received else {
                warn!(in_flight, "result channel closed");
                return Ok(stopping.map_or(StopReason::Aborted, |(r, _)| r));
            };
            in_flight -= 1;

            self.ingest(result)?;
            self.after_iteration().await?;

            if stopping.is_none() && self.early.should_stop(self.ctl.config.run.early_stopping_patience) {
                info!(
                    iteration = self.iteration,
                    last_improvement = self.early.last_improvement(),
                    "early stopping"
                );
                stopping = Some(self.begin_drain(StopReason::EarlyStopped, grace, in_flight));
            }
        }
    }

    fn begin_drain(
        &mut self,
        reason: StopReason,
        grace: std::time::Duration,
        in_flight: usize,
    ) -> (StopReason, tokio::time::Instant) {
        if in_flight > 0 {
            self.publish(RunState::Draining);
        }
        (reason, tokio::time::Instant::now() + grace)
    }

    // ── Sample ──────────────────────────────────────────────────────────

    fn sample_job(&mut self, iteration: u64) -> Job {
        let ctl = self.ctl;
        let db = &ctl.config.database;

        let island = match &ctl.island_weights {
            Some(weights) => weights.sample(&mut self.rng),
            None => ((iteration - 1) % self.islands.len().max(1) as u64) as usize,
        };
        let strategy = ctl.strategies[ctl.strategy_weights.sample(&mut self.rng)];
        let parents = self.islands.sample(island, strategy, db.num_parents, &mut self.rng);
        let top_programs = self.top_programs(&parents, db.num_top_programs);
        let (generator_key, generator) = ctl.ensemble.pick(&mut self.rng);

        let context = FeatureContext {
            island,
            iteration,
            top_programs,
            fallback_source: self.fallback_source.clone(),
        };
        let prompt = ctl
            .providers
            .prompt_builder()
            .build_prompt(&parents, &context, &ctl.config.prompt);

        debug!(
            iteration,
            island,
            strategy = strategy.as_str(),
            parents = parents.len(),
            generator = generator_key,
            "job dispatched"
        );
        Job {
            iteration,
            island,
            prompt,
            parent: parents.first().map(|p| (p.id.clone(), p.generation)),
            generator_key: generator_key.to_string(),
            generator,
        }
    }

    /// Best registered programs for prompt context, skipping the parents
    /// and repeated sources (migrant copies share their original's text).
    fn top_programs(&self, parents: &[Arc<Candidate>], n: usize) -> Vec<Arc<Candidate>> {
        if n == 0 {
            return Vec::new();
        }
        let pool = (n + parents.len()) * self.islands.len().max(1);
        let mut picked: Vec<Arc<Candidate>> = Vec::with_capacity(n);
        for candidate in self.registry.top(pool) {
            if picked.len() == n {
                break;
            }
            let repeated = parents
                .iter()
                .chain(picked.iter())
                .any(|c| c.source == candidate.source);
            if !repeated {
                picked.push(candidate);
            }
        }
        picked
    }

    // ── Ingest ──────────────────────────────────────────────────────────

    /// Apply one job result. Contains no `.await`.
    fn ingest(&mut self, result: JobResult) -> Result<(), InvariantViolation> {
        let JobResult {
            iteration,
            island,
            parent,
            outcome,
        } = result;

        match outcome {
            JobOutcome::Abandoned(e) => {
                self.stats.abandoned += 1;
                *self
                    .stats
                    .failures
                    .entry(format!("generation:{}", e.kind()))
                    .or_default() += 1;
                metrics::record_iteration("abandoned");
                warn!(iteration, island, reason = %e, "iteration abandoned");
            }
            JobOutcome::Evaluated { source, report } => {
                self.stats.evaluated += 1;
                let score = self.admit(iteration, island, parent, source, report)?;
                self.early
                    .observe(iteration, score, self.ctl.config.run.convergence_threshold);
            }
        }
        self.iteration += 1;
        Ok(())
    }

    /// Register and insert a valid child. Returns its score, or `None` if
    /// the child was rejected.
    fn admit(
        &mut self,
        iteration: u64,
        island: usize,
        parent: Option<(CandidateId, u32)>,
        source: String,
        report: CascadeReport,
    ) -> Result<Option<f64>, InvariantViolation> {
        if let Some(reason) = report.failure_reason() {
            if let StageOutcome::RejectedAtStage(stage) = report.outcome {
                *self.stats.rejected_at_stage.entry(stage).or_default() += 1;
            }
            self.reject(iteration, island, &reason);
            return Ok(None);
        }
        let (metrics, coordinate) = match self.features(report.metrics, &source) {
            Ok(v) => v,
            Err(reason) => {
                self.reject(iteration, island, &reason);
                return Ok(None);
            }
        };

        let id = CandidateId::mint(&mut self.rng);
        let island_id = self.islands.assign(Some(island), &id);
        let generation = parent.as_ref().map_or(1, |(_, g)| g.saturating_add(1));
        let candidate = Candidate {
            id,
            source,
            parent_id: parent.map(|(id, _)| id),
            generation,
            island_id,
            metrics,
            coordinate,
            valid: true,
            created_at_ms: unix_now_ms(),
            artifacts: report.artifacts,
        };

        let candidate = self.registry.append(candidate)?;
        let outcome = self.islands.insert(Arc::clone(&candidate))?;

        let score = candidate.score();
        self.stats.valid += 1;
        if outcome.accepted {
            self.stats.accepted_into_grid += 1;
        }
        metrics::record_iteration("valid");
        debug!(
            iteration,
            island = island_id,
            candidate_id = %candidate.id,
            score,
            coordinate = %candidate.coordinate,
            accepted = outcome.accepted,
            "candidate ingested"
        );

        if self.best.as_ref().map_or(true, |b| score > b.score()) {
            info!(iteration, candidate_id = %candidate.id, score, "new best program");
            metrics::set_best_score(score);
            self.best = Some(candidate);
        }
        Ok(Some(score))
    }

    fn reject(&mut self, iteration: u64, island: usize, reason: &str) {
        self.stats.invalid += 1;
        self.stats.record_failure(reason);
        metrics::record_iteration("invalid");
        debug!(iteration, island, reason, "candidate rejected");
    }

    /// Validate raw metrics and compute the feature coordinate.
    fn features(
        &self,
        raw: std::collections::BTreeMap<String, f64>,
        source: &str,
    ) -> Result<(Metrics, crate::candidate::FeatureCoord), String> {
        let metrics = Metrics::validated(raw).map_err(|e| format!("invalid_metrics: {e}"))?;
        let coordinate = self
            .ctl
            .discretizer
            .coordinate(&metrics, source)
            .map_err(|e| e.to_string())?;
        Ok((metrics, coordinate))
    }

    // ── Cadences ────────────────────────────────────────────────────────

    async fn after_iteration(&mut self) -> Result<(), InvariantViolation> {
        let ctl = self.ctl;
        let config = &ctl.config;
        let db = &config.database;

        if self.islands.len() > 1 && self.iteration % db.migration_interval.max(1) == 0 {
            let report = self
                .islands
                .migrate(db.migration_count, &self.registry, &mut self.rng)?;
            self.stats.migrations += 1;
            self.stats.migrants_accepted += report.accepted.len() as u64;
            metrics::record_migration(report.offered, report.accepted.len());
            info!(
                iteration = self.iteration,
                offered = report.offered,
                accepted = report.accepted.len(),
                "migration"
            );
        }
        metrics::set_occupied_cells(self.islands.occupied_cells());

        if self.iteration % config.run.checkpoint_interval.max(1) == 0 {
            self.checkpoint().await;
        }
        self.publish(self.state);
        Ok(())
    }

    /// Write a checkpoint if a directory is configured. Failures are counted
    /// and logged; the previous checkpoint stays on disk.
    async fn checkpoint(&mut self) {
        let Some(manager) = &self.ctl.checkpoints else {
            return;
        };
        let checkpoint = Checkpoint::capture(
            &self.islands,
            &self.registry,
            LoopSnapshot {
                iteration: self.iteration,
                best_candidate_id: self.best.as_ref().map(|c| c.id.clone()),
                rng: &self.rng,
                early_stop: &self.early,
                stats: &self.stats,
                fallback_source: self.fallback_source.as_deref(),
            },
        );
        match manager.save_in_background(checkpoint).await {
            Ok(()) => {
                self.stats.checkpoints_written += 1;
                metrics::record_checkpoint(true);
            }
            Err(e) => {
                self.stats.checkpoints_failed += 1;
                metrics::record_checkpoint(false);
                warn!(iteration = self.iteration, error = %e, "checkpoint failed; continuing");
            }
        }
    }

    // ── Observation ─────────────────────────────────────────────────────

    fn publish(&mut self, state: RunState) {
        self.state = state;
        self.ctl.progress_tx.send_replace(Progress {
            iteration: self.iteration,
            best_score: self.best.as_ref().map(|c| c.score()),
            best_candidate_id: self.best.as_ref().map(|c| c.id.clone()),
            state,
            stats: self.stats.clone(),
        });
    }

    fn into_outcome(self, stop_reason: StopReason) -> RunOutcome {
        RunOutcome {
            best: self.best,
            iteration: self.iteration,
            stop_reason,
            stats: self.stats,
            registry: self.registry,
        }
    }
}
