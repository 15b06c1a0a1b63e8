//! Scripted collaborators shared by the controller integration tests.
//!
//! The generator emits `v1`, `v2`, … in call order; the evaluator parses the
//! number back out and scores it with a caller-supplied function. Anything
//! that does not parse (the seed) is program number 0.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tokio_evolve_orchestrator::config::{FeatureDimension, FeatureScale, GeneratorWeight, StageConfig};
use tokio_evolve_orchestrator::generator::GenerationParams;
use tokio_evolve_orchestrator::{
    EvaluationError, EvaluationOutput, Evaluator, EvolutionController, EvolveConfig,
    GenerationError, Generator, Providers,
};

pub const GENERATOR_KEY: &str = "scripted";

/// Numbered program generator with an optional per-call delay.
pub struct Numbered {
    calls: AtomicU64,
    delay: Duration,
}

impl Numbered {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for Numbered {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("v{n}"))
    }
}

/// Program number of a generated source.
pub fn program_number(source: &str) -> u64 {
    source
        .strip_prefix('v')
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

type ScoreFn = dyn Fn(u64) -> f64 + Send + Sync;

/// Scores programs with `score(n)`; programs in `hang` never return.
pub struct Scripted {
    score: Box<ScoreFn>,
    hang: HashSet<u64>,
    calls: Mutex<Vec<(u64, usize)>>,
}

impl Scripted {
    pub fn new(score: impl Fn(u64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            score: Box::new(score),
            hang: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging_on(mut self, programs: &[u64]) -> Self {
        self.hang.extend(programs.iter().copied());
        self
    }

    /// `(program, stage)` pairs in call order.
    pub fn calls(&self) -> Vec<(u64, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evaluator for Scripted {
    async fn evaluate(
        &self,
        source: &str,
        stage: usize,
        _config: &StageConfig,
        _timeout: Duration,
    ) -> Result<EvaluationOutput, EvaluationError> {
        let n = program_number(source);
        self.calls.lock().unwrap().push((n, stage));
        if self.hang.contains(&n) {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        Ok(EvaluationOutput::valid(BTreeMap::from([
            ("score".to_string(), (self.score)(n)),
            ("complexity".to_string(), n as f64),
        ])))
    }
}

/// Small deterministic configuration: one `complexity` dimension with
/// 10 bins over `0..100`, one stage, `workers` workers.
pub fn config(islands: usize, workers: usize) -> EvolveConfig {
    let mut config = EvolveConfig::default();
    config.run.random_seed = 7;
    config.run.shutdown_grace_ms = 2_000;
    config.database.num_islands = islands;
    config.database.migration_interval = 4;
    config.database.migration_count = 1;
    config.database.feature_dimensions = vec![FeatureDimension {
        name: "complexity".to_string(),
        bins: 10,
        min: 0.0,
        max: 100.0,
        scale: FeatureScale::Linear,
    }];
    config.workers.count = workers;
    config.generation.generators = vec![GeneratorWeight {
        key: GENERATOR_KEY.to_string(),
        weight: 1.0,
    }];
    config.generation.retry_base_ms = 1;
    config.generation.retry_max_ms = 1;
    let mut stage = StageConfig::new("full", None);
    stage.timeout_ms = 5_000;
    config.evaluation.stages = vec![stage];
    config
}

pub fn controller(config: EvolveConfig, generator: Arc<Numbered>) -> EvolutionController {
    let providers = Providers::builder().generator(GENERATOR_KEY, generator).build();
    EvolutionController::new(config, providers).unwrap()
}
