//! # Evolution run configuration
//!
//! ## Responsibility
//! Define, parse, and validate the TOML configuration of an evolution run:
//! islands and feature dimensions, sampling ratios, worker pool size,
//! generator ensemble, cascade stages, checkpointing and early stopping.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `EvolveConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Defaulted: every field has a documented default, so `[section]` headers
//!   may be omitted entirely
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building collaborators from keys (that belongs to `providers`)
//! - Running the loop (that belongs to `controller`)

pub mod loader;
pub mod validation;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::archive::SampleStrategy;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_interval() -> u64 {
    100
}

fn default_max_source_len() -> usize {
    100_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_num_islands() -> usize {
    5
}

fn default_migration_interval() -> u64 {
    50
}

fn default_migration_count() -> usize {
    2
}

fn default_elite_ratio() -> f64 {
    0.4
}

fn default_diverse_ratio() -> f64 {
    0.4
}

fn default_random_ratio() -> f64 {
    0.2
}

fn default_num_parents() -> usize {
    2
}

fn default_num_top_programs() -> usize {
    3
}

fn default_bins() -> usize {
    10
}

fn default_worker_count() -> usize {
    4
}

fn default_generation_timeout_ms() -> u64 {
    60_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_stage_timeout_ms() -> u64 {
    60_000
}

fn default_score_key() -> String {
    crate::candidate::SCORE_KEY.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_artifact_bytes() -> usize {
    4096
}

fn default_generator_key() -> String {
    "default".to_string()
}

fn default_weight() -> f64 {
    1.0
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one evolution run.
///
/// # Example
///
/// ```toml
/// [run]
/// random_seed = 7
/// checkpoint_dir = "runs/demo"
///
/// [database]
/// num_islands = 3
///
/// [[database.feature_dimensions]]
/// name = "complexity"
/// min = 0.0
/// max = 5000.0
///
/// [[evaluation.stages]]
/// name = "quick"
/// timeout_ms = 5000
/// threshold = 0.5
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvolveConfig {
    /// Loop-level settings: seed, checkpoints, early stopping.
    #[serde(default)]
    pub run: RunConfig,
    /// Population store settings: islands, sampling, feature grid.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Generator ensemble and retry settings.
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Cascade evaluation stages.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Prompt rendering settings.
    #[serde(default)]
    pub prompt: PromptConfig,
}

// ── Run ──────────────────────────────────────────────────────────────────

/// Loop-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RunConfig {
    /// Seed for the controller RNG. Same seed, same sampling decisions.
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Save a checkpoint every this many completed iterations.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Directory for `checkpoint.json` and best-program exports. `None` disables checkpoints.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Stop after this many consecutive evaluated iterations without improvement.
    #[serde(default)]
    pub early_stopping_patience: Option<u64>,
    /// Minimum score gain over the best that counts as an improvement.
    #[serde(default)]
    pub convergence_threshold: f64,
    /// Generated sources longer than this many characters (`char`s, as
    /// counted by the `complexity` fallback) are discarded.
    #[serde(default = "default_max_source_len")]
    pub max_source_len: usize,
    /// Time in-flight workers get to finish after a stop signal.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            random_seed: default_seed(),
            checkpoint_interval: default_checkpoint_interval(),
            checkpoint_dir: None,
            early_stopping_patience: None,
            convergence_threshold: 0.0,
            max_source_len: default_max_source_len(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl RunConfig {
    /// Grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ── Database ─────────────────────────────────────────────────────────────

/// Island topology used for migration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Each island exchanges with its two ring neighbours.
    #[default]
    Ring,
    /// Each island sends to every other island.
    FullyConnected,
    /// No migration.
    Isolated,
}

/// How the controller picks the island to sample from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IslandSelection {
    /// Cycle through islands in order.
    #[default]
    RoundRobin,
    /// Draw by `island_weights`.
    Weighted,
}

/// Scale used to map a raw metric value into bins.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureScale {
    /// Equal-width bins over `[min, max]`.
    #[default]
    Linear,
    /// Equal-width bins over `[ln min, ln max]`.
    Logarithmic,
}

/// One axis of the feature grid.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FeatureDimension {
    /// Metric key read from evaluation results. `complexity` falls back to
    /// the source length when the evaluator does not report it.
    pub name: String,
    /// Number of bins along this axis.
    #[serde(default = "default_bins")]
    pub bins: usize,
    /// Lower bound of the binned range; values below land in bin 0.
    pub min: f64,
    /// Upper bound of the binned range; values above land in the last bin.
    pub max: f64,
    /// Bin spacing.
    #[serde(default)]
    pub scale: FeatureScale,
}

fn default_feature_dimensions() -> Vec<FeatureDimension> {
    vec![
        FeatureDimension {
            name: "complexity".to_string(),
            bins: default_bins(),
            min: 0.0,
            max: 10_000.0,
            scale: FeatureScale::Linear,
        },
        FeatureDimension {
            name: crate::candidate::SCORE_KEY.to_string(),
            bins: default_bins(),
            min: 0.0,
            max: 1.0,
            scale: FeatureScale::Linear,
        },
    ]
}

/// Population store settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DatabaseConfig {
    /// Number of islands. Fixed for the lifetime of a run.
    #[serde(default = "default_num_islands")]
    pub num_islands: usize,
    /// Migration neighbourhood.
    #[serde(default)]
    pub topology: Topology,
    /// Island choice policy for sampling.
    #[serde(default)]
    pub island_selection: IslandSelection,
    /// Per-island weights for `weighted` selection.
    #[serde(default)]
    pub island_weights: Vec<f64>,
    /// Migrate every this many completed iterations.
    #[serde(default = "default_migration_interval")]
    pub migration_interval: u64,
    /// Top occupants per island offered to each neighbour.
    #[serde(default = "default_migration_count")]
    pub migration_count: usize,
    /// Share of iterations sampling with the `elite` strategy.
    #[serde(default = "default_elite_ratio")]
    pub elite_ratio: f64,
    /// Share of iterations sampling with the `diverse` strategy.
    #[serde(default = "default_diverse_ratio")]
    pub diverse_ratio: f64,
    /// Share of iterations sampling with the `random` strategy.
    #[serde(default = "default_random_ratio")]
    pub random_ratio: f64,
    /// Parents drawn per iteration; the first is the one being mutated.
    #[serde(default = "default_num_parents")]
    pub num_parents: usize,
    /// Global top programs included in the prompt context.
    #[serde(default = "default_num_top_programs")]
    pub num_top_programs: usize,
    /// Axes of the feature grid.
    #[serde(default = "default_feature_dimensions")]
    pub feature_dimensions: Vec<FeatureDimension>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            num_islands: default_num_islands(),
            topology: Topology::default(),
            island_selection: IslandSelection::default(),
            island_weights: Vec::new(),
            migration_interval: default_migration_interval(),
            migration_count: default_migration_count(),
            elite_ratio: default_elite_ratio(),
            diverse_ratio: default_diverse_ratio(),
            random_ratio: default_random_ratio(),
            num_parents: default_num_parents(),
            num_top_programs: default_num_top_programs(),
            feature_dimensions: default_feature_dimensions(),
        }
    }
}

impl DatabaseConfig {
    /// Strategy ratios in `(strategy, weight)` form.
    pub fn strategy_weights(&self) -> [(SampleStrategy, f64); 3] {
        [
            (SampleStrategy::Elite, self.elite_ratio),
            (SampleStrategy::Diverse, self.diverse_ratio),
            (SampleStrategy::Random, self.random_ratio),
        ]
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkersConfig {
    /// Concurrent generate→evaluate workers.
    #[serde(default = "default_worker_count")]
    pub count: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
        }
    }
}

// ── Generation ───────────────────────────────────────────────────────────

/// A generator key and its share of iterations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GeneratorWeight {
    /// Key registered in [`Providers`](crate::providers::Providers).
    #[serde(default = "default_generator_key")]
    pub key: String,
    /// Relative sampling weight.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_generators() -> Vec<GeneratorWeight> {
    vec![GeneratorWeight {
        key: default_generator_key(),
        weight: default_weight(),
    }]
}

/// Generator ensemble, timeout and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GenerationConfig {
    /// Weighted ensemble of generator keys.
    #[serde(default = "default_generators")]
    pub generators: Vec<GeneratorWeight>,
    /// Per-call timeout.
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per iteration before the iteration is abandoned.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Initial backoff delay, doubled on each retry.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Sampling temperature forwarded to the generator.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Token limit forwarded to the generator.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            generators: default_generators(),
            timeout_ms: default_generation_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl GenerationConfig {
    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Evaluation ───────────────────────────────────────────────────────────

/// One stage of the evaluation cascade.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StageConfig {
    /// Stage label used in logs and passed to the evaluator.
    pub name: String,
    /// Per-call timeout for this stage.
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    /// Minimum value of `threshold_metric` to continue. `None` always passes.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Metric compared against `threshold`.
    #[serde(default = "default_score_key")]
    pub threshold_metric: String,
    /// Free-form parameters forwarded to the evaluator.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StageConfig {
    /// Build a stage with defaults for everything except name and threshold.
    pub fn new(name: impl Into<String>, threshold: Option<f64>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: default_stage_timeout_ms(),
            threshold,
            threshold_metric: default_score_key(),
            params: BTreeMap::new(),
        }
    }

    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_stages() -> Vec<StageConfig> {
    vec![StageConfig::new("full", None)]
}

/// Ordered cascade stages.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvaluationConfig {
    /// Stages in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
        }
    }
}

// ── Prompt ───────────────────────────────────────────────────────────────

/// Prompt rendering settings consumed by the prompt builder.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PromptConfig {
    /// Leading instruction block.
    #[serde(default = "crate::prompt::default_system_message")]
    pub system_message: String,
    /// Body template with `{placeholder}` slots.
    #[serde(default = "crate::prompt::default_template")]
    pub template: String,
    /// Whether evaluation artifacts of the parent are shown.
    #[serde(default = "default_true")]
    pub include_artifacts: bool,
    /// Per-artifact byte cap when rendering.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_message: crate::prompt::default_system_message(),
            template: crate::prompt::default_template(),
            include_artifacts: true,
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

/// Export the JSON Schema for `EvolveConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EvolveConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvolveConfig::default();
        assert!(validation::validate(&config).is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: EvolveConfig = toml::from_str("").expect("test: empty toml");
        assert_eq!(config, EvolveConfig::default());
    }

    #[test]
    fn test_topology_deserializes_from_snake_case() {
        let t: Topology = serde_json::from_str("\"fully_connected\"").expect("test: topology");
        assert_eq!(t, Topology::FullyConnected);
    }

    #[test]
    fn test_feature_scale_defaults_to_linear() {
        let dim: FeatureDimension =
            toml::from_str("name = \"x\"\nmin = 0.0\nmax = 1.0").expect("test: dim");
        assert_eq!(dim.scale, FeatureScale::Linear);
        assert_eq!(dim.bins, 10);
    }

    #[test]
    fn test_stage_threshold_metric_defaults_to_score() {
        let stage: StageConfig = toml::from_str("name = \"quick\"").expect("test: stage");
        assert_eq!(stage.threshold_metric, "score");
        assert!(stage.threshold.is_none());
        assert_eq!(stage.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_full_toml_parses() {
        let toml_str = r#"
[run]
random_seed = 7
checkpoint_interval = 10
checkpoint_dir = "runs/demo"
early_stopping_patience = 25

[database]
num_islands = 3
topology = "fully_connected"
island_selection = "weighted"
island_weights = [1.0, 2.0, 1.0]

[[database.feature_dimensions]]
name = "complexity"
min = 1.0
max = 5000.0
scale = "logarithmic"

[workers]
count = 8

[[generation.generators]]
key = "fast"
weight = 0.8

[[generation.generators]]
key = "strong"
weight = 0.2

[[evaluation.stages]]
name = "quick"
timeout_ms = 5000
threshold = 0.5

[[evaluation.stages]]
name = "full"
timeout_ms = 60000
params = { dataset = "large" }
"#;
        let config: EvolveConfig = toml::from_str(toml_str).expect("test: full toml");
        assert_eq!(config.database.num_islands, 3);
        assert_eq!(config.database.feature_dimensions.len(), 1);
        assert_eq!(
            config.database.feature_dimensions[0].scale,
            FeatureScale::Logarithmic
        );
        assert_eq!(config.generation.generators.len(), 2);
        assert_eq!(config.evaluation.stages[1].params["dataset"], "large");
        assert_eq!(config.workers.count, 8);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
