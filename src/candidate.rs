//! # Candidate data model
//!
//! ## Responsibility
//! Define the immutable record of a generated program: identity, source text,
//! lineage, island ownership, validated metrics, and feature coordinate.
//!
//! ## Guarantees
//! - Immutable: a [`Candidate`] is built once at ingestion time and shared as
//!   `Arc<Candidate>` afterwards; no method mutates it
//! - Validated: [`Metrics`] always carries a finite `score`
//! - Serializable: every type round-trips through serde for checkpoints
//!
//! ## NOT Responsible For
//! - Deciding where a candidate lives (see: `archive`)
//! - Persisting candidates (see: `registry`, `checkpoint`)

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the mandatory metric every evaluation must report.
pub const SCORE_KEY: &str = "score";

/// Return the current Unix timestamp in milliseconds, or 0 if the clock is unavailable.
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(std::time::Duration::ZERO)
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Globally unique candidate identifier.
///
/// Ids are minted from the controller RNG, so a seeded run produces the same
/// ids on every execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh UUID-formatted id from the given RNG.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn mint<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Reasons a metrics mapping is rejected at ingestion.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricsError {
    /// The mandatory `score` key is absent.
    #[error("metrics missing mandatory key \"score\"")]
    MissingScore,

    /// A metric value is NaN or infinite.
    #[error("metric {name} is not finite: {value}")]
    NonFinite {
        /// Metric name.
        name: String,
        /// Offending value.
        value: f64,
    },
}

/// Metric name to value mapping with a mandatory, finite `score`.
///
/// Domain-specific keys are carried alongside `score` unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct Metrics {
    values: BTreeMap<String, f64>,
    score: f64,
}

impl Metrics {
    /// Validate a raw metrics mapping.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::MissingScore`] if `score` is absent.
    /// - [`MetricsError::NonFinite`] if any value is NaN or infinite.
    pub fn validated(values: BTreeMap<String, f64>) -> Result<Self, MetricsError> {
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(MetricsError::NonFinite {
                name: name.clone(),
                value: *value,
            });
        }
        let score = *values.get(SCORE_KEY).ok_or(MetricsError::MissingScore)?;
        Ok(Self { values, score })
    }

    /// Build metrics holding only a score. Convenient for tests and seeds.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NonFinite`] if `score` is NaN or infinite.
    pub fn from_score(score: f64) -> Result<Self, MetricsError> {
        Self::validated(BTreeMap::from([(SCORE_KEY.to_string(), score)]))
    }

    /// The mandatory fitness value.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Look up any metric by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Iterate over all metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Borrow the underlying mapping.
    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

impl TryFrom<BTreeMap<String, f64>> for Metrics {
    type Error = MetricsError;

    fn try_from(values: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        Self::validated(values)
    }
}

impl From<Metrics> for BTreeMap<String, f64> {
    fn from(metrics: Metrics) -> Self {
        metrics.values
    }
}

// ---------------------------------------------------------------------------
// Feature coordinate
// ---------------------------------------------------------------------------

/// Ordered tuple of bin indices, one per configured feature dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureCoord(Vec<usize>);

impl FeatureCoord {
    /// Build a coordinate from bin indices.
    pub fn new(bins: Vec<usize>) -> Self {
        Self(bins)
    }

    /// Bin indices in dimension order.
    pub fn bins(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the coordinate has no dimensions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Manhattan distance to another coordinate. Extra dimensions count fully.
    pub fn manhattan(&self, other: &FeatureCoord) -> usize {
        let shared: usize = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.abs_diff(*b))
            .sum();
        let extra: usize = if self.0.len() > other.0.len() {
            self.0[other.0.len()..].iter().sum()
        } else {
            other.0[self.0.len()..].iter().sum()
        };
        shared + extra
    }
}

impl fmt::Display for FeatureCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{b}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for FeatureCoord {
    fn from(bins: Vec<usize>) -> Self {
        Self(bins)
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A generated program together with everything learned about it.
///
/// Only valid candidates are ever materialized as `Candidate`; failed
/// evaluations are recorded in run statistics instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Globally unique id.
    pub id: CandidateId,
    /// Program source text.
    pub source: String,
    /// Parent id, `None` for seed candidates.
    pub parent_id: Option<CandidateId>,
    /// Number of generative steps from the seed.
    pub generation: u32,
    /// Island that owns this candidate.
    pub island_id: usize,
    /// Metrics from the last executed cascade stage.
    pub metrics: Metrics,
    /// Discretized position in the feature grid.
    pub coordinate: FeatureCoord,
    /// Always `true` for registered candidates.
    pub valid: bool,
    /// Unix milliseconds at creation.
    pub created_at_ms: u64,
    /// Named byte payloads captured during evaluation (e.g. `stderr`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl Candidate {
    /// Shorthand for `self.metrics.score()`.
    pub fn score(&self) -> f64 {
        self.metrics.score()
    }

    /// Derive a migrant copy for `island_id` with a fresh id.
    ///
    /// The copy keeps source, metrics, coordinate and artifacts, and points
    /// back at `self` through `parent_id`.
    pub fn migrant_copy(&self, id: CandidateId, island_id: usize) -> Candidate {
        Candidate {
            id,
            source: self.source.clone(),
            parent_id: Some(self.id.clone()),
            generation: self.generation,
            island_id,
            metrics: self.metrics.clone(),
            coordinate: self.coordinate.clone(),
            valid: self.valid,
            created_at_ms: unix_now_ms(),
            artifacts: self.artifacts.clone(),
        }
    }
}
