//! Prometheus metrics for the evolution loop.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_iteration`, `record_stage_latency`, …) are no-ops if
//! `init_metrics` was never called, so the controller is always safe to run
//! and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `evolve_iterations_total` | Counter | `outcome` |
//! | `evolve_stage_duration_seconds` | Histogram | `stage` |
//! | `evolve_generation_retries_total` | Counter | `reason` |
//! | `evolve_migrants_total` | Counter | `outcome` |
//! | `evolve_checkpoints_total` | Counter | `outcome` |
//! | `evolve_best_score` | Gauge | |
//! | `evolve_occupied_cells` | IntGauge | |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the controller, stored in a single [`OnceLock`].
pub struct EvolveMetrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Processed iterations by outcome (`valid`, `invalid`, `abandoned`).
    pub iterations_total: CounterVec,
    /// Cascade stage latency.
    pub stage_duration: HistogramVec,
    /// Generator retries by failure kind.
    pub generation_retries: CounterVec,
    /// Migrant copies by outcome (`offered`, `accepted`).
    pub migrants_total: CounterVec,
    /// Checkpoint attempts by outcome (`ok`, `failed`).
    pub checkpoints_total: CounterVec,
    /// Best score seen so far.
    pub best_score: Gauge,
    /// Occupied cells across all islands.
    pub occupied_cells: IntGauge,
}

static METRICS: OnceLock<EvolveMetrics> = OnceLock::new();

impl EvolveMetrics {
    /// Build a bundle with every metric registered under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns a [`prometheus::Error`] if a descriptor is invalid or duplicated.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let iterations_total = CounterVec::new(
            Opts::new(format!("{prefix}_iterations_total"), "Processed iterations"),
            &["outcome"],
        )?;
        registry.register(Box::new(iterations_total.clone()))?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}_stage_duration_seconds"),
                "Evaluation duration per cascade stage",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(stage_duration.clone()))?;

        let generation_retries = CounterVec::new(
            Opts::new(format!("{prefix}_generation_retries_total"), "Generator retries"),
            &["reason"],
        )?;
        registry.register(Box::new(generation_retries.clone()))?;

        let migrants_total = CounterVec::new(
            Opts::new(format!("{prefix}_migrants_total"), "Migrant copies"),
            &["outcome"],
        )?;
        registry.register(Box::new(migrants_total.clone()))?;

        let checkpoints_total = CounterVec::new(
            Opts::new(format!("{prefix}_checkpoints_total"), "Checkpoint attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(checkpoints_total.clone()))?;

        let best_score = Gauge::new(format!("{prefix}_best_score"), "Best score so far")?;
        registry.register(Box::new(best_score.clone()))?;

        let occupied_cells =
            IntGauge::new(format!("{prefix}_occupied_cells"), "Occupied grid cells")?;
        registry.register(Box::new(occupied_cells.clone()))?;

        Ok(Self {
            registry,
            iterations_total,
            stage_duration,
            generation_retries,
            migrants_total,
            checkpoints_total,
            best_score,
            occupied_cells,
        })
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise the global metrics bundle.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns a [`prometheus::Error`] if metric construction or registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = EvolveMetrics::new("evolve")?;
    // A racing initialiser builds identical descriptors; either one may win.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static EvolveMetrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one processed iteration. `outcome` is `valid`, `invalid` or `abandoned`.
pub fn record_iteration(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.iterations_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Record the latency of one cascade stage.
///
/// # Panics
///
/// This function never panics.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count one generator retry.
pub fn record_generation_retry(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.generation_retries.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Record the result of one migration round.
pub fn record_migration(offered: usize, accepted: usize) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.migrants_total.get_metric_with_label_values(&["offered"]) {
            c.inc_by(offered as f64);
        }
        if let Ok(c) = m.migrants_total.get_metric_with_label_values(&["accepted"]) {
            c.inc_by(accepted as f64);
        }
    }
}

/// Count one checkpoint attempt.
pub fn record_checkpoint(ok: bool) {
    if let Some(m) = metrics() {
        let outcome = if ok { "ok" } else { "failed" };
        if let Ok(c) = m.checkpoints_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Publish the best score.
pub fn set_best_score(score: f64) {
    if let Some(m) = metrics() {
        m.best_score.set(score);
    }
}

/// Publish the number of occupied cells.
pub fn set_occupied_cells(cells: usize) {
    if let Some(m) = metrics() {
        m.occupied_cells.set(i64::try_from(cells).unwrap_or(i64::MAX));
    }
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
