//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EvolveConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::{EvolveConfig, FeatureScale, IslandSelection};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "database.num_islands").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// A configured provider key has no registered implementation.
    #[error("no {kind} registered under key '{key}'")]
    UnknownProvider {
        /// "generator" or "evaluator".
        kind: &'static str,
        /// The unresolved key.
        key: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`EvolveConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EvolveConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Run ──────────────────────────────────────────────────────────
    if config.run.checkpoint_interval == 0 {
        errors.push(invalid("run.checkpoint_interval", 0, "must be at least 1"));
    }
    if config.run.early_stopping_patience == Some(0) {
        errors.push(invalid("run.early_stopping_patience", 0, "must be at least 1 when set"));
    }
    if !config.run.convergence_threshold.is_finite() || config.run.convergence_threshold < 0.0 {
        errors.push(invalid(
            "run.convergence_threshold",
            config.run.convergence_threshold,
            "must be a finite value \u{2265} 0",
        ));
    }
    if config.run.max_source_len == 0 {
        errors.push(invalid("run.max_source_len", 0, "must be at least 1"));
    }

    // ── Islands ──────────────────────────────────────────────────────
    let db = &config.database;
    if db.num_islands == 0 {
        errors.push(invalid("database.num_islands", 0, "must be at least 1"));
    }
    if db.migration_interval == 0 {
        errors.push(invalid("database.migration_interval", 0, "must be at least 1"));
    }
    if db.island_selection == IslandSelection::Weighted {
        if db.island_weights.len() != db.num_islands {
            errors.push(invalid(
                "database.island_weights",
                db.island_weights.len(),
                "weighted selection needs exactly one weight per island",
            ));
        }
        if db.island_weights.iter().any(|w| !w.is_finite() || *w < 0.0)
            || db.island_weights.iter().sum::<f64>() <= 0.0
        {
            errors.push(invalid(
                "database.island_weights",
                format!("{:?}", db.island_weights),
                "weights must be non-negative with a positive sum",
            ));
        }
    }

    // ── Sampling ─────────────────────────────────────────────────────
    for (field, ratio) in [
        ("database.elite_ratio", db.elite_ratio),
        ("database.diverse_ratio", db.diverse_ratio),
        ("database.random_ratio", db.random_ratio),
    ] {
        if !(0.0..=1.0).contains(&ratio) {
            errors.push(invalid(field, ratio, "must be between 0.0 and 1.0"));
        }
    }
    if db.elite_ratio + db.diverse_ratio + db.random_ratio <= 0.0 {
        errors.push(invalid(
            "database.elite_ratio",
            db.elite_ratio,
            "sampling ratios must sum to more than 0",
        ));
    }
    if db.num_parents == 0 {
        errors.push(invalid("database.num_parents", 0, "must be at least 1"));
    }

    // ── Feature dimensions ───────────────────────────────────────────
    if db.feature_dimensions.is_empty() {
        errors.push(invalid(
            "database.feature_dimensions",
            "[]",
            "at least one feature dimension is required",
        ));
    }
    let mut seen = HashSet::new();
    for (i, dim) in db.feature_dimensions.iter().enumerate() {
        let path = format!("database.feature_dimensions[{i}]");
        if dim.name.trim().is_empty() {
            errors.push(invalid(format!("{path}.name"), "", "name must not be empty"));
        } else if !seen.insert(dim.name.as_str()) {
            errors.push(invalid(format!("{path}.name"), &dim.name, "duplicate dimension name"));
        }
        if dim.bins == 0 {
            errors.push(invalid(format!("{path}.bins"), 0, "must be at least 1"));
        }
        if !dim.min.is_finite() || !dim.max.is_finite() || dim.min >= dim.max {
            errors.push(invalid(
                format!("{path}.min"),
                dim.min,
                "min and max must be finite with min < max",
            ));
        }
        if dim.scale == FeatureScale::Logarithmic && dim.min <= 0.0 {
            errors.push(invalid(
                format!("{path}.min"),
                dim.min,
                "logarithmic scale needs min > 0",
            ));
        }
    }

    // ── Workers ──────────────────────────────────────────────────────
    if config.workers.count == 0 {
        errors.push(invalid("workers.count", 0, "must be at least 1"));
    }

    // ── Generation ───────────────────────────────────────────────────
    let gen = &config.generation;
    if gen.generators.is_empty() {
        errors.push(invalid("generation.generators", "[]", "at least one generator is required"));
    }
    for (i, g) in gen.generators.iter().enumerate() {
        if g.key.trim().is_empty() {
            errors.push(invalid(format!("generation.generators[{i}].key"), "", "key must not be empty"));
        }
        if !g.weight.is_finite() || g.weight <= 0.0 {
            errors.push(invalid(
                format!("generation.generators[{i}].weight"),
                g.weight,
                "weight must be positive",
            ));
        }
    }
    if gen.retry_attempts == 0 {
        errors.push(invalid("generation.retry_attempts", 0, "must be at least 1"));
    }
    if gen.retry_base_ms > gen.retry_max_ms {
        errors.push(invalid(
            "generation.retry_base_ms",
            gen.retry_base_ms,
            "must be \u{2264} retry_max_ms",
        ));
    }
    if gen.timeout_ms == 0 {
        errors.push(invalid("generation.timeout_ms", 0, "must be at least 1ms"));
    }
    if !(0.0..=2.0).contains(&gen.temperature) {
        errors.push(invalid(
            "generation.temperature",
            gen.temperature,
            "must be between 0.0 and 2.0",
        ));
    }

    // ── Evaluation ───────────────────────────────────────────────────
    if config.evaluation.stages.is_empty() {
        errors.push(invalid("evaluation.stages", "[]", "at least one cascade stage is required"));
    }
    for (i, stage) in config.evaluation.stages.iter().enumerate() {
        if stage.timeout_ms == 0 {
            errors.push(invalid(format!("evaluation.stages[{i}].timeout_ms"), 0, "must be at least 1ms"));
        }
        if let Some(t) = stage.threshold {
            if !t.is_finite() {
                errors.push(invalid(format!("evaluation.stages[{i}].threshold"), t, "must be finite"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
