//! Feature discretization.
//!
//! Maps raw metric values onto grid bins, one axis per configured
//! [`FeatureDimension`]. Every function here is pure.

use thiserror::Error;

use crate::candidate::{FeatureCoord, Metrics};
use crate::config::{FeatureDimension, FeatureScale};

/// Metric key that falls back to the source length when not reported.
pub const COMPLEXITY_KEY: &str = "complexity";

/// A feature value could not be obtained for a candidate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeatureError {
    /// The evaluator did not report the metric and no built-in applies.
    #[error("missing_feature:{0}")]
    Missing(String),

    /// The reported value is NaN or infinite.
    #[error("non_finite_feature:{0}")]
    NonFinite(String),
}

/// Map `value` to a bin in `0..dim.bins`.
///
/// Values below `min` clamp to bin 0, values at or above `max` clamp to the
/// last bin. For logarithmic scale, non-positive values land in bin 0.
/// The mapping is monotone non-decreasing in `value`.
///
/// # Panics
///
/// This function never panics.
pub fn bin_index(dim: &FeatureDimension, value: f64) -> usize {
    let bins = dim.bins.max(1);
    let (lo, hi, v) = match dim.scale {
        FeatureScale::Linear => (dim.min, dim.max, value),
        FeatureScale::Logarithmic => {
            if value <= 0.0 {
                return 0;
            }
            (dim.min.ln(), dim.max.ln(), value.ln())
        }
    };
    let span = hi - lo;
    if span.is_nan() || span <= 0.0 || v <= lo {
        return 0;
    }
    let t = (v - lo) / span;
    let idx = (t * bins as f64).floor();
    if idx >= bins as f64 {
        bins - 1
    } else {
        idx as usize
    }
}

/// Discretizes candidates into coordinates for a fixed set of dimensions.
#[derive(Debug, Clone)]
pub struct Discretizer {
    dims: Vec<FeatureDimension>,
}

impl Discretizer {
    /// Build a discretizer over `dims`, in order.
    pub fn new(dims: Vec<FeatureDimension>) -> Self {
        Self { dims }
    }

    /// Number of coordinate components produced.
    pub fn dimensions(&self) -> usize {
        self.dims.len()
    }

    /// Configured dimensions, in coordinate order.
    pub fn dims(&self) -> &[FeatureDimension] {
        &self.dims
    }

    /// Raw value of one dimension for the given metrics and source.
    ///
    /// # Errors
    ///
    /// - [`FeatureError::Missing`] if the metric is absent and has no built-in.
    /// - [`FeatureError::NonFinite`] if the value is NaN or infinite.
    pub fn raw_value(
        &self,
        dim: &FeatureDimension,
        metrics: &Metrics,
        source: &str,
    ) -> Result<f64, FeatureError> {
        let value = match metrics.get(&dim.name) {
            Some(v) => v,
            None if dim.name == COMPLEXITY_KEY => source.chars().count() as f64,
            None => return Err(FeatureError::Missing(dim.name.clone())),
        };
        if !value.is_finite() {
            return Err(FeatureError::NonFinite(dim.name.clone()));
        }
        Ok(value)
    }

    /// Compute the full feature coordinate.
    ///
    /// # Errors
    ///
    /// Propagates the first [`FeatureError`] in dimension order.
    pub fn coordinate(&self, metrics: &Metrics, source: &str) -> Result<FeatureCoord, FeatureError> {
        let bins = self
            .dims
            .iter()
            .map(|dim| self.raw_value(dim, metrics, source).map(|v| bin_index(dim, v)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureCoord::new(bins))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dim(name: &str, bins: usize, min: f64, max: f64, scale: FeatureScale) -> FeatureDimension {
        FeatureDimension {
            name: name.to_string(),
            bins,
            min,
            max,
            scale,
        }
    }

    #[test]
    fn test_linear_bins_cover_range() {
        let d = dim("x", 10, 0.0, 1.0, FeatureScale::Linear);
        assert_eq!(bin_index(&d, 0.0), 0);
        assert_eq!(bin_index(&d, 0.05), 0);
        assert_eq!(bin_index(&d, 0.15), 1);
        assert_eq!(bin_index(&d, 0.99), 9);
        assert_eq!(bin_index(&d, 1.0), 9);
    }

    #[test]
    fn test_out_of_range_values_clamp() {
        let d = dim("x", 4, 10.0, 20.0, FeatureScale::Linear);
        assert_eq!(bin_index(&d, -100.0), 0);
        assert_eq!(bin_index(&d, 1e9), 3);
    }

    #[test]
    fn test_logarithmic_bins() {
        let d = dim("x", 3, 1.0, 1000.0, FeatureScale::Logarithmic);
        assert_eq!(bin_index(&d, 5.0), 0);
        assert_eq!(bin_index(&d, 50.0), 1);
        assert_eq!(bin_index(&d, 500.0), 2);
        assert_eq!(bin_index(&d, 0.0), 0);
        assert_eq!(bin_index(&d, -3.0), 0);
    }

    #[test]
    fn test_bin_index_is_monotone() {
        for scale in [FeatureScale::Linear, FeatureScale::Logarithmic] {
            let d = dim("x", 7, 0.5, 900.0, scale);
            let mut last = 0;
            let mut v = -10.0;
            while v < 2000.0 {
                let b = bin_index(&d, v);
                assert!(b >= last, "{scale:?}: bin dropped at {v}");
                assert!(b < 7);
                last = b;
                v += 3.7;
            }
        }
    }

    #[test]
    fn test_coordinate_uses_metrics_in_order() {
        let disc = Discretizer::new(vec![
            dim("score", 10, 0.0, 1.0, FeatureScale::Linear),
            dim("speed", 2, 0.0, 10.0, FeatureScale::Linear),
        ]);
        let metrics = Metrics::validated(BTreeMap::from([
            ("score".to_string(), 0.35),
            ("speed".to_string(), 7.0),
        ]))
        .unwrap();
        let coord = disc.coordinate(&metrics, "src").unwrap();
        assert_eq!(coord.bins(), &[3, 1]);
    }

    #[test]
    fn test_complexity_falls_back_to_source_length() {
        let disc = Discretizer::new(vec![dim(COMPLEXITY_KEY, 10, 0.0, 100.0, FeatureScale::Linear)]);
        let metrics = Metrics::from_score(0.1).unwrap();
        let coord = disc.coordinate(&metrics, &"x".repeat(55)).unwrap();
        assert_eq!(coord.bins(), &[5]);
    }

    #[test]
    fn test_missing_feature_is_reported() {
        let disc = Discretizer::new(vec![dim("memory", 10, 0.0, 1.0, FeatureScale::Linear)]);
        let metrics = Metrics::from_score(0.1).unwrap();
        let err = disc.coordinate(&metrics, "src").unwrap_err();
        assert_eq!(err, FeatureError::Missing("memory".to_string()));
        assert_eq!(err.to_string(), "missing_feature:memory");
    }
}
