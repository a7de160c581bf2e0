//! Relevance of an observed-vs-corrected difference
//!
//! Threshold = `span × |slope|`, with `slope` the OLS slope of the
//! corrected metric on elevation: the change the gradient itself would
//! produce over `span` metres. A plot's difference is relevant when it
//! exceeds that.

use crate::utils::stats::ols_slope;

/// Threshold for one metric; `None` when the slope cannot be estimated.
pub fn relevance_threshold(elevation: &[f64], corrected: &[Option<f64>], span: f64) -> Option<f64> {
    ols_slope(elevation, corrected).map(|slope| span * slope.abs())
}

/// Relevant iff both values and the threshold are defined and
/// `|observed − corrected| > threshold`.
pub fn is_relevant(observed: Option<f64>, corrected: Option<f64>, threshold: Option<f64>) -> bool {
    match (observed, corrected, threshold) {
        (Some(o), Some(c), Some(t)) => (o - c).abs() > t,
        _ => false,
    }
}
