//! Utility modules
//!
//! Shared functionality used across the pipeline:
//! - Normalization: covariate scaling, trait log + z-score
//! - Imputation: trait gap-filling adapter
//! - Stats: mean, sample sd, OLS slope over optional values

pub mod imputation;
pub mod normalization;
pub mod stats;

// Re-export commonly used types
pub use imputation::{MeanImputer, TraitImputer};
pub use normalization::{CovariateScaling, TraitStandardization};
