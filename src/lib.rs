//! Detection-corrected functional diversity
//!
//! Fits a single-season occupancy model per plant species from two-visit
//! presence/absence surveys, replaces observed occurrence with the
//! posterior-mode true occurrence, and measures how that correction shifts
//! community trait means, functional richness and functional packing along
//! an elevational gradient.
//!
//! Layout:
//! - `data`: survey, covariate and trait containers, CSV loading
//! - `utils/`: covariate scaling, trait standardization, imputation, stats
//! - `occupancy/`: likelihood, L-BFGS optimizer, per-species estimator
//! - `batch`: parallel fits, `P`/`Z` assembly, usable subset
//! - `metrics/`: trait means, FRic, mnnd, richness, relevance
//! - `null_model`: richness-preserving randomization and standardization
//! - `pipeline`: end-to-end orchestration and comparison report

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod errors;
pub mod metrics;
pub mod null_model;
pub mod occupancy;
pub mod pipeline;
pub mod utils;

// Re-export commonly used types
pub use batch::{BatchOutput, BatchRunner, CorrectedMetaCommunity, UnitOutcome};
pub use config::{PipelineConfig, PiMode};
pub use data::{PlotCovariates, RawTraitTable, SurveyArray, SurveyData, TraitTable};
pub use errors::{ConvergenceFailure, GeometryError, PipelineError, PipelineResult};
pub use metrics::{compute_community_metrics, CommunityMetricSet};
pub use null_model::{NullModelCorrector, StandardizedMetrics};
pub use occupancy::{DetectionCorrectedResult, OccupancyEstimator, OccupancyFit, SpeciesUnit};
pub use pipeline::{compare_metrics, run_pipeline, MetricComparison, PipelineReport};
pub use utils::{CovariateScaling, MeanImputer, TraitImputer, TraitStandardization};
