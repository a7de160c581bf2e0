//! Single-season occupancy model
//!
//! - `likelihood`: design rows, marginal likelihood, analytic gradient
//! - `optimizer`: L-BFGS via `argmin`
//! - `estimator`: per-species fit, restarts, `Pi` and posterior-mode `z`

pub mod estimator;
pub mod likelihood;
pub mod optimizer;

pub use estimator::{DetectionCorrectedResult, OccupancyEstimator, OccupancyFit, SpeciesUnit};
pub use likelihood::{OccupancyDesign, OccupancyLikelihood, SpeciesHistory};
pub use optimizer::{maximize, LogLikelihood, OptimOutcome};
