//! Error types for the detection-correction pipeline
//!
//! Two families:
//! - `PipelineError`: structural problems with the inputs (fatal, surfaced
//!   immediately) plus checkpoint I/O.
//! - `ConvergenceFailure` / `GeometryError`: per-species and per-plot
//!   conditions that are recorded as values and never abort a batch.

use thiserror::Error;

/// Fatal pipeline errors.
///
/// Every precondition variant names the dimension that disagrees so the
/// caller can tell which input is malformed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("plot count mismatch: {left_name} has {left} plots, {right_name} has {right}")]
    PlotCountMismatch {
        left_name: &'static str,
        left: usize,
        right_name: &'static str,
        right: usize,
    },

    #[error("species count mismatch: {left_name} has {left} species, {right_name} has {right}")]
    SpeciesCountMismatch {
        left_name: &'static str,
        left: usize,
        right_name: &'static str,
        right: usize,
    },

    #[error("species ordering mismatch at index {index}: {left_name} has '{left}', {right_name} has '{right}'")]
    SpeciesOrderMismatch {
        index: usize,
        left_name: &'static str,
        left: String,
        right_name: &'static str,
        right: String,
    },

    #[error("visit count must be 2, found {found}")]
    VisitCount { found: usize },

    #[error("plot '{plot}' visit {visit}: detection recorded but survey date is missing")]
    MissingSurveyDate { plot: String, visit: usize },

    #[error("plot '{plot}' is listed more than once")]
    DuplicatePlot { plot: String },

    #[error("detection for plot '{plot}', species '{species}', visit {visit} is recorded more than once")]
    DuplicateDetection { plot: String, species: String, visit: usize },

    #[error("plot '{plot}' has a non-finite elevation")]
    InvalidElevation { plot: String },

    #[error("species '{species}' trait '{trait_name}' is missing or non-finite")]
    MissingTrait { species: String, trait_name: &'static str },

    #[error("occurrence matrix entry [{plot}, {species}] is {value}, expected 0 or 1")]
    NonBinaryOccurrence { plot: usize, species: usize, value: u8 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Why a single species fit did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ConvergenceFailure {
    #[error("optimizer error: {0}")]
    Optimizer(String),

    #[error("optimizer stopped without converging ({status}) after {iterations} iterations")]
    NotConverged { status: String, iterations: u64 },

    #[error("non-finite estimate after optimization")]
    NonFinite,
}

/// Per-plot geometric conditions that leave FRic or mnnd undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("need at least {needed} distinct points, found {found}")]
    TooFewPoints { needed: usize, found: usize },

    #[error("points are collinear or coplanar")]
    Coplanar,

    #[error("convex hull construction failed")]
    HullFailed,
}
