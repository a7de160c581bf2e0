//! Community metrics
//!
//! For a binary plot × species matrix and a trait table over the same
//! species, each plot gets:
//! - trait means (one per trait)
//! - FRic, convex-hull volume
//! - mnnd, mean nearest-neighbour distance
//! - richness
//!
//! Plots are independent and computed in parallel. Degenerate geometry
//! leaves FRic/mnnd undefined for that plot only.

pub mod functional_packing;
pub mod functional_richness;
pub mod relevance;
pub mod trait_means;

pub use functional_packing::mean_nearest_neighbour_distance;
pub use functional_richness::convex_hull_volume;
pub use relevance::{is_relevant, relevance_threshold};
pub use trait_means::community_trait_means;

use crate::data::{check_binary, TraitTable, N_TRAITS};
use crate::errors::{PipelineError, PipelineResult};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-plot metrics for one occurrence matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMetricSet {
    /// Indexed `[trait][plot]`.
    pub trait_means: Vec<Vec<Option<f64>>>,
    pub fric: Vec<Option<f64>>,
    pub mnnd: Vec<Option<f64>>,
    pub richness: Vec<usize>,
}

impl CommunityMetricSet {
    pub fn n_plots(&self) -> usize {
        self.richness.len()
    }

    /// Richness as a metric column.
    pub fn richness_values(&self) -> Vec<Option<f64>> {
        self.richness.iter().map(|&r| Some(r as f64)).collect()
    }
}

/// FRic and mnnd only; what the null model needs per draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityPair {
    pub fric: Option<f64>,
    pub mnnd: Option<f64>,
}

/// Indices of species present in one plot row.
pub fn present_species(row: ArrayView1<'_, u8>) -> Vec<usize> {
    row.iter()
        .enumerate()
        .filter(|&(_, &v)| v == 1)
        .map(|(k, _)| k)
        .collect()
}

/// FRic and mnnd for a set of present species.
pub fn diversity_of(present: &[usize], traits: &TraitTable) -> DiversityPair {
    let points: Vec<[f64; N_TRAITS]> = present.iter().map(|&k| traits.point(k)).collect();
    DiversityPair {
        fric: convex_hull_volume(&points).ok(),
        mnnd: mean_nearest_neighbour_distance(&points).ok(),
    }
}

fn check_shapes(matrix: &Array2<u8>, traits: &TraitTable) -> PipelineResult<()> {
    if matrix.ncols() != traits.n_species() {
        return Err(PipelineError::SpeciesCountMismatch {
            left_name: "occurrence matrix",
            left: matrix.ncols(),
            right_name: "trait table",
            right: traits.n_species(),
        });
    }
    check_binary(matrix)
}

/// Compute every metric for every plot of `matrix`.
pub fn compute_community_metrics(matrix: &Array2<u8>, traits: &TraitTable) -> PipelineResult<CommunityMetricSet> {
    check_shapes(matrix, traits)?;

    let per_plot: Vec<(Option<[f64; N_TRAITS]>, DiversityPair, usize)> = (0..matrix.nrows())
        .into_par_iter()
        .map(|i| {
            let present = present_species(matrix.row(i));
            let means = community_trait_means(&present, traits);
            let diversity = diversity_of(&present, traits);
            (means, diversity, present.len())
        })
        .collect();

    let trait_means = (0..N_TRAITS)
        .map(|t| per_plot.iter().map(|(m, _, _)| m.map(|m| m[t])).collect())
        .collect();

    let set = CommunityMetricSet {
        trait_means,
        fric: per_plot.iter().map(|(_, d, _)| d.fric).collect(),
        mnnd: per_plot.iter().map(|(_, d, _)| d.mnnd).collect(),
        richness: per_plot.iter().map(|(_, _, r)| *r).collect(),
    };

    let undefined_fric = set.fric.iter().filter(|v| v.is_none()).count();
    if undefined_fric > 0 {
        tracing::debug!("FRic undefined at {}/{} plots (degenerate geometry)", undefined_fric, set.n_plots());
    }
    Ok(set)
}
