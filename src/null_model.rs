//! Richness-preserving null model
//!
//! Each draw keeps every plot's richness and replaces species identities
//! with a random subset of the pool: shuffle all species indices, take the
//! first `richness_i`. FRic and mnnd are recomputed per draw, and the
//! reference metric is standardized as `(metric − null_mean) / null_sd`.
//!
//! Draw seeds come from the caller's RNG up front; draws then run in
//! parallel and the result does not depend on thread scheduling.

use crate::config::NullModelConfig;
use crate::data::TraitTable;
use crate::errors::{PipelineError, PipelineResult};
use crate::metrics::{diversity_of, CommunityMetricSet};
use crate::utils::stats::{mean, sample_sd};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Null standard deviations at or below this (relative to the mean) are zero.
const ZERO_SD_TOL: f64 = 1e-12;

/// Per-plot null distribution summary for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullSummary {
    pub mean: Vec<Option<f64>>,
    pub sd: Vec<Option<f64>>,
    /// Defined draws per plot.
    pub n_defined: Vec<usize>,
}

/// Standardized FRic and mnnd against one reference matrix's null ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedMetrics {
    pub fric: Vec<Option<f64>>,
    pub mnnd: Vec<Option<f64>>,
    pub fric_null: NullSummary,
    pub mnnd_null: NullSummary,
}

/// One randomized community per plot: the first `richness[i]` entries of a
/// shuffled species pool.
pub fn null_sample(richness: &[usize], n_species: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut pool: Vec<usize> = (0..n_species).collect();
    richness
        .iter()
        .map(|&r| {
            pool.shuffle(rng);
            pool[..r.min(n_species)].to_vec()
        })
        .collect()
}

/// `(value − mean) / sd`; undefined when any input is, or when the null
/// distribution has no spread.
pub fn standardize(value: Option<f64>, null_mean: Option<f64>, null_sd: Option<f64>) -> Option<f64> {
    let (v, m, s) = (value?, null_mean?, null_sd?);
    if !(s > ZERO_SD_TOL * m.abs().max(1.0)) {
        return None;
    }
    let z = (v - m) / s;
    z.is_finite().then_some(z)
}

fn summarize(draws: &[Vec<Option<f64>>], n_plots: usize) -> NullSummary {
    let mut summary = NullSummary {
        mean: Vec::with_capacity(n_plots),
        sd: Vec::with_capacity(n_plots),
        n_defined: Vec::with_capacity(n_plots),
    };
    for i in 0..n_plots {
        let column: Vec<Option<f64>> = draws.iter().map(|d| d[i]).collect();
        summary.n_defined.push(column.iter().filter(|v| v.is_some()).count());
        summary.mean.push(mean(&column));
        summary.sd.push(sample_sd(&column));
    }
    summary
}

/// Build the null ensemble for `reference` and standardize its FRic and mnnd.
///
/// Draws run on a pool of `n_threads` workers, or on rayon's global pool
/// when unset.
pub struct NullModelCorrector {
    config: NullModelConfig,
    n_threads: Option<usize>,
}

impl NullModelCorrector {
    pub fn new(config: NullModelConfig, n_threads: Option<usize>) -> Self {
        Self { config, n_threads }
    }

    pub fn standardize_against_null(
        &self,
        reference: &CommunityMetricSet,
        traits: &TraitTable,
        rng: &mut StdRng,
    ) -> PipelineResult<StandardizedMetrics> {
        let n_plots = reference.n_plots();
        let n_species = traits.n_species();
        let seeds: Vec<u64> = (0..self.config.nsim).map(|_| rng.gen()).collect();

        let run_draws = || -> Vec<(Vec<Option<f64>>, Vec<Option<f64>>)> {
            seeds
                .par_iter()
                .map(|&seed| {
                    let mut draw_rng = StdRng::seed_from_u64(seed);
                    let sample = null_sample(&reference.richness, n_species, &mut draw_rng);
                    sample
                        .iter()
                        .map(|present| {
                            let d = diversity_of(present, traits);
                            (d.fric, d.mnnd)
                        })
                        .unzip()
                })
                .collect()
        };

        let draws = match self.n_threads {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PipelineError::InvalidConfig(format!("thread pool: {}", e)))?
                .install(run_draws),
            None => run_draws(),
        };

        let (fric_draws, mnnd_draws): (Vec<_>, Vec<_>) = draws.into_iter().unzip();
        let fric_null = summarize(&fric_draws, n_plots);
        let mnnd_null = summarize(&mnnd_draws, n_plots);

        let fric: Vec<Option<f64>> = (0..n_plots)
            .map(|i| standardize(reference.fric[i], fric_null.mean[i], fric_null.sd[i]))
            .collect();
        let mnnd: Vec<Option<f64>> = (0..n_plots)
            .map(|i| standardize(reference.mnnd[i], mnnd_null.mean[i], mnnd_null.sd[i]))
            .collect();

        let degenerate = (0..n_plots)
            .filter(|&i| reference.fric[i].is_some() && fric[i].is_none())
            .count();
        if degenerate > 0 {
            tracing::warn!(
                "Standardized FRic undefined at {} plots with defined FRic (degenerate null distribution)",
                degenerate
            );
        }

        Ok(StandardizedMetrics { fric, mnnd, fric_null, mnnd_null })
    }
}
