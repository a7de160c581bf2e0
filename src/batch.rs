//! Batch occupancy fitting
//!
//! Drives the estimator over every species in parallel and assembles:
//! - `P`: per-species average detection probability
//! - `Z`: plot × species posterior-mode occurrence
//!
//! Each species lands in its own result slot; a failed fit leaves an
//! undefined column and never touches other species. Per-species RNG seeds
//! are drawn from the batch RNG before dispatch, so results do not depend on
//! scheduling.

use crate::config::OccupancyConfig;
use crate::data::{check_species_order, SurveyArray, SurveyData, TraitTable};
use crate::errors::{ConvergenceFailure, PipelineError, PipelineResult};
use crate::occupancy::{DetectionCorrectedResult, OccupancyDesign, OccupancyEstimator, SpeciesHistory, SpeciesUnit};
use crate::utils::normalization::CovariateScaling;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PROGRESS_EVERY: usize = 100;

/// What happened to one species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Fitted { iterations: u64, restarts: usize, log_lik: f64 },
    Failed { reason: ConvergenceFailure },
    Skipped { detections: usize },
}

/// `P`, `Z` and per-species outcomes in survey species order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub plot_ids: Vec<String>,
    pub species_ids: Vec<String>,
    pub p: Vec<Option<f64>>,
    pub z: Array2<Option<u8>>,
    pub outcomes: Vec<UnitOutcome>,
    pub scaling: CovariateScaling,
}

impl BatchOutput {
    pub fn n_fitted(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, UnitOutcome::Fitted { .. })).count()
    }

    pub fn n_failed(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, UnitOutcome::Failed { .. })).count()
    }

    pub fn n_skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, UnitOutcome::Skipped { .. })).count()
    }

    /// Species whose `z` column is fully defined, in order.
    pub fn usable_species(&self) -> Vec<usize> {
        (0..self.species_ids.len())
            .filter(|&k| self.z.column(k).iter().all(Option::is_some))
            .collect()
    }
}

/// Parallel driver for the per-species fits.
pub struct BatchRunner {
    estimator: OccupancyEstimator,
    n_threads: Option<usize>,
}

impl BatchRunner {
    pub fn new(config: OccupancyConfig, n_threads: Option<usize>) -> Self {
        Self { estimator: OccupancyEstimator::new(config), n_threads }
    }

    /// Split the survey into per-species units sharing one design.
    pub fn units(&self, data: &SurveyData) -> (CovariateScaling, Vec<SpeciesUnit>) {
        let config = self.estimator.config();
        let scaling = CovariateScaling::from_covariates(&data.covariates, config.elevation_scale, config.date_scale);
        let design = Arc::new(OccupancyDesign::new(
            &data.covariates,
            &scaling,
            config.detection_elevation_interaction,
        ));

        let units = data
            .survey
            .species_ids()
            .iter()
            .enumerate()
            .map(|(k, id)| SpeciesUnit {
                species: k,
                species_id: id.clone(),
                data: SpeciesHistory {
                    design: Arc::clone(&design),
                    history: data.survey.species_history(k).to_owned(),
                },
            })
            .collect();

        (scaling, units)
    }

    /// Fit every species and assemble `P` and `Z`.
    pub fn run(&self, data: &SurveyData, rng: &mut StdRng) -> PipelineResult<BatchOutput> {
        let n_plots = data.survey.n_plots();
        let (scaling, units) = self.units(data);
        let min_detections = self.estimator.config().min_detections;

        // STEP 1: Seeds for every species, drawn in species order
        let seeds: Vec<u64> = units.iter().map(|_| rng.gen()).collect();

        // STEP 2: Pre-filter species below the detection threshold
        let (to_fit, skipped): (Vec<_>, Vec<_>) = units
            .iter()
            .zip(&seeds)
            .partition(|(unit, _)| unit.total_detections() >= min_detections);

        tracing::info!(
            "Fitting {} species ({} below {} detections skipped)",
            to_fit.len(),
            skipped.len(),
            min_detections
        );

        // STEP 3: Parallel fits into per-species slots
        let progress = AtomicUsize::new(0);
        let total = to_fit.len();
        let fit_all = || -> FxHashMap<usize, (DetectionCorrectedResult, UnitOutcome)> {
            to_fit
                .par_iter()
                .map(|(unit, seed)| {
                    let mut unit_rng = StdRng::seed_from_u64(**seed);
                    let (result, fit) = self.estimator.estimate(unit, &mut unit_rng);
                    let outcome = match fit {
                        Ok(fit) => UnitOutcome::Fitted {
                            iterations: fit.iterations,
                            restarts: fit.restarts,
                            log_lik: fit.log_lik,
                        },
                        Err(reason) => {
                            tracing::warn!("{}: fit failed: {}", unit.species_id, reason);
                            UnitOutcome::Failed { reason }
                        }
                    };

                    let count = progress.fetch_add(1, Ordering::Relaxed) + 1;
                    if count % PROGRESS_EVERY == 0 || count == total {
                        tracing::info!("  Fitted: {}/{}", count, total);
                    }
                    (unit.species, (result, outcome))
                })
                .collect()
        };

        let mut slots = match self.n_threads {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| PipelineError::InvalidConfig(format!("thread pool: {}", e)))?
                .install(fit_all),
            None => fit_all(),
        };

        for (unit, _) in &skipped {
            slots.insert(
                unit.species,
                (
                    DetectionCorrectedResult::undefined(n_plots),
                    UnitOutcome::Skipped { detections: unit.total_detections() },
                ),
            );
        }

        // STEP 4: Assemble in species order
        let n_species = units.len();
        let mut p = Vec::with_capacity(n_species);
        let mut z = Array2::from_elem((n_plots, n_species), None);
        let mut outcomes = Vec::with_capacity(n_species);

        for k in 0..n_species {
            let (result, outcome) = slots.remove(&k).unwrap_or_else(|| {
                (DetectionCorrectedResult::undefined(n_plots), UnitOutcome::Skipped { detections: 0 })
            });
            p.push(result.pi);
            for (i, value) in result.z.into_iter().enumerate() {
                z[[i, k]] = value;
            }
            outcomes.push(outcome);
        }

        let output = BatchOutput {
            plot_ids: data.survey.plot_ids().to_vec(),
            species_ids: data.survey.species_ids().to_vec(),
            p,
            z,
            outcomes,
            scaling,
        };

        tracing::info!(
            "Batch complete: {} fitted, {} failed, {} skipped",
            output.n_fitted(),
            output.n_failed(),
            output.n_skipped()
        );
        Ok(output)
    }
}

/// Detection-corrected metacommunity restricted to the usable species.
///
/// `z`, `p`, `observed` and `traits` share one species subset and order.
#[derive(Debug, Clone)]
pub struct CorrectedMetaCommunity {
    pub plot_ids: Vec<String>,
    pub species_ids: Vec<String>,
    pub z: Array2<u8>,
    pub p: Vec<Option<f64>>,
    pub observed: Array2<u8>,
    pub traits: TraitTable,
    /// Species left out because their fit failed or was skipped.
    pub dropped: Vec<String>,
}

impl CorrectedMetaCommunity {
    /// Restrict `Z`, `P`, the observed matrix and the trait table to species
    /// with a fully defined `z`. Any species ordering disagreement between
    /// the survey, the trait table and the batch output is fatal.
    pub fn assemble(batch: &BatchOutput, survey: &SurveyArray, traits: &TraitTable) -> PipelineResult<Self> {
        check_species_order("survey array", survey.species_ids(), "trait table", traits.species_ids())?;
        check_species_order("survey array", survey.species_ids(), "batch output", &batch.species_ids)?;
        if batch.z.nrows() != survey.n_plots() {
            return Err(PipelineError::PlotCountMismatch {
                left_name: "survey array",
                left: survey.n_plots(),
                right_name: "batch output",
                right: batch.z.nrows(),
            });
        }

        let usable = batch.usable_species();
        let z = batch
            .z
            .select(Axis(1), &usable)
            .mapv(|v| v.unwrap_or_default());
        let observed = survey.observed_occurrence().select(Axis(1), &usable);

        let dropped = (0..batch.species_ids.len())
            .filter(|k| !usable.contains(k))
            .map(|k| batch.species_ids[k].clone())
            .collect::<Vec<_>>();
        if !dropped.is_empty() {
            tracing::info!("Usable subset: {} species kept, {} dropped", usable.len(), dropped.len());
        }

        Ok(Self {
            plot_ids: batch.plot_ids.clone(),
            species_ids: usable.iter().map(|&k| batch.species_ids[k].clone()).collect(),
            z,
            p: usable.iter().map(|&k| batch.p[k]).collect(),
            observed,
            traits: traits.subset(&usable),
            dropped,
        })
    }

    pub fn n_species(&self) -> usize {
        self.species_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Detection, PlotCovariates};
    use ndarray::Array3;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    /// Species 0 and 1 detected often; species 2 has a single detection.
    fn survey_data() -> SurveyData {
        let n_plots = 10;
        let mut detections: Array3<Detection> = Array3::from_elem((n_plots, 3, 2), Some(false));
        for i in 0..n_plots {
            detections[[i, 0, 0]] = Some(true);
            detections[[i, 0, 1]] = Some(true);
            if i % 3 != 1 {
                detections[[i, 1, i % 2]] = Some(true);
            }
        }
        detections[[4, 2, 0]] = Some(true);

        let survey = SurveyArray::new(ids("p", n_plots), ids("s", 3), detections).unwrap();
        let elevation = (0..n_plots).map(|i| 1000.0 + 100.0 * i as f64).collect();
        let dates = Array2::from_shape_fn((n_plots, 2), |(_, j)| Some(160.0 + 40.0 * j as f64));
        SurveyData::new(survey, PlotCovariates::new(elevation, dates).unwrap()).unwrap()
    }

    fn traits(species: Vec<String>) -> TraitTable {
        let n = species.len();
        TraitTable::new(species, Array2::from_shape_fn((n, 3), |(k, t)| (k * 3 + t) as f64)).unwrap()
    }

    #[test]
    fn test_sparse_species_skipped_and_dropped() {
        let data = survey_data();
        let runner = BatchRunner::new(OccupancyConfig::default(), Some(2));
        let batch = runner.run(&data, &mut StdRng::seed_from_u64(7)).unwrap();

        assert_eq!(batch.outcomes[2], UnitOutcome::Skipped { detections: 1 });
        assert_eq!(batch.p[2], None);
        assert!(batch.z.column(2).iter().all(Option::is_none));

        let community = CorrectedMetaCommunity::assemble(&batch, &data.survey, &traits(ids("s", 3))).unwrap();
        assert_eq!(community.dropped, vec!["s2".to_string()]);
        assert_eq!(community.n_species(), community.traits.n_species());
        assert_eq!(community.observed.ncols(), community.z.ncols());
    }

    #[test]
    fn test_batch_is_reproducible_across_thread_counts() {
        let data = survey_data();
        let one = BatchRunner::new(OccupancyConfig::default(), Some(1))
            .run(&data, &mut StdRng::seed_from_u64(11))
            .unwrap();
        let many = BatchRunner::new(OccupancyConfig::default(), Some(4))
            .run(&data, &mut StdRng::seed_from_u64(11))
            .unwrap();
        assert_eq!(one, many);
    }

    #[test]
    fn test_corrected_covers_observed() {
        let data = survey_data();
        let batch = BatchRunner::new(OccupancyConfig::default(), None)
            .run(&data, &mut StdRng::seed_from_u64(3))
            .unwrap();
        let community = CorrectedMetaCommunity::assemble(&batch, &data.survey, &traits(ids("s", 3))).unwrap();

        for ((i, k), &seen) in community.observed.indexed_iter() {
            if seen == 1 {
                assert_eq!(community.z[[i, k]], 1);
            }
        }
    }

    #[test]
    fn test_assemble_rejects_trait_order_mismatch() {
        let data = survey_data();
        let batch = BatchRunner::new(OccupancyConfig::default(), Some(1))
            .run(&data, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let swapped = vec!["s1".to_string(), "s0".to_string(), "s2".to_string()];
        let err = CorrectedMetaCommunity::assemble(&batch, &data.survey, &traits(swapped)).unwrap_err();
        assert!(matches!(err, PipelineError::SpeciesOrderMismatch { index: 0, .. }));
    }
}
