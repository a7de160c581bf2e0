//! Per-species occupancy estimation
//!
//! Two stages:
//! 1. maximize the marginal likelihood over the logit coefficients
//! 2. read `Pi` and the posterior-mode occurrence vector off the fit

use super::likelihood::{sigmoid, OccupancyLikelihood, SpeciesHistory, N_OCC_PARAMS};
use super::optimizer::{maximize, Theta};
use crate::config::{OccupancyConfig, PiMode};
use crate::data::N_VISITS;
use crate::errors::ConvergenceFailure;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Immutable unit of work: one species' history against the shared design.
#[derive(Debug, Clone)]
pub struct SpeciesUnit {
    /// Column index in the survey array.
    pub species: usize,
    pub species_id: String,
    pub data: SpeciesHistory,
}

impl SpeciesUnit {
    pub fn total_detections(&self) -> usize {
        self.data.history.iter().filter(|d| **d == Some(true)).count()
    }
}

/// Fitted model for one species.
#[derive(Debug, Clone)]
pub struct OccupancyFit {
    pub theta: Theta,
    /// Maximized penalized log-likelihood.
    pub log_lik: f64,
    pub iterations: u64,
    /// Number of restarts used before convergence (0 = first attempt).
    pub restarts: usize,
    /// `P(z = 1 | history)` per plot.
    pub posterior: Vec<f64>,
    data: SpeciesHistory,
}

impl OccupancyFit {
    pub fn new(theta: Theta, log_lik: f64, iterations: u64, restarts: usize, data: SpeciesHistory) -> Self {
        let posterior = data.posterior(&theta);
        Self { theta, log_lik, iterations, restarts, posterior, data }
    }

    pub fn n_plots(&self) -> usize {
        self.posterior.len()
    }

    /// Fitted occupancy probability at a plot.
    pub fn psi(&self, plot: usize) -> f64 {
        sigmoid(self.data.design.eta_psi(&self.theta, plot))
    }

    /// Fitted detection probability; `None` for a visit that did not happen.
    pub fn p(&self, plot: usize, visit: usize) -> Option<f64> {
        self.data.design.eta_p(&self.theta, plot, visit).map(sigmoid)
    }

    /// Probability of at least one detection at a plot if the species is
    /// there. A visit that did not happen contributes `p = 0`.
    pub fn cumulative_detection(&self, plot: usize) -> f64 {
        let miss: f64 = (0..N_VISITS)
            .map(|j| 1.0 - self.p(plot, j).unwrap_or(0.0))
            .product();
        1.0 - miss
    }

    /// Posterior mode of the latent state: 1 where detected, otherwise
    /// 1 iff `P(z = 1 | history) > 0.5`.
    pub fn posterior_mode(&self) -> Vec<u8> {
        self.posterior
            .iter()
            .enumerate()
            .map(|(i, &post)| u8::from(self.data.detected_at(i) || post > 0.5))
            .collect()
    }

    /// Average detection probability over plots.
    ///
    /// `UniversalPresence` averages over every plot; `ConditionalOnOccurrence`
    /// over plots with `z = 1` and is undefined when there are none.
    pub fn average_detection(&self, z: &[u8], mode: PiMode) -> Option<f64> {
        let plots: Vec<usize> = match mode {
            PiMode::UniversalPresence => (0..self.n_plots()).collect(),
            PiMode::ConditionalOnOccurrence => (0..self.n_plots()).filter(|&i| z[i] == 1).collect(),
        };
        if plots.is_empty() {
            return None;
        }
        let total: f64 = plots.iter().map(|&i| self.cumulative_detection(i)).sum();
        Some(total / plots.len() as f64)
    }

    pub fn extract(&self, mode: PiMode) -> DetectionCorrectedResult {
        let z = self.posterior_mode();
        let pi = self.average_detection(&z, mode);
        DetectionCorrectedResult {
            pi,
            z: z.into_iter().map(Some).collect(),
        }
    }
}

/// `Pi` and `z` for one species; all undefined after a failed fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCorrectedResult {
    pub pi: Option<f64>,
    pub z: Vec<Option<u8>>,
}

impl DetectionCorrectedResult {
    pub fn undefined(n_plots: usize) -> Self {
        Self { pi: None, z: vec![None; n_plots] }
    }

    /// Every plot has a defined state.
    pub fn is_complete(&self) -> bool {
        self.z.iter().all(Option::is_some)
    }
}

/// Fits occupancy models with the configured optimizer and restart policy.
#[derive(Debug, Clone)]
pub struct OccupancyEstimator {
    config: OccupancyConfig,
    likelihood: OccupancyLikelihood,
}

impl OccupancyEstimator {
    pub fn new(config: OccupancyConfig) -> Self {
        let likelihood = OccupancyLikelihood { ridge_penalty: config.ridge_penalty };
        Self { config, likelihood }
    }

    pub fn config(&self) -> &OccupancyConfig {
        &self.config
    }

    /// Fit one unit. The first attempt starts from the naive intercepts;
    /// each restart jitters that start with draws from `rng`.
    pub fn fit(&self, unit: &SpeciesUnit, rng: &mut StdRng) -> Result<OccupancyFit, ConvergenceFailure> {
        let start = initial_theta(&unit.data);

        let mut last_failure = match maximize(&self.likelihood, &unit.data, start.clone(), &self.config) {
            Ok(outcome) => {
                return Ok(OccupancyFit::new(outcome.theta_hat, outcome.value, outcome.iterations, 0, unit.data.clone()));
            }
            Err(failure) => failure,
        };

        for restart in 1..=self.config.n_restarts {
            tracing::debug!(
                "{}: attempt {} failed ({}), restarting",
                unit.species_id,
                restart,
                last_failure
            );
            let jitter = self.config.restart_jitter;
            let theta0 = start.mapv(|t| t + rng.gen_range(-jitter..=jitter));
            match maximize(&self.likelihood, &unit.data, theta0, &self.config) {
                Ok(outcome) => {
                    return Ok(OccupancyFit::new(
                        outcome.theta_hat,
                        outcome.value,
                        outcome.iterations,
                        restart,
                        unit.data.clone(),
                    ));
                }
                Err(failure) => last_failure = failure,
            }
        }

        Err(last_failure)
    }

    /// Fit and extract; a failed fit gives the all-undefined result.
    pub fn estimate(
        &self,
        unit: &SpeciesUnit,
        rng: &mut StdRng,
    ) -> (DetectionCorrectedResult, Result<OccupancyFit, ConvergenceFailure>) {
        let n_plots = unit.data.design.n_plots();
        let fit = self.fit(unit, rng);
        let result = match &fit {
            Ok(fit) => fit.extract(self.config.pi_mode),
            Err(_) => DetectionCorrectedResult::undefined(n_plots),
        };
        (result, fit)
    }
}

/// Start from logit of the naive occupancy and per-visit detection rates,
/// slopes at zero.
fn initial_theta(data: &SpeciesHistory) -> Theta {
    let n_plots = data.design.n_plots();
    let occupied = (0..n_plots).filter(|&i| data.detected_at(i)).count();

    let mut visits = 0usize;
    let mut hits = 0usize;
    for i in (0..n_plots).filter(|&i| data.detected_at(i)) {
        for y in data.history.row(i).iter().flatten() {
            visits += 1;
            hits += usize::from(*y);
        }
    }

    let logit = |num: usize, den: usize| {
        let rate = if den == 0 { 0.5 } else { num as f64 / den as f64 };
        let rate = rate.clamp(0.05, 0.95);
        (rate / (1.0 - rate)).ln()
    };

    let mut theta = Array1::zeros(data.design.n_params());
    theta[0] = logit(occupied, n_plots);
    theta[N_OCC_PARAMS] = logit(hits, visits);
    theta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Detection, PlotCovariates};
    use crate::occupancy::likelihood::OccupancyDesign;
    use crate::utils::normalization::CovariateScaling;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn design(n_plots: usize, missing_second_visit: &[usize]) -> Arc<OccupancyDesign> {
        let elevation: Vec<f64> = (0..n_plots).map(|i| 1000.0 + 100.0 * i as f64).collect();
        let dates = Array2::from_shape_fn((n_plots, 2), |(i, j)| {
            if j == 1 && missing_second_visit.contains(&i) {
                None
            } else {
                Some(150.0 + 40.0 * j as f64 + (i % 3) as f64 * 5.0)
            }
        });
        let covariates = PlotCovariates::new(elevation, dates).unwrap();
        let scaling = CovariateScaling::from_covariates(&covariates, 1000.0, 100.0);
        Arc::new(OccupancyDesign::new(&covariates, &scaling, false))
    }

    /// Present everywhere; detected on one alternating visit except at
    /// `missed` plots.
    fn imperfect_history(n_plots: usize, missed: &[usize]) -> Array2<Detection> {
        Array2::from_shape_fn((n_plots, 2), |(i, j)| {
            if missed.contains(&i) {
                Some(false)
            } else {
                Some(j == i % 2)
            }
        })
    }

    fn unit(history: Array2<Detection>, design: Arc<OccupancyDesign>) -> SpeciesUnit {
        SpeciesUnit {
            species: 0,
            species_id: "sp".to_string(),
            data: SpeciesHistory { design, history },
        }
    }

    #[test]
    fn test_fit_converges_with_valid_outputs() {
        let n = 12;
        let unit = unit(imperfect_history(n, &[1, 5, 9]), design(n, &[]));
        let estimator = OccupancyEstimator::new(OccupancyConfig::default());
        let mut rng = StdRng::seed_from_u64(1);

        let (result, fit) = estimator.estimate(&unit, &mut rng);
        assert!(fit.is_ok());
        let pi = result.pi.unwrap();
        assert!((0.0..=1.0).contains(&pi));
        assert!(result.is_complete());
        assert!(result.z.iter().all(|z| matches!(z, Some(0) | Some(1))));
    }

    #[test]
    fn test_observed_plots_are_occupied() {
        let n = 12;
        let history = imperfect_history(n, &[1, 5, 9]);
        let unit = unit(history.clone(), design(n, &[]));
        let estimator = OccupancyEstimator::new(OccupancyConfig::default());
        let fit = estimator.fit(&unit, &mut StdRng::seed_from_u64(2)).unwrap();
        let z = fit.posterior_mode();

        for i in 0..n {
            if history.row(i).iter().any(|d| *d == Some(true)) {
                assert_eq!(z[i], 1);
                assert_relative_eq!(fit.posterior[i], 1.0);
            }
        }
    }

    #[test]
    fn test_pi_is_three_quarters_at_half_detection() {
        let n = 4;
        let unit = unit(imperfect_history(n, &[]), design(n, &[]));
        // Detection coefficients all zero: p = 0.5 on every visit.
        let fit = OccupancyFit::new(Array1::zeros(6), 0.0, 0, 0, unit.data.clone());

        for i in 0..n {
            assert_relative_eq!(fit.p(i, 0).unwrap(), 0.5);
        }
        let z = fit.posterior_mode();
        assert_relative_eq!(fit.average_detection(&z, PiMode::UniversalPresence).unwrap(), 0.75);
    }

    #[test]
    fn test_missing_visit_counts_as_zero_detection() {
        let n = 2;
        let unit = unit(imperfect_history(n, &[]), design(n, &[1]));
        let fit = OccupancyFit::new(Array1::zeros(6), 0.0, 0, 0, unit.data.clone());

        assert_eq!(fit.p(1, 1), None);
        assert_relative_eq!(fit.cumulative_detection(0), 0.75);
        assert_relative_eq!(fit.cumulative_detection(1), 0.5);
    }

    #[test]
    fn test_conditional_pi_undefined_without_occupied_plots() {
        let n = 3;
        let unit = unit(Array2::from_elem((n, 2), Some(false)), design(n, &[]));
        let fit = OccupancyFit::new(Array1::zeros(6), 0.0, 0, 0, unit.data.clone());
        assert_eq!(fit.average_detection(&[0, 0, 0], PiMode::ConditionalOnOccurrence), None);
        assert!(fit.average_detection(&[0, 0, 0], PiMode::UniversalPresence).is_some());
    }

    #[test]
    fn test_iteration_cap_yields_undefined_result() {
        let n = 12;
        let unit = unit(imperfect_history(n, &[1, 5, 9]), design(n, &[]));
        let config = OccupancyConfig { max_iters: 1, n_restarts: 1, ..OccupancyConfig::default() };
        let estimator = OccupancyEstimator::new(config);

        let (result, fit) = estimator.estimate(&unit, &mut StdRng::seed_from_u64(3));
        assert!(fit.is_err());
        assert_eq!(result, DetectionCorrectedResult::undefined(n));
        assert!(!result.is_complete());
    }
}
