//! Normalization Utilities
//!
//! Two fixed transformations that must be computed once and reused:
//! - `CovariateScaling`: centers and scales for elevation and survey date,
//!   applied identically to every species fit
//! - `TraitStandardization`: log-transform then z-score per trait, fitted on
//!   the complete trait table before any correlation analysis

use crate::data::{PlotCovariates, TraitTable, N_TRAITS, TRAIT_NAMES};
use crate::errors::{PipelineError, PipelineResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Record of the covariate rescaling used by the occupancy fits.
///
/// `scaled = (raw - center) / scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovariateScaling {
    pub elevation_center: f64,
    pub elevation_scale: f64,
    pub date_center: f64,
    pub date_scale: f64,
}

impl CovariateScaling {
    /// Center on the survey means, scale by the configured constants.
    ///
    /// Date center is the mean over visits that happened.
    pub fn from_covariates(covariates: &PlotCovariates, elevation_scale: f64, date_scale: f64) -> Self {
        let elevation = covariates.elevation();
        let elevation_center = if elevation.is_empty() {
            0.0
        } else {
            elevation.iter().sum::<f64>() / elevation.len() as f64
        };

        let dates: Vec<f64> = covariates.dates().iter().filter_map(|d| *d).collect();
        let date_center = if dates.is_empty() {
            0.0
        } else {
            dates.iter().sum::<f64>() / dates.len() as f64
        };

        Self { elevation_center, elevation_scale, date_center, date_scale }
    }

    pub fn scale_elevation(&self, raw: f64) -> f64 {
        (raw - self.elevation_center) / self.elevation_scale
    }

    pub fn unscale_elevation(&self, scaled: f64) -> f64 {
        scaled * self.elevation_scale + self.elevation_center
    }

    pub fn scale_date(&self, raw: f64) -> f64 {
        (raw - self.date_center) / self.date_scale
    }

    pub fn unscale_date(&self, scaled: f64) -> f64 {
        scaled * self.date_scale + self.date_center
    }
}

/// Per-trait log-transform + z-score parameters.
///
/// `standardized = (ln(raw) - center) / scale`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitStandardization {
    pub center: [f64; N_TRAITS],
    pub scale: [f64; N_TRAITS],
}

impl TraitStandardization {
    /// Fit on log-transformed trait values (species × 3).
    ///
    /// Scale is the sample standard deviation; a constant trait gets scale 1
    /// so it maps to 0 rather than NaN.
    pub fn fit(log_values: &Array2<f64>) -> Self {
        let mut center = [0.0; N_TRAITS];
        let mut scale = [1.0; N_TRAITS];

        for t in 0..N_TRAITS {
            let column = log_values.column(t);
            let n = column.len();
            if n == 0 {
                continue;
            }
            let mean = column.sum() / n as f64;
            center[t] = mean;
            if n > 1 {
                let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                let sd = var.sqrt();
                if sd > 0.0 && sd.is_finite() {
                    scale[t] = sd;
                }
            }
        }

        Self { center, scale }
    }

    /// Apply to log-transformed values.
    pub fn apply_log(&self, log_values: &Array2<f64>) -> Array2<f64> {
        let mut out = log_values.clone();
        for mut row in out.rows_mut() {
            for t in 0..N_TRAITS {
                row[t] = (row[t] - self.center[t]) / self.scale[t];
            }
        }
        out
    }

    /// Build a standardized `TraitTable` from complete log-scale values.
    pub fn standardize(&self, species_ids: Vec<String>, log_values: &Array2<f64>) -> PipelineResult<TraitTable> {
        TraitTable::new(species_ids, self.apply_log(log_values))
    }
}

/// Natural log of a raw trait value; traits are strictly positive quantities.
pub fn log_trait(species: &str, trait_index: usize, raw: f64) -> PipelineResult<f64> {
    if raw > 0.0 && raw.is_finite() {
        Ok(raw.ln())
    } else {
        Err(PipelineError::MissingTrait {
            species: species.to_string(),
            trait_name: TRAIT_NAMES[trait_index],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_covariate_scaling_round_trips() {
        let dates = array![[Some(150.0), Some(190.0)], [Some(160.0), None]];
        let covariates = PlotCovariates::new(vec![1000.0, 2000.0], dates).unwrap();
        let scaling = CovariateScaling::from_covariates(&covariates, 1000.0, 100.0);

        assert_relative_eq!(scaling.elevation_center, 1500.0);
        // Missing visit excluded from the date center
        assert_relative_eq!(scaling.date_center, 500.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(scaling.scale_elevation(2000.0), 0.5);
        assert_relative_eq!(scaling.unscale_elevation(scaling.scale_elevation(1234.0)), 1234.0, epsilon = 1e-9);
        assert_relative_eq!(scaling.unscale_date(scaling.scale_date(201.0)), 201.0, epsilon = 1e-9);
    }

    #[test]
    fn test_standardization_zero_mean_unit_sd() {
        let log_values = array![[1.0, 10.0, -2.0], [2.0, 20.0, -2.0], [3.0, 30.0, -2.0]];
        let std = TraitStandardization::fit(&log_values);
        let out = std.apply_log(&log_values);

        for t in 0..2 {
            let col = out.column(t);
            assert_relative_eq!(col.sum(), 0.0, epsilon = 1e-12);
            let var = col.iter().map(|v| v * v).sum::<f64>() / 2.0;
            assert_relative_eq!(var, 1.0, epsilon = 1e-12);
        }
        // Constant trait maps to zero
        assert!(out.column(2).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_standardization_is_reapplied_not_refitted() {
        let train = array![[0.0, 0.0, 0.0], [2.0, 2.0, 2.0]];
        let std = TraitStandardization::fit(&train);
        let other = array![[4.0, 4.0, 4.0]];
        let out = std.apply_log(&other);
        // center 1, sd sqrt(2)
        assert_relative_eq!(out[[0, 0]], 3.0 / 2f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_log_trait_rejects_non_positive() {
        assert!(log_trait("s1", 0, 0.0).is_err());
        assert_relative_eq!(log_trait("s1", 0, 1.0).unwrap(), 0.0);
    }
}
