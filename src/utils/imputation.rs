//! Trait imputation adapter
//!
//! The pipeline consumes a complete trait table. Filling gaps is delegated
//! to a `TraitImputer`; anything that turns a `RawTraitTable` into complete
//! log-scale values can plug in here.

use crate::data::{RawTraitTable, N_TRAITS, TRAIT_NAMES};
use crate::errors::{PipelineError, PipelineResult};
use crate::utils::normalization::log_trait;
use ndarray::Array2;

/// Contract: raw traits in, complete log-transformed traits out
/// (species × 3, same species order, every entry finite).
pub trait TraitImputer {
    fn impute(&self, raw: &RawTraitTable) -> PipelineResult<Array2<f64>>;
}

/// Fills each missing entry with the mean of the observed log values of
/// that trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanImputer;

impl TraitImputer for MeanImputer {
    fn impute(&self, raw: &RawTraitTable) -> PipelineResult<Array2<f64>> {
        let n = raw.n_species();
        let mut log_values: Array2<Option<f64>> = Array2::from_elem((n, N_TRAITS), None);

        for (k, row) in raw.values.iter().enumerate() {
            for (t, value) in row.iter().enumerate() {
                if let Some(v) = value {
                    log_values[[k, t]] = Some(log_trait(&raw.species_ids[k], t, *v)?);
                }
            }
        }

        let mut means = [0.0; N_TRAITS];
        for (t, mean) in means.iter_mut().enumerate() {
            let observed: Vec<f64> = log_values.column(t).iter().filter_map(|v| *v).collect();
            if observed.is_empty() {
                return Err(PipelineError::MissingTrait {
                    species: "<all species>".to_string(),
                    trait_name: TRAIT_NAMES[t],
                });
            }
            *mean = observed.iter().sum::<f64>() / observed.len() as f64;
        }

        Ok(Array2::from_shape_fn((n, N_TRAITS), |(k, t)| {
            log_values[[k, t]].unwrap_or(means[t])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_imputer_fills_gaps_on_log_scale() {
        let raw = RawTraitTable {
            species_ids: vec!["a".into(), "b".into(), "c".into()],
            values: vec![
                [Some(1.0), Some(10.0), Some(1.0)],
                [Some(100.0), None, Some(1.0)],
                [None, Some(1000.0), Some(1.0)],
            ],
        };
        let out = MeanImputer.impute(&raw).unwrap();

        assert_relative_eq!(out[[0, 0]], 0.0);
        // mean of ln(1) and ln(100)
        assert_relative_eq!(out[[2, 0]], 100f64.ln() / 2.0, epsilon = 1e-12);
        // geometric mean of 10 and 1000 on the log scale
        assert_relative_eq!(out[[1, 1]], 100f64.ln(), epsilon = 1e-12);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_mean_imputer_fails_on_empty_trait() {
        let raw = RawTraitTable {
            species_ids: vec!["a".into()],
            values: vec![[Some(1.0), None, Some(1.0)]],
        };
        assert!(MeanImputer.impute(&raw).is_err());
    }
}
