//! Survey and trait data
//!
//! Core containers for the detection-correction pipeline plus CSV loaders
//! built on Polars.
//!
//! Axes:
//! - `SurveyArray`: (plot, species, visit), visit axis fixed at 2
//! - `PlotCovariates`: one row per plot, dates per (plot, visit)
//! - `TraitTable`: one row per species, 3 trait columns
//!
//! The species axis of every container must carry the same ids in the same
//! order; `check_species_order` enforces that wherever two meet.

use crate::errors::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use polars::prelude::*;
use rustc_hash::FxHashMap;

/// Number of visits per plot in this survey design.
pub const N_VISITS: usize = 2;

/// Trait columns, in table order.
pub const TRAIT_NAMES: [&str; 3] = ["sla", "height", "seed_mass"];
pub const N_TRAITS: usize = 3;

/// Detection history: `Some(true)` detected, `Some(false)` not detected,
/// `None` visit did not happen.
pub type Detection = Option<bool>;

/// Binary detections indexed by (plot, species, visit).
#[derive(Debug, Clone)]
pub struct SurveyArray {
    plot_ids: Vec<String>,
    species_ids: Vec<String>,
    detections: Array3<Detection>,
}

impl SurveyArray {
    pub fn new(
        plot_ids: Vec<String>,
        species_ids: Vec<String>,
        detections: Array3<Detection>,
    ) -> PipelineResult<Self> {
        let (n_plots, n_species, n_visits) = detections.dim();
        if n_visits != N_VISITS {
            return Err(PipelineError::VisitCount { found: n_visits });
        }
        if plot_ids.len() != n_plots {
            return Err(PipelineError::PlotCountMismatch {
                left_name: "plot ids",
                left: plot_ids.len(),
                right_name: "survey array",
                right: n_plots,
            });
        }
        if species_ids.len() != n_species {
            return Err(PipelineError::SpeciesCountMismatch {
                left_name: "species ids",
                left: species_ids.len(),
                right_name: "survey array",
                right: n_species,
            });
        }
        Ok(Self { plot_ids, species_ids, detections })
    }

    pub fn n_plots(&self) -> usize {
        self.plot_ids.len()
    }

    pub fn n_species(&self) -> usize {
        self.species_ids.len()
    }

    pub fn plot_ids(&self) -> &[String] {
        &self.plot_ids
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn detection(&self, plot: usize, species: usize, visit: usize) -> Detection {
        self.detections[[plot, species, visit]]
    }

    /// Plot × visit slice for one species.
    pub fn species_history(&self, species: usize) -> ArrayView2<'_, Detection> {
        self.detections.index_axis(Axis(1), species)
    }

    /// Detections of a species summed over plots and visits.
    pub fn total_detections(&self, species: usize) -> usize {
        self.species_history(species)
            .iter()
            .filter(|d| **d == Some(true))
            .count()
    }

    /// Naive occurrence: 1 where the species was detected in any visit.
    pub fn observed_occurrence(&self) -> Array2<u8> {
        Array2::from_shape_fn((self.n_plots(), self.n_species()), |(i, k)| {
            let seen = (0..N_VISITS).any(|j| self.detections[[i, k, j]] == Some(true));
            u8::from(seen)
        })
    }
}

/// Per-plot elevation and per-(plot, visit) survey date.
#[derive(Debug, Clone)]
pub struct PlotCovariates {
    elevation: Vec<f64>,
    dates: Array2<Option<f64>>,
}

impl PlotCovariates {
    pub fn new(elevation: Vec<f64>, dates: Array2<Option<f64>>) -> PipelineResult<Self> {
        let (n_plots, n_visits) = dates.dim();
        if n_visits != N_VISITS {
            return Err(PipelineError::VisitCount { found: n_visits });
        }
        if elevation.len() != n_plots {
            return Err(PipelineError::PlotCountMismatch {
                left_name: "elevation",
                left: elevation.len(),
                right_name: "survey dates",
                right: n_plots,
            });
        }
        Ok(Self { elevation, dates })
    }

    pub fn n_plots(&self) -> usize {
        self.elevation.len()
    }

    pub fn elevation(&self) -> &[f64] {
        &self.elevation
    }

    pub fn date(&self, plot: usize, visit: usize) -> Option<f64> {
        self.dates[[plot, visit]]
    }

    pub fn dates(&self) -> &Array2<Option<f64>> {
        &self.dates
    }
}

/// Survey array paired with its plot covariates, validated together.
#[derive(Debug, Clone)]
pub struct SurveyData {
    pub survey: SurveyArray,
    pub covariates: PlotCovariates,
}

impl SurveyData {
    /// Validate that survey and covariates describe the same plots.
    ///
    /// Fails on plot-count mismatch, non-finite elevation, or a recorded
    /// detection on a visit without a survey date.
    pub fn new(survey: SurveyArray, covariates: PlotCovariates) -> PipelineResult<Self> {
        if survey.n_plots() != covariates.n_plots() {
            return Err(PipelineError::PlotCountMismatch {
                left_name: "survey array",
                left: survey.n_plots(),
                right_name: "plot covariates",
                right: covariates.n_plots(),
            });
        }

        for (i, plot) in survey.plot_ids().iter().enumerate() {
            if !covariates.elevation()[i].is_finite() {
                return Err(PipelineError::InvalidElevation { plot: plot.clone() });
            }
            for visit in 0..N_VISITS {
                if covariates.date(i, visit).is_some() {
                    continue;
                }
                let recorded = (0..survey.n_species()).any(|k| survey.detection(i, k, visit).is_some());
                if recorded {
                    return Err(PipelineError::MissingSurveyDate {
                        plot: plot.clone(),
                        visit: visit + 1,
                    });
                }
            }
        }

        Ok(Self { survey, covariates })
    }

    /// Load long-format survey CSVs.
    ///
    /// - `detections_path`: columns `plot, species, visit, detected`
    ///   (visit 1 or 2; detected 0/1, empty for a visit that did not happen)
    /// - `plots_path`: columns `plot, elevation, date_1, date_2`
    ///
    /// Plot order follows the plots file; species order is given by the
    /// caller (normally the trait table order). Unlisted (plot, species,
    /// visit) triples are treated as visits that did not happen.
    pub fn load_csv(detections_path: &str, plots_path: &str, species_ids: &[String]) -> Result<Self> {
        tracing::info!("Loading survey data...");

        let plots_df = read_csv(plots_path)?;
        let plot_ids = string_column(&plots_df, "plot")?;
        let elevation: Vec<f64> = float_column(&plots_df, "elevation")?
            .into_iter()
            .map(|e| e.unwrap_or(f64::NAN))
            .collect();
        let date_1 = float_column(&plots_df, "date_1")?;
        let date_2 = float_column(&plots_df, "date_2")?;

        let n_plots = plot_ids.len();
        let dates = Array2::from_shape_fn((n_plots, N_VISITS), |(i, j)| {
            if j == 0 { date_1[i] } else { date_2[i] }
        });

        let mut plot_index: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, id) in plot_ids.iter().enumerate() {
            if plot_index.insert(id.as_str(), i).is_some() {
                return Err(PipelineError::DuplicatePlot { plot: id.clone() }.into());
            }
        }
        let species_index: FxHashMap<&str, usize> = species_ids
            .iter()
            .enumerate()
            .map(|(k, id)| (id.as_str(), k))
            .collect();

        let det_df = read_csv(detections_path)?;
        let det_plots = string_column(&det_df, "plot")?;
        let det_species = string_column(&det_df, "species")?;
        let det_visits = float_column(&det_df, "visit")?;
        let det_values = float_column(&det_df, "detected")?;

        let mut detections = Array3::from_elem((n_plots, species_ids.len(), N_VISITS), None);
        let mut recorded = Array3::from_elem(detections.dim(), false);

        for row in 0..det_df.height() {
            let plot = &det_plots[row];
            let species = &det_species[row];
            let i = *plot_index
                .get(plot.as_str())
                .with_context(|| format!("Row {}: unknown plot '{}'", row + 1, plot))?;
            let k = *species_index
                .get(species.as_str())
                .with_context(|| format!("Row {}: unknown species '{}'", row + 1, species))?;
            let visit = match det_visits[row] {
                Some(v) if v == 1.0 || v == 2.0 => v as usize - 1,
                other => anyhow::bail!("Row {}: visit must be 1 or 2, found {:?}", row + 1, other),
            };
            if std::mem::replace(&mut recorded[[i, k, visit]], true) {
                return Err(PipelineError::DuplicateDetection {
                    plot: plot.clone(),
                    species: species.clone(),
                    visit: visit + 1,
                }
                .into());
            }
            detections[[i, k, visit]] = match det_values[row] {
                None => None,
                Some(v) if v == 0.0 => Some(false),
                Some(v) if v == 1.0 => Some(true),
                Some(v) => anyhow::bail!("Row {}: detected must be 0 or 1, found {}", row + 1, v),
            };
        }

        let survey = SurveyArray::new(plot_ids, species_ids.to_vec(), detections)?;
        let covariates = PlotCovariates::new(elevation, dates)?;
        let data = SurveyData::new(survey, covariates)?;

        tracing::info!("  Plots: {}", data.survey.n_plots());
        tracing::info!("  Species: {}", data.survey.n_species());
        tracing::info!("  Detection rows: {}", det_df.height());

        Ok(data)
    }
}

/// Trait table before imputation; entries may be missing.
#[derive(Debug, Clone)]
pub struct RawTraitTable {
    pub species_ids: Vec<String>,
    pub values: Vec<[Option<f64>; N_TRAITS]>,
}

impl RawTraitTable {
    /// Load `species, sla, height, seed_mass` from CSV (raw, untransformed units).
    pub fn load_csv(path: &str) -> Result<Self> {
        let df = read_csv(path)?;
        let species_ids = string_column(&df, "species")?;
        let columns: Vec<Vec<Option<f64>>> = TRAIT_NAMES
            .iter()
            .map(|name| float_column(&df, name))
            .collect::<Result<_>>()?;

        let values = (0..species_ids.len())
            .map(|k| [columns[0][k], columns[1][k], columns[2][k]])
            .collect();

        Ok(Self { species_ids, values })
    }

    pub fn n_species(&self) -> usize {
        self.species_ids.len()
    }
}

/// Complete, standardized trait table (species × 3).
#[derive(Debug, Clone, PartialEq)]
pub struct TraitTable {
    species_ids: Vec<String>,
    values: Array2<f64>,
}

impl TraitTable {
    pub fn new(species_ids: Vec<String>, values: Array2<f64>) -> PipelineResult<Self> {
        if values.ncols() != N_TRAITS || values.nrows() != species_ids.len() {
            return Err(PipelineError::SpeciesCountMismatch {
                left_name: "trait species ids",
                left: species_ids.len(),
                right_name: "trait values",
                right: values.nrows(),
            });
        }
        for (k, row) in values.outer_iter().enumerate() {
            if let Some(t) = row.iter().position(|v| !v.is_finite()) {
                return Err(PipelineError::MissingTrait {
                    species: species_ids[k].clone(),
                    trait_name: TRAIT_NAMES[t],
                });
            }
        }
        Ok(Self { species_ids, values })
    }

    pub fn n_species(&self) -> usize {
        self.species_ids.len()
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Trait-space coordinates of one species.
    pub fn point(&self, species: usize) -> [f64; N_TRAITS] {
        [
            self.values[[species, 0]],
            self.values[[species, 1]],
            self.values[[species, 2]],
        ]
    }

    /// Rows for the given species indices, in the given order.
    pub fn subset(&self, species: &[usize]) -> Self {
        Self {
            species_ids: species.iter().map(|&k| self.species_ids[k].clone()).collect(),
            values: self.values.select(Axis(0), species),
        }
    }
}

/// Fail unless both species lists carry the same ids in the same order.
pub fn check_species_order(
    left_name: &'static str,
    left: &[String],
    right_name: &'static str,
    right: &[String],
) -> PipelineResult<()> {
    if left.len() != right.len() {
        return Err(PipelineError::SpeciesCountMismatch {
            left_name,
            left: left.len(),
            right_name,
            right: right.len(),
        });
    }
    if let Some(index) = left.iter().zip(right).position(|(a, b)| a != b) {
        return Err(PipelineError::SpeciesOrderMismatch {
            index,
            left_name,
            left: left[index].clone(),
            right_name,
            right: right[index].clone(),
        });
    }
    Ok(())
}

/// Check that an occurrence matrix only holds 0/1.
pub fn check_binary(matrix: &Array2<u8>) -> PipelineResult<()> {
    for ((plot, species), &value) in matrix.indexed_iter() {
        if value > 1 {
            return Err(PipelineError::NonBinaryOccurrence { plot, species, value });
        }
    }
    Ok(())
}

// ============================================================================
// CSV helpers
// ============================================================================

fn read_csv(path: &str) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.into()))
        .with_context(|| format!("Failed to create CSV reader: {}", path))?
        .finish()
        .with_context(|| format!("Failed to load CSV: {}", path))
}

/// Column as strings; numeric ids are cast so "12" and 12 compare equal.
fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?
        .cast(&DataType::String)
        .with_context(|| format!("Column '{}' cannot be read as text", name))?;
    let values = column.str()?;

    (0..df.height())
        .map(|idx| {
            values
                .get(idx)
                .map(|s| s.to_string())
                .with_context(|| format!("Column '{}' row {} is empty", name, idx + 1))
        })
        .collect()
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = df
        .column(name)
        .with_context(|| format!("Column '{}' not found", name))?
        .cast(&DataType::Float64)
        .with_context(|| format!("Column '{}' is not numeric", name))?;
    let values = column.f64()?;

    Ok((0..df.height()).map(|idx| values.get(idx)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_survey_rejects_three_visits() {
        let detections = Array3::from_elem((2, 1, 3), Some(false));
        let err = SurveyArray::new(ids("p", 2), ids("s", 1), detections).unwrap_err();
        assert!(matches!(err, PipelineError::VisitCount { found: 3 }));
    }

    #[test]
    fn test_plot_count_mismatch_is_fatal() {
        let survey = SurveyArray::new(ids("p", 3), ids("s", 1), Array3::from_elem((3, 1, 2), Some(false))).unwrap();
        let covariates = PlotCovariates::new(vec![100.0, 200.0], Array2::from_elem((2, 2), Some(150.0))).unwrap();
        let err = SurveyData::new(survey, covariates).unwrap_err();
        assert!(matches!(err, PipelineError::PlotCountMismatch { left: 3, right: 2, .. }));
    }

    #[test]
    fn test_detection_without_date_is_fatal() {
        let mut detections = Array3::from_elem((2, 1, 2), Some(false));
        detections[[1, 0, 1]] = Some(true);
        let survey = SurveyArray::new(ids("p", 2), ids("s", 1), detections).unwrap();
        let dates = array![[Some(150.0), Some(180.0)], [Some(150.0), None]];
        let covariates = PlotCovariates::new(vec![100.0, 200.0], dates).unwrap();

        let err = SurveyData::new(survey, covariates).unwrap_err();
        assert!(matches!(err, PipelineError::MissingSurveyDate { visit: 2, .. }));
    }

    #[test]
    fn test_observed_occurrence_counts_any_visit() {
        let mut detections = Array3::from_elem((3, 2, 2), Some(false));
        detections[[0, 0, 1]] = Some(true);
        detections[[2, 1, 0]] = Some(true);
        detections[[2, 1, 1]] = Some(true);
        detections[[1, 0, 0]] = None;
        let survey = SurveyArray::new(ids("p", 3), ids("s", 2), detections).unwrap();

        let observed = survey.observed_occurrence();
        assert_eq!(observed, array![[1, 0], [0, 0], [0, 1]]);
        assert_eq!(survey.total_detections(1), 2);
    }

    #[test]
    fn test_trait_table_rejects_missing_values() {
        let values = array![[0.1, 0.2, 0.3], [0.4, f64::NAN, 0.6]];
        let err = TraitTable::new(ids("s", 2), values).unwrap_err();
        assert!(matches!(err, PipelineError::MissingTrait { trait_name: "height", .. }));
    }

    #[test]
    fn test_species_order_mismatch_names_index() {
        let left = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let right = vec!["a".to_string(), "c".to_string(), "b".to_string()];
        let err = check_species_order("survey", &left, "traits", &right).unwrap_err();
        assert!(matches!(err, PipelineError::SpeciesOrderMismatch { index: 1, .. }));
        assert!(check_species_order("survey", &left, "traits", &left).is_ok());
    }

    #[test]
    fn test_trait_subset_keeps_order() {
        let values = array![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
        let table = TraitTable::new(ids("s", 3), values).unwrap();
        let subset = table.subset(&[0, 2]);
        assert_eq!(subset.species_ids(), &["s0".to_string(), "s2".to_string()]);
        assert_eq!(subset.point(1), [2.0, 2.0, 2.0]);
    }

    fn write_inputs(name: &str, plots: &str, detections: &str) -> (std::path::PathBuf, String, String) {
        let dir = std::env::temp_dir().join(format!("detection_fd_data_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let plots_path = dir.join("plots.csv");
        let det_path = dir.join("detections.csv");
        std::fs::write(&plots_path, plots).unwrap();
        std::fs::write(&det_path, detections).unwrap();
        (dir, det_path.to_string_lossy().into_owned(), plots_path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_load_csv_rejects_duplicate_plot() {
        let (dir, det, plots) = write_inputs(
            "dup_plot",
            "plot,elevation,date_1,date_2\np1,1200,150,190\np1,1500,155,195\n",
            "plot,species,visit,detected\np1,s0,1,1\n",
        );
        let err = SurveyData::load_csv(&det, &plots, &ids("s", 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicatePlot { plot }) if plot == "p1"
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_csv_rejects_duplicate_detection_row() {
        let (dir, det, plots) = write_inputs(
            "dup_det",
            "plot,elevation,date_1,date_2\np1,1200,150,190\n",
            "plot,species,visit,detected\np1,s0,1,0\np1,s0,2,0\np1,s0,1,1\n",
        );
        let err = SurveyData::load_csv(&det, &plots, &ids("s", 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicateDetection { visit: 1, .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
