//! End-to-end detection-correction pipeline
//!
//! Stages:
//! 1. batch occupancy fit → `P`, `Z` (from checkpoint when one matches)
//! 2. usable-subset assembly
//! 3. community metrics on the observed and the corrected matrix
//! 4. null-model standardization of each, with its own ensemble
//! 5. per-metric observed-vs-corrected comparison

use crate::batch::{BatchOutput, BatchRunner, CorrectedMetaCommunity};
use crate::checkpoint;
use crate::config::PipelineConfig;
use crate::data::{SurveyData, TraitTable, TRAIT_NAMES};
use crate::errors::PipelineResult;
use crate::metrics::{compute_community_metrics, is_relevant, relevance_threshold, CommunityMetricSet};
use crate::null_model::{NullModelCorrector, StandardizedMetrics};
use crate::utils::stats::ols_slope;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One plot's observed vs corrected value for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub plot: String,
    pub elevation: f64,
    pub observed: Option<f64>,
    pub corrected: Option<f64>,
    /// `corrected − observed`.
    pub difference: Option<f64>,
    pub relevant: bool,
}

/// Relevance test for one metric across all plots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: String,
    /// OLS slope of the corrected metric on elevation.
    pub slope: Option<f64>,
    pub threshold: Option<f64>,
    pub rows: Vec<ComparisonRow>,
}

impl MetricComparison {
    pub fn n_relevant(&self) -> usize {
        self.rows.iter().filter(|r| r.relevant).count()
    }

    fn build(
        metric: &str,
        plot_ids: &[String],
        elevation: &[f64],
        observed: &[Option<f64>],
        corrected: &[Option<f64>],
        span: f64,
    ) -> Self {
        let slope = ols_slope(elevation, corrected);
        let threshold = relevance_threshold(elevation, corrected, span);

        let rows = (0..plot_ids.len())
            .map(|i| {
                let (o, c) = (observed[i], corrected[i]);
                ComparisonRow {
                    plot: plot_ids[i].clone(),
                    elevation: elevation[i],
                    observed: o,
                    corrected: c,
                    difference: o.zip(c).map(|(o, c)| c - o),
                    relevant: is_relevant(o, c, threshold),
                }
            })
            .collect();

        Self { metric: metric.to_string(), slope, threshold, rows }
    }
}

/// Compare every metric: trait means, FRic, mnnd, richness and the two
/// standardized diversity metrics.
pub fn compare_metrics(
    plot_ids: &[String],
    elevation: &[f64],
    observed: &CommunityMetricSet,
    corrected: &CommunityMetricSet,
    observed_std: &StandardizedMetrics,
    corrected_std: &StandardizedMetrics,
    span: f64,
) -> Vec<MetricComparison> {
    let mut out = Vec::new();

    for (t, name) in TRAIT_NAMES.iter().enumerate() {
        out.push(MetricComparison::build(
            &format!("mean_{}", name),
            plot_ids,
            elevation,
            &observed.trait_means[t],
            &corrected.trait_means[t],
            span,
        ));
    }
    out.push(MetricComparison::build("fric", plot_ids, elevation, &observed.fric, &corrected.fric, span));
    out.push(MetricComparison::build("mnnd", plot_ids, elevation, &observed.mnnd, &corrected.mnnd, span));
    out.push(MetricComparison::build(
        "richness",
        plot_ids,
        elevation,
        &observed.richness_values(),
        &corrected.richness_values(),
        span,
    ));
    out.push(MetricComparison::build(
        "fric_ses",
        plot_ids,
        elevation,
        &observed_std.fric,
        &corrected_std.fric,
        span,
    ));
    out.push(MetricComparison::build(
        "mnnd_ses",
        plot_ids,
        elevation,
        &observed_std.mnnd,
        &corrected_std.mnnd,
        span,
    ));

    out
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub config_fingerprint: String,
    /// The batch output came from a matching checkpoint.
    pub batch_from_checkpoint: bool,
    pub batch: BatchOutput,
    /// Usable species, in survey order.
    pub species_ids: Vec<String>,
    pub dropped_species: Vec<String>,
    pub z: Array2<u8>,
    pub observed_metrics: CommunityMetricSet,
    pub corrected_metrics: CommunityMetricSet,
    pub observed_standardized: StandardizedMetrics,
    pub corrected_standardized: StandardizedMetrics,
    pub comparisons: Vec<MetricComparison>,
}

/// Run all stages. `traits` must list the survey's species in survey order.
///
/// `rng` is split into one stream for the batch fit and one for the null
/// models before any stage runs, so a checkpoint hit leaves the null
/// ensembles unchanged.
pub fn run_pipeline(
    data: &SurveyData,
    traits: &TraitTable,
    config: &PipelineConfig,
    rng: &mut StdRng,
) -> PipelineResult<PipelineReport> {
    config.validate()?;
    let total_start = Instant::now();
    let mut batch_rng = StdRng::seed_from_u64(rng.gen());
    let mut null_rng = StdRng::seed_from_u64(rng.gen());

    // STEP 1: Batch fit (or checkpoint)
    let cached = match &config.checkpoint_dir {
        Some(dir) => checkpoint::load(dir, config, data)?,
        None => None,
    };
    let batch_from_checkpoint = cached.is_some();
    let batch = match cached {
        Some(batch) => batch,
        None => {
            let start = Instant::now();
            let runner = BatchRunner::new(config.occupancy.clone(), config.n_threads);
            let batch = runner.run(data, &mut batch_rng)?;
            tracing::info!("Batch fit in {:.2}s", start.elapsed().as_secs_f64());
            if let Some(dir) = &config.checkpoint_dir {
                checkpoint::save(dir, config, data, &batch)?;
            }
            batch
        }
    };

    // STEP 2: Usable subset
    let community = CorrectedMetaCommunity::assemble(&batch, &data.survey, traits)?;

    // STEP 3: Metrics
    let observed_metrics = compute_community_metrics(&community.observed, &community.traits)?;
    let corrected_metrics = compute_community_metrics(&community.z, &community.traits)?;

    // STEP 4: Null models, one ensemble per reference matrix
    let corrector = NullModelCorrector::new(config.null_model.clone(), config.n_threads);
    let observed_standardized =
        corrector.standardize_against_null(&observed_metrics, &community.traits, &mut null_rng)?;
    let corrected_standardized =
        corrector.standardize_against_null(&corrected_metrics, &community.traits, &mut null_rng)?;

    // STEP 5: Comparison
    let comparisons = compare_metrics(
        &community.plot_ids,
        data.covariates.elevation(),
        &observed_metrics,
        &corrected_metrics,
        &observed_standardized,
        &corrected_standardized,
        config.relevance.elevation_span,
    );
    for comparison in &comparisons {
        tracing::info!(
            "  {:<16} threshold {:>10} relevant plots {}/{}",
            comparison.metric,
            comparison.threshold.map_or("undefined".to_string(), |t| format!("{:.4}", t)),
            comparison.n_relevant(),
            comparison.rows.len()
        );
    }
    tracing::info!("Pipeline complete in {:.2}s", total_start.elapsed().as_secs_f64());

    Ok(PipelineReport {
        config_fingerprint: config.fingerprint(),
        batch_from_checkpoint,
        batch,
        species_ids: community.species_ids,
        dropped_species: community.dropped,
        z: community.z,
        observed_metrics,
        corrected_metrics,
        observed_standardized,
        corrected_standardized,
        comparisons,
    })
}
