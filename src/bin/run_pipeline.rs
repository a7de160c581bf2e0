//! Detection-Corrected Functional Diversity Pipeline
//!
//! Inputs (from DATA_DIR):
//!   - detections.csv: plot, species, visit, detected
//!   - plots.csv: plot, elevation, date_1, date_2
//!   - traits.csv: species, sla, height, seed_mass (raw units, gaps allowed)
//!
//! Output: JSON report at OUTPUT_PATH
//!
//! Optional CONFIG_PATH points at a JSON config; missing fields use defaults.
//! Batch fits are checkpointed under `<output dir>/checkpoints` unless the
//! config names another directory.

use anyhow::{Context, Result};
use detection_fd_rust::{
    run_pipeline, MeanImputer, PipelineConfig, RawTraitTable, SurveyData, TraitImputer, TraitStandardization,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "detection_fd_rust=info,run_pipeline=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let output_path = std::env::var("OUTPUT_PATH").unwrap_or_else(|_| "output/pipeline_report.json".to_string());

    println!("\n{}", "=".repeat(80));
    println!("DETECTION-CORRECTED FUNCTIONAL DIVERSITY PIPELINE");
    println!("{}", "=".repeat(80));
    let total_start = Instant::now();

    let mut config = match std::env::var("CONFIG_PATH") {
        Ok(path) => PipelineConfig::load(Path::new(&path))?,
        Err(_) => PipelineConfig::default(),
    };
    if config.checkpoint_dir.is_none() {
        let output_dir = Path::new(&output_path).parent().unwrap_or_else(|| Path::new("."));
        config.checkpoint_dir = Some(output_dir.join("checkpoints"));
    }
    println!("\nConfig fingerprint: {}", config.fingerprint());

    // STEP 1: Traits (species order comes from the trait file)
    let data_dir = PathBuf::from(data_dir);
    let traits_path = data_dir.join("traits.csv");
    let raw_traits = RawTraitTable::load_csv(&traits_path.to_string_lossy())?;
    let log_traits = MeanImputer.impute(&raw_traits)?;
    let standardization = TraitStandardization::fit(&log_traits);
    let traits = standardization.standardize(raw_traits.species_ids.clone(), &log_traits)?;
    println!("Traits: {} species", traits.n_species());

    // STEP 2: Survey
    let survey = SurveyData::load_csv(
        &data_dir.join("detections.csv").to_string_lossy(),
        &data_dir.join("plots.csv").to_string_lossy(),
        traits.species_ids(),
    )?;

    // STEP 3: Run
    let mut rng = StdRng::seed_from_u64(config.seed);
    let report = run_pipeline(&survey, &traits, &config, &mut rng)?;

    println!("\n{}", "-".repeat(70));
    println!(
        "Species: {} fitted, {} failed, {} skipped",
        report.batch.n_fitted(),
        report.batch.n_failed(),
        report.batch.n_skipped()
    );
    println!("Usable species: {}", report.species_ids.len());
    for comparison in &report.comparisons {
        println!(
            "  {:<16} relevant plots: {}/{}",
            comparison.metric,
            comparison.n_relevant(),
            comparison.rows.len()
        );
    }

    // STEP 4: Write report
    let output = serde_json::json!({
        "trait_standardization": standardization,
        "report": report,
    });
    if let Some(parent) = Path::new(&output_path).parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    std::fs::write(&output_path, serde_json::to_string_pretty(&output)?)
        .with_context(|| format!("Failed to write report: {}", output_path))?;
    println!("\n✓ Saved: {}", output_path);
    println!("Total time: {:.1}s", total_start.elapsed().as_secs_f64());

    Ok(())
}
