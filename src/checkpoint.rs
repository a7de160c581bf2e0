//! Batch checkpoints
//!
//! The batch fit is the expensive step. Its output is written as JSON next
//! to the config fingerprint and a digest of the survey it was fitted on.
//! On load, a different fingerprint or digest is a miss: the checkpoint is
//! reported and ignored, never reused.

use crate::batch::BatchOutput;
use crate::config::PipelineConfig;
use crate::data::{SurveyData, N_VISITS};
use crate::errors::PipelineResult;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

const CHECKPOINT_FILE: &str = "batch_checkpoint.json";

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    fingerprint: String,
    data_digest: String,
    batch: BatchOutput,
}

fn write_str(hasher: &mut FxHasher, value: &str) {
    hasher.write_u64(value.len() as u64);
    hasher.write(value.as_bytes());
}

fn write_ids(hasher: &mut FxHasher, ids: &[String]) {
    hasher.write_u64(ids.len() as u64);
    for id in ids {
        write_str(hasher, id);
    }
}

/// Digest of everything in the survey that the fit reads.
///
/// Only explicit bytes go into the hasher (lengths, UTF-8, `f64::to_bits`
/// and one tag byte per optional value), so the digest does not depend on
/// std `Hash` impls.
pub fn data_digest(data: &SurveyData) -> String {
    let mut hasher = FxHasher::default();
    write_ids(&mut hasher, data.survey.plot_ids());
    write_ids(&mut hasher, data.survey.species_ids());
    for i in 0..data.survey.n_plots() {
        for k in 0..data.survey.n_species() {
            for j in 0..N_VISITS {
                hasher.write_u8(match data.survey.detection(i, k, j) {
                    None => 0,
                    Some(false) => 1,
                    Some(true) => 2,
                });
            }
        }
        hasher.write_u64(data.covariates.elevation()[i].to_bits());
        for j in 0..N_VISITS {
            match data.covariates.date(i, j) {
                Some(date) => {
                    hasher.write_u8(1);
                    hasher.write_u64(date.to_bits());
                }
                None => hasher.write_u8(0),
            }
        }
    }
    format!("{:016x}", hasher.finish())
}

pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

/// Write the batch output under `dir`.
pub fn save(dir: &Path, config: &PipelineConfig, data: &SurveyData, batch: &BatchOutput) -> PipelineResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir);
    let checkpoint = Checkpoint {
        fingerprint: config.fingerprint(),
        data_digest: data_digest(data),
        batch: batch.clone(),
    };
    fs::write(&path, serde_json::to_string(&checkpoint)?)?;
    tracing::info!("Checkpoint saved: {}", path.display());
    Ok(path)
}

/// Load a checkpoint if one exists and matches `config` and `data`.
pub fn load(dir: &Path, config: &PipelineConfig, data: &SurveyData) -> PipelineResult<Option<BatchOutput>> {
    let path = checkpoint_path(dir);
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)?;
    let checkpoint: Checkpoint = match serde_json::from_str(&contents) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            tracing::warn!("Unreadable checkpoint {} ({}); refitting", path.display(), e);
            return Ok(None);
        }
    };

    let fingerprint = config.fingerprint();
    if checkpoint.fingerprint != fingerprint {
        tracing::warn!(
            "Stale checkpoint {} (fingerprint {} != {}); refitting",
            path.display(),
            checkpoint.fingerprint,
            fingerprint
        );
        return Ok(None);
    }
    if checkpoint.data_digest != data_digest(data) {
        tracing::warn!("Checkpoint {} was fitted on different survey data; refitting", path.display());
        return Ok(None);
    }

    tracing::info!("Checkpoint loaded: {}", path.display());
    Ok(Some(checkpoint.batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::UnitOutcome;
    use crate::data::{PlotCovariates, SurveyArray};
    use crate::utils::normalization::CovariateScaling;
    use ndarray::{array, Array3};

    fn data(flip: bool) -> SurveyData {
        let mut detections = Array3::from_elem((2, 1, 2), Some(false));
        detections[[0, 0, 0]] = Some(true);
        if flip {
            detections[[1, 0, 1]] = Some(true);
        }
        let survey = SurveyArray::new(vec!["p0".into(), "p1".into()], vec!["s0".into()], detections).unwrap();
        let covariates = PlotCovariates::new(vec![1000.0, 1200.0], array![[Some(150.0), Some(190.0)], [Some(151.0), Some(191.0)]]).unwrap();
        SurveyData::new(survey, covariates).unwrap()
    }

    fn batch() -> BatchOutput {
        BatchOutput {
            plot_ids: vec!["p0".into(), "p1".into()],
            species_ids: vec!["s0".into()],
            p: vec![None],
            z: ndarray::Array2::from_elem((2, 1), None),
            outcomes: vec![UnitOutcome::Skipped { detections: 1 }],
            scaling: CovariateScaling {
                elevation_center: 1100.0,
                elevation_scale: 1000.0,
                date_center: 170.5,
                date_scale: 100.0,
            },
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("detection_fd_checkpoint_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_round_trip_when_matching() {
        let dir = temp_dir("match");
        let config = PipelineConfig::default();
        save(&dir, &config, &data(false), &batch()).unwrap();

        let loaded = load(&dir, &config, &data(false)).unwrap().unwrap();
        assert_eq!(loaded.species_ids, vec!["s0".to_string()]);
        assert_eq!(loaded.outcomes, batch().outcomes);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_or_data_change_is_a_miss() {
        let dir = temp_dir("stale");
        let config = PipelineConfig::default();
        save(&dir, &config, &data(false), &batch()).unwrap();

        let mut other = config.clone();
        other.occupancy.ridge_penalty = 1.0;
        assert!(load(&dir, &other, &data(false)).unwrap().is_none());
        assert!(load(&dir, &config, &data(true)).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_checkpoint_is_a_miss() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(checkpoint_path(&dir), "{\"fingerprint\": \"x\", \"batch\": [1, 2").unwrap();
        assert!(load(&dir, &PipelineConfig::default(), &data(false)).unwrap().is_none());

        // Valid JSON with an older layout
        fs::write(checkpoint_path(&dir), r#"{"fingerprint": "x", "data_digest": "y"}"#).unwrap();
        assert!(load(&dir, &PipelineConfig::default(), &data(false)).unwrap().is_none());

        // A fresh save over the bad file is picked up again
        save(&dir, &PipelineConfig::default(), &data(false), &batch()).unwrap();
        assert!(load(&dir, &PipelineConfig::default(), &data(false)).unwrap().is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_digest_is_pinned_to_explicit_bytes() {
        // Recompute the digest by hand from the documented byte layout.
        let mut hasher = FxHasher::default();
        for ids in [vec!["p0", "p1"], vec!["s0"]] {
            hasher.write_u64(ids.len() as u64);
            for id in ids {
                hasher.write_u64(id.len() as u64);
                hasher.write(id.as_bytes());
            }
        }
        let plots = [(1000.0f64, [150.0f64, 190.0], [2u8, 1]), (1200.0, [151.0, 191.0], [1, 1])];
        for (elevation, dates, detections) in plots {
            for d in detections {
                hasher.write_u8(d);
            }
            hasher.write_u64(elevation.to_bits());
            for date in dates {
                hasher.write_u8(1);
                hasher.write_u64(date.to_bits());
            }
        }
        assert_eq!(data_digest(&data(false)), format!("{:016x}", hasher.finish()));
        assert_ne!(data_digest(&data(false)), data_digest(&data(true)));
    }

    #[test]
    fn test_missing_checkpoint_is_a_miss() {
        let dir = temp_dir("missing");
        assert!(load(&dir, &PipelineConfig::default(), &data(false)).unwrap().is_none());
    }
}
