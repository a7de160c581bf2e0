//! Pipeline configuration
//!
//! Loaded from JSON. Every field has a default, so a partial file (or none at
//! all) is valid. The fingerprint keys checkpoints: two configs share a
//! fingerprint only when every result-affecting field matches.

use crate::errors::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

/// Line search used inside L-BFGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSearcher {
    MoreThuente,
    HagerZhang,
}

/// How the average detection probability `Pi` is averaged over plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiMode {
    /// Mean over every plot, as if the species occurred everywhere.
    UniversalPresence,
    /// Mean over plots where the posterior mode says the species is present.
    ConditionalOnOccurrence,
}

/// Settings for the per-species occupancy fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    /// Species with fewer total detections are skipped before fitting.
    pub min_detections: usize,
    /// Elevation is centered then divided by this (metres).
    pub elevation_scale: f64,
    /// Survey date is centered then divided by this (days).
    pub date_scale: f64,
    /// Adds elevation, elevation×date and elevation×date² to the detection submodel.
    pub detection_elevation_interaction: bool,
    /// Ridge penalty on all logit coefficients. 0 gives the plain MLE.
    pub ridge_penalty: f64,
    pub max_iters: u64,
    pub tol_grad: f64,
    pub tol_cost: f64,
    pub lbfgs_mem: usize,
    pub line_searcher: LineSearcher,
    /// Extra attempts from jittered starting values after a failed fit.
    pub n_restarts: usize,
    /// Half-width of the uniform starting-value jitter (logit scale).
    pub restart_jitter: f64,
    pub pi_mode: PiMode,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            min_detections: 4,
            elevation_scale: 1000.0,
            date_scale: 100.0,
            detection_elevation_interaction: false,
            ridge_penalty: 0.01,
            max_iters: 1000,
            tol_grad: 1e-6,
            tol_cost: 1e-12,
            lbfgs_mem: 7,
            line_searcher: LineSearcher::MoreThuente,
            n_restarts: 2,
            restart_jitter: 1.0,
            pi_mode: PiMode::UniversalPresence,
        }
    }
}

/// Settings for the richness-preserving null model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullModelConfig {
    pub nsim: usize,
}

impl Default for NullModelConfig {
    fn default() -> Self {
        Self { nsim: 100 }
    }
}

/// Settings for the observed-vs-corrected relevance test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    /// Elevation span (m) over which the regression slope is projected.
    pub elevation_span: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self { elevation_span: 500.0 }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub occupancy: OccupancyConfig,
    pub null_model: NullModelConfig,
    pub relevance: RelevanceConfig,
    /// Seed for the RNG handed to the batch runner and null model.
    pub seed: u64,
    /// Worker threads for the batch fit; `None` uses all available cores.
    pub n_threads: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            occupancy: OccupancyConfig::default(),
            null_model: NullModelConfig::default(),
            relevance: RelevanceConfig::default(),
            seed: 42,
            n_threads: None,
            checkpoint_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| "Failed to parse config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the fit or the null model cannot work with.
    pub fn validate(&self) -> PipelineResult<()> {
        let occ = &self.occupancy;
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if !positive(occ.elevation_scale) || !positive(occ.date_scale) {
            return Err(PipelineError::InvalidConfig(
                "covariate scales must be finite and > 0".to_string(),
            ));
        }
        if !occ.ridge_penalty.is_finite() || occ.ridge_penalty < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "ridge_penalty must be finite and >= 0".to_string(),
            ));
        }
        if occ.max_iters == 0 || occ.lbfgs_mem == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_iters and lbfgs_mem must be > 0".to_string(),
            ));
        }
        if !positive(occ.tol_grad) || !positive(occ.tol_cost) {
            return Err(PipelineError::InvalidConfig(
                "optimizer tolerances must be finite and > 0".to_string(),
            ));
        }
        if !occ.restart_jitter.is_finite() || occ.restart_jitter < 0.0 {
            return Err(PipelineError::InvalidConfig(
                "restart_jitter must be finite and >= 0".to_string(),
            ));
        }
        if self.null_model.nsim < 2 {
            return Err(PipelineError::InvalidConfig(
                "null_model.nsim must be at least 2".to_string(),
            ));
        }
        if !positive(self.relevance.elevation_span) {
            return Err(PipelineError::InvalidConfig(
                "relevance.elevation_span must be finite and > 0".to_string(),
            ));
        }
        if self.n_threads == Some(0) {
            return Err(PipelineError::InvalidConfig("n_threads must be > 0".to_string()));
        }
        Ok(())
    }

    /// Identifier for checkpoints.
    ///
    /// Covers the crate version, the occupancy settings and the seed. Thread
    /// count and checkpoint location do not change results and are left out.
    pub fn fingerprint(&self) -> String {
        let mut hasher = rustc_hash::FxHasher::default();
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        hasher.write_u64(version.len() as u64);
        hasher.write(version);
        // Plain data: serialization does not fail.
        let occupancy = serde_json::to_vec(&self.occupancy).unwrap_or_default();
        hasher.write_u64(occupancy.len() as u64);
        hasher.write(&occupancy);
        hasher.write_u64(self.seed);
        format!("{}-{:016x}", env!("CARGO_PKG_VERSION"), hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "occupancy": { "min_detections": 6 }, "seed": 7 }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.occupancy.min_detections, 6);
        assert_eq!(config.occupancy.elevation_scale, 1000.0);
        assert_eq!(config.null_model.nsim, 100);
        assert_eq!(config.relevance.elevation_span, 500.0);
        assert_eq!(config.seed, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enum_fields_parse_snake_case() {
        let json = r#"{ "occupancy": { "pi_mode": "conditional_on_occurrence", "line_searcher": "hager_zhang" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.occupancy.pi_mode, PiMode::ConditionalOnOccurrence);
        assert_eq!(config.occupancy.line_searcher, LineSearcher::HagerZhang);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.null_model.nsim = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.occupancy.date_scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.n_threads = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_result_affecting_fields() {
        let base = PipelineConfig::default();

        let mut threads = base.clone();
        threads.n_threads = Some(3);
        assert_eq!(base.fingerprint(), threads.fingerprint());

        let mut ridge = base.clone();
        ridge.occupancy.ridge_penalty = 0.5;
        assert_ne!(base.fingerprint(), ridge.fingerprint());

        let mut seed = base.clone();
        seed.seed = 1;
        assert_ne!(base.fingerprint(), seed.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_pinned_to_explicit_bytes() {
        let config = PipelineConfig { seed: 9, ..PipelineConfig::default() };
        let mut hasher = rustc_hash::FxHasher::default();
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        hasher.write_u64(version.len() as u64);
        hasher.write(version);
        let occupancy = serde_json::to_vec(&config.occupancy).unwrap();
        hasher.write_u64(occupancy.len() as u64);
        hasher.write(&occupancy);
        hasher.write_u64(9);

        let expected = format!("{}-{:016x}", env!("CARGO_PKG_VERSION"), hasher.finish());
        assert_eq!(config.fingerprint(), expected);
    }
}
