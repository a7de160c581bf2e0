//! Single-season occupancy likelihood
//!
//! Parameter layout (θ):
//! - `θ[0..3]`: occupancy submodel, `logit(ψ) = b0 + b1·e + b2·e²`
//! - `θ[3..6]`: detection submodel, `logit(p) = a0 + a1·d + a2·d²`
//! - `θ[6..9]`: optional elevation interaction, `+ a3·e + a4·e·d + a5·e·d²`
//!
//! `e` and `d` are the rescaled elevation and survey date. Per plot the
//! marginal likelihood is
//! - detected at least once: `ψ · Π_j p_j^y_j (1-p_j)^(1-y_j)`
//! - never detected: `ψ · Π_j (1-p_j) + (1-ψ)`
//!
//! with the product over visits that happened. Everything is evaluated on
//! the log scale.

use super::optimizer::{Grad, LogLikelihood, Theta};
use crate::data::{Detection, PlotCovariates, N_VISITS};
use crate::errors::ConvergenceFailure;
use crate::utils::normalization::CovariateScaling;
use ndarray::Array2;
use std::sync::Arc;

pub const N_OCC_PARAMS: usize = 3;
const N_DET_BASE: usize = 3;
const N_DET_INTERACTION: usize = 6;

// ============================================================================
// Numerics
// ============================================================================

/// `ln(1 + e^x)` without overflow.
pub fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    if m == f64::NEG_INFINITY {
        return m;
    }
    m + ((a - m).exp() + (b - m).exp()).ln()
}

// ============================================================================
// Design
// ============================================================================

/// Design rows shared by every species: one occupancy row per plot and one
/// detection row per (plot, visit), `None` for a visit that did not happen.
#[derive(Debug, Clone)]
pub struct OccupancyDesign {
    occ_rows: Vec<[f64; N_OCC_PARAMS]>,
    det_rows: Array2<Option<Vec<f64>>>,
    n_det: usize,
}

impl OccupancyDesign {
    pub fn new(covariates: &PlotCovariates, scaling: &CovariateScaling, interaction: bool) -> Self {
        let n_plots = covariates.n_plots();
        let n_det = if interaction { N_DET_INTERACTION } else { N_DET_BASE };

        let occ_rows = covariates
            .elevation()
            .iter()
            .map(|&raw| {
                let e = scaling.scale_elevation(raw);
                [1.0, e, e * e]
            })
            .collect();

        let det_rows = Array2::from_shape_fn((n_plots, N_VISITS), |(i, j)| {
            covariates.date(i, j).map(|raw| {
                let d = scaling.scale_date(raw);
                let mut row = vec![1.0, d, d * d];
                if interaction {
                    let e = scaling.scale_elevation(covariates.elevation()[i]);
                    row.extend([e, e * d, e * d * d]);
                }
                row
            })
        });

        Self { occ_rows, det_rows, n_det }
    }

    pub fn n_plots(&self) -> usize {
        self.occ_rows.len()
    }

    /// Total parameter count.
    pub fn n_params(&self) -> usize {
        N_OCC_PARAMS + self.n_det
    }

    pub fn occ_row(&self, plot: usize) -> &[f64] {
        &self.occ_rows[plot]
    }

    pub fn det_row(&self, plot: usize, visit: usize) -> Option<&[f64]> {
        self.det_rows[[plot, visit]].as_deref()
    }

    /// Occupancy linear predictor at a plot.
    pub fn eta_psi(&self, theta: &Theta, plot: usize) -> f64 {
        self.occ_row(plot)
            .iter()
            .enumerate()
            .map(|(c, x)| x * theta[c])
            .sum()
    }

    /// Detection linear predictor at a (plot, visit); `None` if not visited.
    pub fn eta_p(&self, theta: &Theta, plot: usize, visit: usize) -> Option<f64> {
        self.det_row(plot, visit).map(|row| {
            row.iter()
                .enumerate()
                .map(|(c, x)| x * theta[N_OCC_PARAMS + c])
                .sum()
        })
    }
}

/// One species' plot × visit history paired with the shared design.
#[derive(Debug, Clone)]
pub struct SpeciesHistory {
    pub design: Arc<OccupancyDesign>,
    pub history: Array2<Detection>,
}

/// Per-plot quantities shared by value, gradient and posterior.
struct PlotTerms {
    log_lik: f64,
    /// `P(z = 1 | history)`; 1 at a plot with any detection.
    posterior: f64,
    psi: f64,
}

impl SpeciesHistory {
    pub fn detected_at(&self, plot: usize) -> bool {
        (0..N_VISITS).any(|j| self.history[[plot, j]] == Some(true))
    }

    /// Visit outcome when the visit happened and has a design row.
    fn visit(&self, theta: &Theta, plot: usize, visit: usize) -> Option<(bool, f64)> {
        let y = self.history[[plot, visit]]?;
        let eta = self.design.eta_p(theta, plot, visit)?;
        Some((y, eta))
    }

    fn plot_terms(&self, theta: &Theta, plot: usize) -> PlotTerms {
        let eta_psi = self.design.eta_psi(theta, plot);
        let log_psi = -softplus(-eta_psi);
        let log_1m_psi = -softplus(eta_psi);
        let psi = sigmoid(eta_psi);

        if self.detected_at(plot) {
            let log_det: f64 = (0..N_VISITS)
                .filter_map(|j| self.visit(theta, plot, j))
                .map(|(y, eta)| if y { -softplus(-eta) } else { -softplus(eta) })
                .sum();
            PlotTerms { log_lik: log_psi + log_det, posterior: 1.0, psi }
        } else {
            // log Q: missed on every visit made
            let log_q: f64 = (0..N_VISITS)
                .filter_map(|j| self.visit(theta, plot, j))
                .map(|(_, eta)| -softplus(eta))
                .sum();
            let log_occupied = log_psi + log_q;
            let log_lik = log_sum_exp(log_occupied, log_1m_psi);
            PlotTerms {
                log_lik,
                posterior: (log_occupied - log_lik).exp(),
                psi,
            }
        }
    }

    /// Plot-level posterior `P(z = 1 | history)` for every plot.
    pub fn posterior(&self, theta: &Theta) -> Vec<f64> {
        (0..self.design.n_plots())
            .map(|i| self.plot_terms(theta, i).posterior)
            .collect()
    }
}

// ============================================================================
// Likelihood
// ============================================================================

/// Penalized marginal log-likelihood: `Σ_i ℓ_i(θ) − ½ λ ‖θ‖²`.
#[derive(Debug, Clone, Copy)]
pub struct OccupancyLikelihood {
    pub ridge_penalty: f64,
}

impl LogLikelihood for OccupancyLikelihood {
    type Data = SpeciesHistory;

    fn value(&self, theta: &Theta, data: &SpeciesHistory) -> Result<f64, ConvergenceFailure> {
        let log_lik: f64 = (0..data.design.n_plots())
            .map(|i| data.plot_terms(theta, i).log_lik)
            .sum();
        let total = log_lik - 0.5 * self.ridge_penalty * theta.dot(theta);

        if total.is_finite() {
            Ok(total)
        } else {
            Err(ConvergenceFailure::NonFinite)
        }
    }

    /// `∂ℓ/∂η_ψ = post − ψ`, `∂ℓ/∂η_p = post · (y − p)`; at an undetected
    /// plot every visit has `y = 0`.
    fn grad(&self, theta: &Theta, data: &SpeciesHistory) -> Result<Grad, ConvergenceFailure> {
        let mut g = theta.mapv(|t| -self.ridge_penalty * t);

        for i in 0..data.design.n_plots() {
            let terms = data.plot_terms(theta, i);

            let d_psi = terms.posterior - terms.psi;
            for (c, x) in data.design.occ_row(i).iter().enumerate() {
                g[c] += d_psi * x;
            }

            for j in 0..N_VISITS {
                let Some((y, eta)) = data.visit(theta, i, j) else { continue };
                let Some(row) = data.design.det_row(i, j) else { continue };
                let y = f64::from(u8::from(y));
                let d_eta = terms.posterior * (y - sigmoid(eta));
                for (c, x) in row.iter().enumerate() {
                    g[N_OCC_PARAMS + c] += d_eta * x;
                }
            }
        }

        if g.iter().all(|v| v.is_finite()) {
            Ok(g)
        } else {
            Err(ConvergenceFailure::NonFinite)
        }
    }
}
