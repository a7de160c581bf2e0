//! L-BFGS maximization of a log-likelihood via `argmin`.
//!
//! The maximization of `ℓ(θ)` is posed to `argmin` as the minimization of
//! `c(θ) = -ℓ(θ)`; the analytic gradient is negated to match.
//!
//! A run counts as converged only when `argmin` reports
//! `SolverConverged` or `TargetCostReached`. Hitting the iteration cap, an
//! internal solver error or a non-finite optimum is a `ConvergenceFailure`.

use crate::config::{LineSearcher, OccupancyConfig};
use crate::errors::ConvergenceFailure;
use argmin::core::{
    CostFunction, Error, Executor, Gradient, IterState, Solver, State, TerminationReason,
    TerminationStatus,
};
use argmin::solver::linesearch::{HagerZhangLineSearch, MoreThuenteLineSearch};
use argmin::solver::quasinewton::LBFGS;
use ndarray::Array1;

pub type Theta = Array1<f64>;
pub type Grad = Array1<f64>;
pub type Cost = f64;

pub type HagerZhangLS = HagerZhangLineSearch<Theta, Grad, Cost>;
pub type MoreThuenteLS = MoreThuenteLineSearch<Theta, Grad, Cost>;
pub type LbfgsHagerZhang = LBFGS<HagerZhangLS, Theta, Grad, Cost>;
pub type LbfgsMoreThuente = LBFGS<MoreThuenteLS, Theta, Grad, Cost>;

/// A log-likelihood with an analytic gradient.
pub trait LogLikelihood {
    type Data: 'static;

    fn value(&self, theta: &Theta, data: &Self::Data) -> Result<f64, ConvergenceFailure>;

    fn grad(&self, theta: &Theta, data: &Self::Data) -> Result<Grad, ConvergenceFailure>;
}

/// Exposes a `LogLikelihood` as an `argmin` cost/gradient problem.
#[derive(Debug, Clone)]
pub struct ArgMinAdapter<'a, F: LogLikelihood> {
    pub f: &'a F,
    pub data: &'a F::Data,
}

impl<'a, F: LogLikelihood> ArgMinAdapter<'a, F> {
    pub fn new(f: &'a F, data: &'a F::Data) -> Self {
        Self { f, data }
    }
}

impl<'a, F: LogLikelihood> CostFunction for ArgMinAdapter<'a, F> {
    type Param = Theta;
    type Output = Cost;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        let value = self.f.value(theta, self.data)?;
        if !value.is_finite() {
            return Err(ConvergenceFailure::NonFinite.into());
        }
        Ok(-value)
    }
}

impl<'a, F: LogLikelihood> Gradient for ArgMinAdapter<'a, F> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, Error> {
        let g = self.f.grad(theta, self.data)?;
        if g.len() != theta.len() || g.iter().any(|v| !v.is_finite()) {
            return Err(ConvergenceFailure::NonFinite.into());
        }
        Ok(-g)
    }
}

/// Result of one converged maximization.
#[derive(Debug, Clone)]
pub struct OptimOutcome {
    pub theta_hat: Theta,
    /// Maximized (penalized) log-likelihood.
    pub value: f64,
    pub iterations: u64,
    pub status: String,
}

// ============================================================================
// Solver construction
// ============================================================================

pub fn build_optimizer_hager_zhang(config: &OccupancyConfig) -> Result<LbfgsHagerZhang, Error> {
    let lbfgs = LbfgsHagerZhang::new(HagerZhangLS::new(), config.lbfgs_mem);
    configure_lbfgs(lbfgs, config)
}

pub fn build_optimizer_more_thuente(config: &OccupancyConfig) -> Result<LbfgsMoreThuente, Error> {
    let lbfgs = LbfgsMoreThuente::new(MoreThuenteLS::new(), config.lbfgs_mem);
    configure_lbfgs(lbfgs, config)
}

fn configure_lbfgs<L>(
    solver: LBFGS<L, Theta, Grad, Cost>,
    config: &OccupancyConfig,
) -> Result<LBFGS<L, Theta, Grad, Cost>, Error> {
    solver
        .with_tolerance_grad(config.tol_grad)?
        .with_tolerance_cost(config.tol_cost)
}

// ============================================================================
// Execution
// ============================================================================

/// Maximize `f` from `theta0` with the configured L-BFGS variant.
pub fn maximize<F: LogLikelihood>(
    f: &F,
    data: &F::Data,
    theta0: Theta,
    config: &OccupancyConfig,
) -> Result<OptimOutcome, ConvergenceFailure> {
    let problem = ArgMinAdapter::new(f, data);
    let run = match config.line_searcher {
        LineSearcher::MoreThuente => build_optimizer_more_thuente(config)
            .and_then(|solver| run_lbfgs(theta0, config.max_iters, problem, solver)),
        LineSearcher::HagerZhang => build_optimizer_hager_zhang(config)
            .and_then(|solver| run_lbfgs(theta0, config.max_iters, problem, solver)),
    };
    let state = run.map_err(|e| ConvergenceFailure::Optimizer(e.to_string()))?;
    check_outcome(state)
}

type LbfgsState = IterState<Theta, Grad, (), (), (), f64>;

fn run_lbfgs<'a, F, S>(
    theta0: Theta,
    max_iters: u64,
    problem: ArgMinAdapter<'a, F>,
    solver: S,
) -> Result<LbfgsState, Error>
where
    F: LogLikelihood,
    S: Solver<ArgMinAdapter<'a, F>, LbfgsState> + Send + 'static,
{
    let result = Executor::new(problem, solver)
        .configure(|state| state.param(theta0).max_iters(max_iters))
        .run()?;
    Ok(result.state().clone())
}

fn check_outcome(mut state: LbfgsState) -> Result<OptimOutcome, ConvergenceFailure> {
    let iterations = state.get_iter();
    let status = state.get_termination_status().clone();

    let converged = matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    );
    if !converged {
        return Err(ConvergenceFailure::NotConverged {
            status: format!("{:?}", status),
            iterations,
        });
    }

    let value = -state.get_best_cost();
    let theta_hat = state.take_best_param().ok_or(ConvergenceFailure::NonFinite)?;
    if !value.is_finite() || theta_hat.iter().any(|v| !v.is_finite()) {
        return Err(ConvergenceFailure::NonFinite);
    }

    Ok(OptimOutcome {
        theta_hat,
        value,
        iterations,
        status: format!("{:?}", status),
    })
}
