//! Deterministic multistart Nelder-Mead.
//!
//! Each start runs an independent `argmin` Nelder-Mead on the negated
//! log-probability. Starts are optimised in parallel and joined before the
//! best run is chosen. Infeasible points cost `+inf`, so the simplex simply
//! contracts away from them.

use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::neldermead::NelderMead;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::FitError;
use crate::fit::posterior::LogProbability;

/// `argmin` view of a log-probability: cost is `-ln p`.
struct NegLogProb<'a, P: LogProbability> {
    target: &'a P,
}

impl<P: LogProbability> CostFunction for NegLogProb<'_, P> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        let lp = self.target.ln_prob(theta);
        Ok(if lp.is_finite() { -lp } else { f64::INFINITY })
    }
}

/// Result of one Nelder-Mead start.
#[derive(Debug, Clone)]
pub struct OptimizerRun {
    pub start_index: usize,
    pub params: Vec<f64>,
    pub ln_prob: f64,
    pub iterations: u64,
}

/// Run Nelder-Mead from every start in parallel.
///
/// The initial simplex of a start `s` is `s` plus one vertex `s + spread[i]·eᵢ`
/// per dimension. Runs that error out are logged and dropped; the survivors are
/// returned in start order.
pub fn multistart_nelder_mead<P: LogProbability>(
    target: &P,
    starts: &[Vec<f64>],
    spread: &[f64],
    max_iters: u64,
    sd_tolerance: f64,
) -> Vec<OptimizerRun> {
    let results: Vec<Result<OptimizerRun, FitError>> = starts
        .par_iter()
        .enumerate()
        .map(|(idx, start)| run_single(target, idx, start, spread, max_iters, sd_tolerance))
        .collect();

    let mut runs = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(run) => runs.push(run),
            Err(e) => warn!(error = %e, "nelder-mead start failed"),
        }
    }
    debug!(starts = starts.len(), succeeded = runs.len(), "nelder-mead multistart finished");
    runs
}

/// Highest finite log-probability; ties go to the lower start index.
pub fn best_run(runs: &[OptimizerRun]) -> Option<&OptimizerRun> {
    let mut best: Option<&OptimizerRun> = None;
    for run in runs.iter().filter(|r| r.ln_prob.is_finite()) {
        best = match best {
            Some(b) if b.ln_prob > run.ln_prob => Some(b),
            Some(b) if b.ln_prob == run.ln_prob && b.start_index < run.start_index => Some(b),
            _ => Some(run),
        };
    }
    best
}

fn run_single<P: LogProbability>(
    target: &P,
    start_index: usize,
    start: &[f64],
    spread: &[f64],
    max_iters: u64,
    sd_tolerance: f64,
) -> Result<OptimizerRun, FitError> {
    if start.len() != spread.len() {
        return Err(FitError::config(format!(
            "Start has {} parameters but spread has {}.",
            start.len(),
            spread.len()
        )));
    }

    let mut simplex = Vec::with_capacity(start.len() + 1);
    simplex.push(start.to_vec());
    for (i, &step) in spread.iter().enumerate() {
        let mut vertex = start.to_vec();
        vertex[i] += if step != 0.0 { step } else { 1e-3 };
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex).with_sd_tolerance(sd_tolerance)?;
    let problem = NegLogProb { target };
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(max_iters))
        .run()?;

    let state = result.state();
    let params = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| FitError::Optimizer("Nelder-Mead returned no parameters.".to_string()))?;
    let cost = state.get_best_cost();
    let ln_prob = if cost.is_finite() { -cost } else { f64::NEG_INFINITY };

    Ok(OptimizerRun {
        start_index,
        params,
        ln_prob,
        iterations: state.get_iter(),
    })
}
