//! Single-component fitting.
//!
//! Given a dataset, per-star membership weights and an orbit tracer, find the
//! component parameters that maximise the log-posterior. Two strategies share
//! the same posterior and parameter encoding:
//!
//! - `Mcmc`: ensemble sampling, repeated burn-in until the mean log-probability
//!   stops drifting and no walker is stuck, then an optional sampling stage
//! - `NelderMead`: deterministic local optimisation from several starts
//!
//! Hitting an iteration or time cap is not an error: the best sample so far is
//! returned with `FitStatus::NotConverged`.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

use crate::data::Dataset;
use crate::domain::{BackgroundMode, Budget, FitConfig, FitStatus, MedianSpan, OptimizerKind};
use crate::error::FitError;
use crate::fit::burnin::{burnin_converged, reset_walkers, stuck_walkers};
use crate::fit::optimizer::{best_run, multistart_nelder_mead};
use crate::fit::posterior::{ComponentPosterior, DegeneracyStats, LogProbability};
use crate::fit::sampler::{Chain, EnsembleSampler};
use crate::fit::summary::{BestSample, best_sample, median_and_span};
use crate::models::{Component, TraceOrbit};

/// Everything a component fit reads but never modifies.
#[derive(Clone, Copy)]
pub struct ComponentProblem<'a> {
    pub dataset: &'a Dataset,
    /// Membership weight of each star in this component.
    pub weights: &'a [f64],
    pub orbit: &'a dyn TraceOrbit,
    pub background: BackgroundMode,
}

/// Where the walkers (or optimizer starts) begin.
#[derive(Debug, Clone)]
pub enum FitStart {
    /// Weighted mean/covariance of the data, clamped to valid parameters.
    Cold,
    /// Internal-space parameters to scatter a ball around.
    Params(Vec<f64>),
    /// Explicit internal-space walker positions (one per walker).
    Positions(Vec<Vec<f64>>),
}

/// Result of fitting one component.
#[derive(Debug, Clone)]
pub struct ComponentFit {
    /// Highest-probability sample seen across every chain.
    pub component: Component,
    pub ln_prob: f64,
    /// Per-parameter median and span in external units.
    pub med_span: Vec<MedianSpan>,
    /// Final chain (MCMC only).
    pub chain: Option<Chain>,
    pub status: FitStatus,
    /// Burn-in iterations (MCMC) or optimizer iterations of the best start.
    pub iterations: usize,
    pub acceptance_fraction: Option<f64>,
}

impl ComponentFit {
    /// Final walker positions, for warm-starting the next fit.
    pub fn final_positions(&self) -> Option<Vec<Vec<f64>>> {
        self.chain.as_ref().map(Chain::final_positions)
    }
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// One SplitMix64 step from `state`.
fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministic seed derived from a base seed and context indices.
///
/// The mixing is fixed, so seeds are identical across platforms and toolchains.
pub fn derive_seed(base: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(splitmix64(base), |acc, &p| splitmix64(acc ^ p))
}

/// Fit one component to the weighted dataset.
pub fn fit_component(
    problem: &ComponentProblem<'_>,
    start: FitStart,
    config: &FitConfig,
    budget: &Budget,
) -> Result<ComponentFit, FitError> {
    config.validate()?;
    let posterior = ComponentPosterior::new(
        problem.dataset,
        problem.weights,
        problem.orbit,
        problem.background,
        config,
    )?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let (positions, lnprob) = match initial_ensemble(problem, &posterior, start, config, &mut rng) {
        Ok(init) => init,
        Err(FitError::InfeasibleInitialization { .. }) if posterior.degeneracy().dominates() => {
            return Err(degenerate_failure(posterior.degeneracy()));
        }
        Err(e) => return Err(e),
    };

    let fit = match config.strategy {
        OptimizerKind::Mcmc => run_mcmc(&posterior, positions, lnprob, config, budget, &mut rng),
        OptimizerKind::NelderMead => run_nelder_mead(&posterior, &positions, &lnprob, config),
    };
    check_degeneracy(posterior.degeneracy())?;
    fit
}

/// Warn about skipped degenerate overlaps; fail when they dominated the fit.
fn check_degeneracy(stats: DegeneracyStats) -> Result<(), FitError> {
    if stats.degenerate_overlaps > 0 {
        warn!(
            evaluations = stats.evaluations,
            dominated = stats.dominated_evaluations,
            degenerate_overlaps = stats.degenerate_overlaps,
            "degenerate star overlaps were skipped"
        );
    }
    if stats.dominates() {
        return Err(degenerate_failure(stats));
    }
    Ok(())
}

fn degenerate_failure(stats: DegeneracyStats) -> FitError {
    FitError::FitFailed(format!(
        "Degenerate star covariances dominated {} of {} likelihood evaluations.",
        stats.dominated_evaluations, stats.evaluations
    ))
}

/// Cheap starting point: weighted moments of the star means.
pub fn cold_start(dataset: &Dataset, weights: &[f64], config: &FitConfig) -> Component {
    let moments = dataset
        .weighted_mean_cov(weights)
        .or_else(|| dataset.weighted_mean_cov(&vec![1.0; dataset.len()]));
    match moments {
        Some((mean, cov)) => Component::from_mean_cov(config.component, &mean, &cov, 0.0, &config.prior),
        None => Component::from_mean_cov(
            config.component,
            &nalgebra::Vector6::zeros(),
            &nalgebra::Matrix6::zeros(),
            0.0,
            &config.prior,
        ),
    }
}

fn initial_ensemble(
    problem: &ComponentProblem<'_>,
    posterior: &ComponentPosterior<'_>,
    start: FitStart,
    config: &FitConfig,
    rng: &mut StdRng,
) -> Result<(Vec<Vec<f64>>, Vec<f64>), FitError> {
    let n_params = config.component.param_count();
    let n_walkers = config.n_walkers();

    let centre = match start {
        FitStart::Positions(positions) => {
            if positions.len() != n_walkers || positions.iter().any(|p| p.len() != n_params) {
                return Err(FitError::config(format!(
                    "Expected {n_walkers} initial positions of {n_params} parameters."
                )));
            }
            let lnprob: Vec<f64> = positions.iter().map(|p| posterior.ln_prob(p)).collect();
            if lnprob.iter().any(|lp| lp.is_finite()) {
                return Ok((positions, lnprob));
            }
            warn!("all supplied walker positions are infeasible; falling back to a cold start");
            cold_start(problem.dataset, problem.weights, config).internal().to_vec()
        }
        FitStart::Params(params) => {
            if params.len() != n_params {
                return Err(FitError::config(format!(
                    "Expected {n_params} starting parameters, got {}.",
                    params.len()
                )));
            }
            params
        }
        FitStart::Cold => cold_start(problem.dataset, problem.weights, config).internal().to_vec(),
    };

    let spread = config.component.sensible_walker_spread();
    let age_ix = config.component.age_index();
    let attempts = config.init_retries + 1;
    for attempt in 0..attempts {
        let mut positions = Vec::with_capacity(n_walkers);
        positions.push(centre.clone());
        while positions.len() < n_walkers {
            let mut p: Vec<f64> = centre
                .iter()
                .zip(&spread)
                .map(|(c, s)| c + s * rng.sample::<f64, _>(StandardNormal))
                .collect();
            p[age_ix] = p[age_ix].abs();
            positions.push(p);
        }

        let lnprob: Vec<f64> = positions.iter().map(|p| posterior.ln_prob(p)).collect();
        let feasible = lnprob.iter().filter(|lp| lp.is_finite()).count();
        if feasible > 0 {
            debug!(attempt, feasible, n_walkers, "initial ensemble drawn");
            return Ok((positions, lnprob));
        }
        debug!(attempt, "initial ensemble entirely infeasible; redrawing");
    }

    Err(FitError::InfeasibleInitialization {
        attempts,
        n_positions: n_walkers,
    })
}

fn run_mcmc(
    posterior: &ComponentPosterior<'_>,
    mut positions: Vec<Vec<f64>>,
    mut lnprob: Vec<f64>,
    config: &FitConfig,
    budget: &Budget,
    rng: &mut StdRng,
) -> Result<ComponentFit, FitError> {
    let kind = config.component;
    let sampler = EnsembleSampler::new(posterior, config.stretch_scale)?;

    let mut best: Option<BestSample> = None;
    let mut last_chain: Option<Chain> = None;
    let mut iterations = 0;
    let status;

    loop {
        if iterations > 0 && budget.expired() {
            warn!(iterations, "time budget exhausted during burn-in");
            status = FitStatus::NotConverged;
            break;
        }
        iterations += 1;

        let chain = sampler.run(positions, Some(lnprob), config.burnin_steps, rng)?;
        if let Some(b) = best_sample(chain.samples()) {
            best = Some(b.merge(best));
        }

        let traces = chain.lnprob_traces();
        let converged = burnin_converged(&traces, config.convergence_tol);
        let stuck = stuck_walkers(&traces, config.stuck_repeat_threshold);
        let n_stuck = stuck.iter().filter(|s| **s).count();
        info!(
            iteration = iterations,
            converged,
            stuck = n_stuck,
            best_lnprob = best.as_ref().map_or(f64::NEG_INFINITY, |b| b.ln_prob),
            acceptance = chain.acceptance_fraction(),
            "burn-in iteration finished"
        );

        positions = chain.final_positions();
        lnprob = chain.final_lnprob();
        last_chain = Some(chain);

        if converged && n_stuck == 0 {
            status = FitStatus::Converged;
            break;
        }
        if config.max_burnin_iterations.is_some_and(|cap| iterations >= cap) {
            warn!(iterations, "burn-in iteration cap reached without convergence");
            status = FitStatus::NotConverged;
            break;
        }

        let moved = reset_walkers(&mut positions, &mut lnprob, &stuck, config.reset_percentile);
        debug!(moved, "walkers reset to best position");
    }

    if let Some(steps) = config.sampling_steps {
        if budget.expired() {
            warn!("time budget exhausted before the sampling stage");
        } else {
            info!(steps, "running sampling stage");
            let chain = sampler.run(positions, Some(lnprob), steps, rng)?;
            if let Some(b) = best_sample(chain.samples()) {
                best = Some(b.merge(best));
            }
            last_chain = Some(chain);
        }
    }

    let best = best.ok_or_else(|| {
        FitError::FitFailed("No finite log-probability sample found during burn-in.".to_string())
    })?;
    let component = Component::from_internal(kind, best.params)?;

    let med_span = match last_chain.as_ref().map(|c| median_and_span(kind, c, config.percentile_span)) {
        Some(Ok(table)) => table,
        _ => component.external().into_iter().map(MedianSpan::point).collect(),
    };
    let acceptance_fraction = last_chain.as_ref().map(Chain::acceptance_fraction);

    Ok(ComponentFit {
        component,
        ln_prob: best.ln_prob,
        med_span,
        chain: last_chain,
        status,
        iterations,
        acceptance_fraction,
    })
}

fn run_nelder_mead(
    posterior: &ComponentPosterior<'_>,
    positions: &[Vec<f64>],
    lnprob: &[f64],
    config: &FitConfig,
) -> Result<ComponentFit, FitError> {
    let kind = config.component;

    let mut order: Vec<usize> = (0..positions.len()).filter(|&k| lnprob[k].is_finite()).collect();
    order.sort_by(|&a, &b| lnprob[b].total_cmp(&lnprob[a]).then(a.cmp(&b)));
    let starts: Vec<Vec<f64>> = order
        .into_iter()
        .take(config.optimizer_starts)
        .map(|k| positions[k].clone())
        .collect();

    let spread = kind.sensible_walker_spread();
    let runs = multistart_nelder_mead(
        posterior,
        &starts,
        &spread,
        config.optimizer_max_iters,
        config.optimizer_sd_tolerance,
    );
    let best = best_run(&runs)
        .ok_or_else(|| FitError::FitFailed("Every Nelder-Mead start failed.".to_string()))?;

    info!(
        starts = starts.len(),
        best_start = best.start_index,
        best_lnprob = best.ln_prob,
        iterations = best.iterations,
        "nelder-mead fit finished"
    );

    let component = Component::from_internal(kind, best.params.clone())?;
    let status = if best.iterations < config.optimizer_max_iters {
        FitStatus::Converged
    } else {
        FitStatus::NotConverged
    };

    Ok(ComponentFit {
        med_span: component.external().into_iter().map(MedianSpan::point).collect(),
        component,
        ln_prob: best.ln_prob,
        chain: None,
        status,
        iterations: best.iterations as usize,
        acceptance_fraction: None,
    })
}
