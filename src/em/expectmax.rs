//! Expectation-maximisation for a fixed number of components.
//!
//! Alternates:
//!
//! 1. M-step: fit each component to the data weighted by its membership column
//! 2. E-step: recompute memberships from the new components
//!
//! until no membership entry moves by more than `membership_tol`, or the
//! iteration cap / time budget is hit (reported as `converged = false`).
//!
//! A recoverable E-step failure after the first iteration ends the run with the
//! previous iteration's mixture, flagged `degraded`.

use tracing::{debug, info, warn};

use crate::data::Dataset;
use crate::domain::{Budget, EmConfig, FitConfig, MembershipWeights};
use crate::em::controller::EmState;
use crate::em::membership::{expectation, mixture_ln_likelihood, mixture_ln_posterior};
use crate::em::selection::bic;
use crate::error::FitError;
use crate::fit::{ComponentFit, ComponentProblem, FitStart, derive_seed, fit_component};
use crate::models::{Component, TraceOrbit};

/// How a fixed-k run is seeded.
#[derive(Debug, Clone)]
pub enum EmInit {
    /// Start with an M-step on these memberships.
    Memberships(MembershipWeights),
    /// Start with an (unweighted) E-step from these components.
    Components(Vec<Component>),
}

/// A fitted mixture with a fixed number of components.
#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub fits: Vec<ComponentFit>,
    pub memberships: MembershipWeights,
    pub ln_likelihood: f64,
    pub ln_posterior: f64,
    pub bic: f64,
    /// Completed EM iterations.
    pub iterations: usize,
    pub converged: bool,
    /// The last iteration failed and the mixture from the one before was kept.
    pub degraded: bool,
    /// States visited, in order.
    pub states: Vec<EmState>,
}

impl MixtureFit {
    pub fn n_components(&self) -> usize {
        self.fits.len()
    }

    pub fn components(&self) -> Vec<Component> {
        self.fits.iter().map(|f| f.component.clone()).collect()
    }
}

/// Run EM for a fixed component count.
///
/// `context` distinguishes independent runs (for example, different trial
/// splits) so that each gets its own random streams.
pub fn fit_many_components(
    dataset: &Dataset,
    init: EmInit,
    orbit: &dyn TraceOrbit,
    config: &EmConfig,
    budget: &Budget,
    context: u64,
) -> Result<MixtureFit, FitError> {
    let background = config.background;
    let has_bg = background.is_enabled();
    let mut states = Vec::new();

    let (mut memberships, starts) = match init {
        EmInit::Memberships(m) => {
            if m.n_stars() != dataset.len() || m.has_background() != has_bg || m.n_components() == 0 {
                return Err(FitError::config(format!(
                    "Initial memberships are {}×{} (background: {}), dataset has {} stars (background: {has_bg}).",
                    m.n_stars(),
                    m.n_columns(),
                    m.has_background(),
                    dataset.len()
                )));
            }
            let k = m.n_components();
            (m, vec![FitStart::Cold; k])
        }
        EmInit::Components(comps) => {
            if comps.is_empty() {
                return Err(FitError::config("At least one initial component is required."));
            }
            if comps.iter().any(|c| c.kind() != config.fit.component) {
                return Err(FitError::config("Initial components must match the configured component kind."));
            }
            states.push(EmState::EstimatingMembership);
            let m = expectation(dataset, &comps, orbit, background, None)?.memberships;
            let starts = comps.iter().map(|c| FitStart::Params(c.internal().to_vec())).collect();
            (m, starts)
        }
    };

    let k = memberships.n_components();
    let mut fits: Vec<Option<ComponentFit>> = vec![None; k];
    let mut fitted_on: Vec<Option<Vec<f64>>> = vec![None; k];
    let mut amplitudes: Option<Vec<f64>> = None;
    let mut ln_likelihood = f64::NEG_INFINITY;
    let mut converged = false;
    let mut degraded = false;
    let mut iterations = 0;

    while iterations < config.max_em_iterations {
        if iterations > 0 && budget.expired() {
            warn!(iterations, n_components = k, "time budget exhausted during EM");
            break;
        }
        let previous_fits = (iterations > 0).then(|| fits.clone());
        iterations += 1;

        states.push(EmState::FittingComponents);
        for j in 0..k {
            let weights = memberships.column(j);
            if config.ignore_stable_components && fits[j].is_some() {
                let change = fitted_on[j]
                    .as_ref()
                    .map_or(f64::INFINITY, |prev| max_abs_diff(prev, &weights));
                if change < config.membership_tol {
                    debug!(component = j, change, "membership stable; keeping previous fit");
                    continue;
                }
            }

            let start = match &fits[j] {
                Some(prev) => match prev.final_positions() {
                    Some(positions) => FitStart::Positions(positions),
                    None => FitStart::Params(prev.component.internal().to_vec()),
                },
                None => starts[j].clone(),
            };
            let fit_config = FitConfig {
                seed: derive_seed(config.fit.seed, &[context, iterations as u64, j as u64]),
                ..config.fit.clone()
            };
            let problem = ComponentProblem {
                dataset,
                weights: &weights,
                orbit,
                background,
            };

            match fit_component(&problem, start, &fit_config, budget) {
                Ok(fit) => {
                    fits[j] = Some(fit);
                    fitted_on[j] = Some(weights);
                }
                Err(e) if e.is_recoverable() && fits[j].is_some() => {
                    warn!(component = j, error = %e, "component refit failed; keeping previous fit");
                }
                Err(e) => return Err(e),
            }
        }

        let components: Vec<Component> = fits.iter().flatten().map(|f| f.component.clone()).collect();

        states.push(EmState::EstimatingMembership);
        let fractions = memberships.component_fractions();
        let e = match expectation(dataset, &components, orbit, background, amplitudes.as_deref()) {
            Ok(e) => e,
            Err(err) if err.is_recoverable() && previous_fits.is_some() => {
                warn!(
                    iteration = iterations,
                    n_components = k,
                    error = %err,
                    "membership update failed; keeping the previous mixture"
                );
                fits = previous_fits.unwrap_or_default();
                iterations -= 1;
                degraded = true;
                break;
            }
            Err(err) => return Err(err),
        };
        // First-pass memberships are unweighted; the score always uses amplitudes.
        ln_likelihood = match amplitudes {
            Some(_) => e.ln_likelihood,
            None => mixture_ln_likelihood(dataset, &components, orbit, background, &fractions)?,
        };

        states.push(EmState::EvaluatingConvergence);
        let change = memberships.max_abs_diff(&e.memberships);
        info!(
            iteration = iterations,
            n_components = k,
            membership_change = change,
            ln_likelihood,
            "EM iteration finished"
        );

        amplitudes = Some(e.memberships.component_fractions());
        memberships = e.memberships;

        if change < config.membership_tol {
            converged = true;
            break;
        }
    }

    let fits: Vec<ComponentFit> = fits.into_iter().flatten().collect();
    if fits.len() != k {
        return Err(FitError::FitFailed(format!(
            "Only {} of {k} components were fitted before the run stopped.",
            fits.len()
        )));
    }
    if !converged && !degraded {
        warn!(iterations, n_components = k, "EM stopped before memberships settled");
    }

    let components: Vec<Component> = fits.iter().map(|f| f.component.clone()).collect();
    let ln_posterior = mixture_ln_posterior(ln_likelihood, &components, &config.fit.prior);
    let score = bic(ln_likelihood, k, config.fit.component, dataset.len());

    Ok(MixtureFit {
        fits,
        memberships,
        ln_likelihood,
        ln_posterior,
        bic: score,
        iterations,
        converged,
        degraded,
        states,
    })
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackgroundMode, ComponentKind, OptimizerKind, StarMeasurement};
    use crate::models::IdentityOrbit;
    use nalgebra::{DMatrix, Matrix6, Vector6};
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn two_blobs() -> Dataset {
        let mut rng = StdRng::seed_from_u64(21);
        let pos = Normal::new(0.0, 4.0).unwrap();
        let vel = Normal::new(0.0, 1.0).unwrap();
        let mut stars = Vec::new();
        for offset in [-60.0, 60.0] {
            for _ in 0..30 {
                let mut mean = Vector6::zeros();
                for i in 0..3 {
                    mean[i] = pos.sample(&mut rng);
                    mean[i + 3] = vel.sample(&mut rng);
                }
                mean[0] += offset;
                stars.push(StarMeasurement {
                    mean,
                    cov: Matrix6::identity() * 0.05,
                    bg_ln_overlap: None,
                });
            }
        }
        Dataset::new(stars).unwrap()
    }

    fn quick_config() -> EmConfig {
        EmConfig {
            fit: FitConfig {
                strategy: OptimizerKind::NelderMead,
                optimizer_starts: 2,
                optimizer_max_iters: 300,
                seed: 5,
                ..FitConfig::default()
            },
            max_em_iterations: 8,
            ..EmConfig::default()
        }
    }

    fn sphere_at(x: f64) -> Component {
        Component::from_external(ComponentKind::Sphere, &[x, 0.0, 0.0, 0.0, 0.0, 0.0, 8.0, 1.5, 1.0]).unwrap()
    }

    #[test]
    fn two_seeded_components_separate_the_blobs() {
        let ds = two_blobs();
        let config = quick_config();
        let fit = fit_many_components(
            &ds,
            EmInit::Components(vec![sphere_at(-40.0), sphere_at(40.0)]),
            &IdentityOrbit,
            &config,
            &Budget::unlimited(),
            0,
        )
        .unwrap();

        assert_eq!(fit.n_components(), 2);
        assert!(fit.ln_likelihood.is_finite());
        for i in 0..30 {
            assert_eq!(fit.memberships.dominant(i), 0);
            assert_eq!(fit.memberships.dominant(i + 30), 1);
        }
        assert_eq!(fit.states[0], EmState::EstimatingMembership);
        assert!(fit.states.contains(&EmState::EvaluatingConvergence));
    }

    #[test]
    fn single_component_from_initial_memberships() {
        let ds = two_blobs();
        let mut config = quick_config();
        config.background = BackgroundMode::ConstantDensity { density: 1e-12 };
        let init = MembershipWeights::initial(ds.len(), 1, true);
        let fit = fit_many_components(&ds, EmInit::Memberships(init), &IdentityOrbit, &config, &Budget::unlimited(), 0)
            .unwrap();
        assert_eq!(fit.n_components(), 1);
        assert_eq!(fit.memberships.n_columns(), 2);
        assert!(fit.iterations >= 1);
        assert!(fit.bic.is_finite());
    }

    /// Identity motion for the first `healthy_calls` traces, NaN afterwards.
    struct FailingOrbit {
        calls: AtomicUsize,
        healthy_calls: usize,
    }

    impl FailingOrbit {
        fn new(healthy_calls: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                healthy_calls,
            }
        }
    }

    impl TraceOrbit for FailingOrbit {
        fn trace(&self, origin: &Vector6<f64>, _age: f64) -> Vector6<f64> {
            if self.calls.fetch_add(1, Ordering::Relaxed) < self.healthy_calls {
                *origin
            } else {
                Vector6::from_element(f64::NAN)
            }
        }
    }

    fn half_and_half(n: usize) -> MembershipWeights {
        let mut probs = DMatrix::zeros(n, 2);
        for i in 0..n {
            let first = if i < n / 2 { 0.9 } else { 0.1 };
            probs[(i, 0)] = first;
            probs[(i, 1)] = 1.0 - first;
        }
        MembershipWeights::from_matrix(probs, 2, false).unwrap()
    }

    #[test]
    fn failed_membership_update_keeps_previous_mixture() {
        let ds = two_blobs();
        let mut config = quick_config();
        config.membership_tol = 1e-12;

        config.max_em_iterations = 1;
        let counting = FailingOrbit::new(usize::MAX);
        let first = fit_many_components(
            &ds,
            EmInit::Memberships(half_and_half(ds.len())),
            &counting,
            &config,
            &Budget::unlimited(),
            0,
        )
        .unwrap();
        let calls_in_first_iteration = counting.calls.load(Ordering::Relaxed);
        assert!(!first.degraded);

        config.max_em_iterations = 3;
        let failing = FailingOrbit::new(calls_in_first_iteration);
        let fit = fit_many_components(
            &ds,
            EmInit::Memberships(half_and_half(ds.len())),
            &failing,
            &config,
            &Budget::unlimited(),
            0,
        )
        .unwrap();

        assert!(fit.degraded);
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 1);
        assert_eq!(fit.n_components(), 2);
        assert_eq!(fit.components(), first.components());
        assert!(approx::relative_eq!(fit.ln_likelihood, first.ln_likelihood, max_relative = 1e-12));
        assert_eq!(fit.memberships.to_rows(), first.memberships.to_rows());
    }

    #[test]
    fn failed_first_membership_update_is_an_error() {
        let ds = two_blobs();
        let config = quick_config();
        let err = fit_many_components(
            &ds,
            EmInit::Components(vec![sphere_at(-40.0), sphere_at(40.0)]),
            &FailingOrbit::new(0),
            &config,
            &Budget::unlimited(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::DegenerateMembership { .. }));
    }

    #[test]
    fn mismatched_memberships_are_rejected() {
        let ds = two_blobs();
        let config = quick_config();
        let init = MembershipWeights::initial(ds.len(), 1, true);
        let err = fit_many_components(&ds, EmInit::Memberships(init), &IdentityOrbit, &config, &Budget::unlimited(), 0)
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
