//! Component-count search around the fixed-k EM loop.
//!
//! Starting from one component (or supplied components), the controller:
//!
//! 1. fits the current mixture to convergence
//! 2. tries splitting every component in turn (trials run in parallel)
//! 3. keeps the lowest-BIC trial if it beats the current mixture
//!
//! and stops when no split improves the score, the component cap is reached,
//! every trial failed, or the time budget ran out. In every case the best
//! mixture found so far is returned.

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::Dataset;
use crate::domain::{Budget, EmConfig, MembershipWeights};
use crate::em::expectmax::{EmInit, MixtureFit, fit_many_components};
use crate::em::selection::{improves, select_lowest};
use crate::error::FitError;
use crate::models::{Component, TraceOrbit};

/// States of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmState {
    Initializing,
    FittingComponents,
    EstimatingMembership,
    EvaluatingConvergence,
    TrialSplitting,
    ScoringSplit,
    Converged,
    Failed,
}

/// Why the component search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The best split did not lower the BIC.
    NoImprovement,
    /// `max_components` reached.
    ComponentCap,
    /// Every trial split failed to fit.
    AllSplitsFailed,
    /// The wall-clock budget ran out.
    BudgetExhausted,
}

/// One scored mixture in the search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub n_components: usize,
    pub bic: f64,
    /// Component that was split to produce this mixture.
    pub split_of: Option<usize>,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct EmOutcome {
    pub best: MixtureFit,
    pub termination: Termination,
    pub history: Vec<ScoreRecord>,
    pub states: Vec<EmState>,
}

impl EmOutcome {
    pub fn n_components(&self) -> usize {
        self.best.n_components()
    }
}

/// Search over component counts.
pub struct EmController<'a> {
    dataset: &'a Dataset,
    orbit: &'a dyn TraceOrbit,
    config: EmConfig,
    states: Vec<EmState>,
}

impl<'a> EmController<'a> {
    pub fn new(dataset: &'a Dataset, orbit: &'a dyn TraceOrbit, config: EmConfig) -> Result<Self, FitError> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(FitError::data("Dataset has no stars."));
        }
        Ok(Self {
            dataset,
            orbit,
            config,
            states: Vec::new(),
        })
    }

    /// Run the full search.
    ///
    /// `initial` seeds the first mixture; `None` starts from a single
    /// component fitted to the whole (unweighted) dataset.
    pub fn run(mut self, initial: Option<Vec<Component>>) -> Result<EmOutcome, FitError> {
        let budget = Budget::from_secs(self.config.max_runtime_secs);
        self.enter(EmState::Initializing);

        let init = match initial {
            Some(comps) => {
                if comps.len() > self.config.max_components {
                    let err = FitError::config(format!(
                        "{} initial components exceed max_components = {}.",
                        comps.len(),
                        self.config.max_components
                    ));
                    return self.fail(err);
                }
                EmInit::Components(comps)
            }
            None => EmInit::Memberships(MembershipWeights::initial(
                self.dataset.len(),
                1,
                self.config.background.is_enabled(),
            )),
        };

        let mut current = match fit_many_components(self.dataset, init, self.orbit, &self.config, &budget, 0) {
            Ok(fit) => fit,
            Err(e) => return self.fail(e),
        };
        self.states.extend(current.states.iter().copied());

        let mut history = vec![ScoreRecord {
            n_components: current.n_components(),
            bic: current.bic,
            split_of: None,
            accepted: true,
        }];
        info!(n_components = current.n_components(), bic = current.bic, "initial mixture fitted");

        let termination = loop {
            let k = current.n_components();
            if k >= self.config.max_components {
                break Termination::ComponentCap;
            }
            if budget.expired() {
                warn!(n_components = k, "time budget exhausted; keeping current mixture");
                break Termination::BudgetExhausted;
            }

            self.enter(EmState::TrialSplitting);
            let trials: Vec<Result<MixtureFit, FitError>> = (0..k)
                .into_par_iter()
                .map(|i| self.trial_split(&current, i, &budget))
                .collect();
            // Sub-fit states follow TrialSplitting in split order.
            for fit in trials.iter().flatten() {
                self.states.extend(fit.states.iter().copied());
            }

            self.enter(EmState::ScoringSplit);
            let mut candidates: Vec<(usize, MixtureFit)> = Vec::with_capacity(k);
            for (i, trial) in trials.into_iter().enumerate() {
                match trial {
                    Ok(fit) => candidates.push((i, fit)),
                    Err(e) if e.is_recoverable() => {
                        warn!(split_of = i, error = %e, "trial split failed; skipping");
                    }
                    Err(e) => return self.fail(e),
                }
            }

            let scores: Vec<(usize, f64)> = candidates.iter().map(|(i, f)| (*i, f.bic)).collect();
            let Some((best_i, best_bic)) = select_lowest(&scores) else {
                warn!(n_components = k, "every trial split failed");
                break Termination::AllSplitsFailed;
            };

            let accepted = improves(best_bic, current.bic);
            for (i, f) in &candidates {
                history.push(ScoreRecord {
                    n_components: k + 1,
                    bic: f.bic,
                    split_of: Some(*i),
                    accepted: accepted && *i == best_i,
                });
            }
            info!(
                n_components = k,
                current_bic = current.bic,
                best_split = best_i,
                best_bic,
                accepted,
                "split trials scored"
            );

            if !accepted {
                break Termination::NoImprovement;
            }
            let Some(pos) = candidates.iter().position(|(i, _)| *i == best_i) else {
                break Termination::NoImprovement;
            };
            current = candidates.swap_remove(pos).1;
        };

        self.enter(EmState::Converged);
        info!(
            n_components = current.n_components(),
            bic = current.bic,
            ?termination,
            "component search finished"
        );

        Ok(EmOutcome {
            best: current,
            termination,
            history,
            states: self.states,
        })
    }

    /// Replace component `i` by its two-way split and refit the whole mixture.
    fn trial_split(&self, current: &MixtureFit, i: usize, budget: &Budget) -> Result<MixtureFit, FitError> {
        let fit = &current.fits[i];
        let age_ix = self.config.fit.component.age_index();
        let (lo_age, hi_age) = fit
            .med_span
            .get(age_ix)
            .map_or((fit.component.age(), fit.component.age()), |s| (s.lower, s.upper));

        let [a, b] = fit.component.split(lo_age, hi_age, &self.config.fit.prior);
        let mut comps = current.components();
        comps.splice(i..=i, [a, b]);

        let k = current.n_components() as u64;
        let context = (k << 32) | i as u64;
        fit_many_components(self.dataset, EmInit::Components(comps), self.orbit, &self.config, budget, context)
    }

    fn enter(&mut self, state: EmState) {
        tracing::debug!(?state, "entering state");
        self.states.push(state);
    }

    fn fail<T>(mut self, error: FitError) -> Result<T, FitError> {
        self.enter(EmState::Failed);
        warn!(error = %error, "component search failed");
        Err(error)
    }
}

/// Convenience wrapper around `EmController`.
pub fn run_em(
    dataset: &Dataset,
    orbit: &dyn TraceOrbit,
    config: &EmConfig,
    initial: Option<Vec<Component>>,
) -> Result<EmOutcome, FitError> {
    EmController::new(dataset, orbit, config.clone())?.run(initial)
}
