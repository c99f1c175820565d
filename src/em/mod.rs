//! Mixture fitting over many components.
//!
//! - membership probabilities and mixture likelihoods (`membership`)
//! - BIC scoring and split selection (`selection`)
//! - EM for a fixed component count (`expectmax`)
//! - the split-and-score search over component counts (`controller`)

pub mod controller;
pub mod expectmax;
pub mod membership;
pub mod selection;

pub use controller::{EmController, EmOutcome, EmState, ScoreRecord, Termination, run_em};
pub use expectmax::{EmInit, MixtureFit, fit_many_components};
pub use membership::{
    Expectation, estimate_membership, expectation, ln_overlap_matrix, mixture_ln_likelihood, mixture_ln_posterior,
};
pub use selection::{bic, improves, n_free_params, select_lowest};
