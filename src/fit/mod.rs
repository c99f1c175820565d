//! Single-component fitting.
//!
//! Responsibilities:
//!
//! - evaluate the log-posterior of one component (`posterior`)
//! - sample it with an ensemble MCMC and judge burn-in (`sampler`, `burnin`)
//! - or optimise it from several starts (`optimizer`)
//! - reduce the result to a best component and a percentile table (`summary`)

pub mod burnin;
pub mod fitter;
pub mod optimizer;
pub mod posterior;
pub mod sampler;
pub mod summary;

pub use fitter::*;
pub use posterior::{ComponentPosterior, DegeneracyStats, LikelihoodTerms, LogProbability, ln_prior};
pub use sampler::{Chain, EnsembleSampler, WalkerTrace};
pub use summary::{BestSample, best_sample, median_and_span};
