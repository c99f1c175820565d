//! Expectation step: membership probabilities from fixed components.
//!
//! Every star is scored against every component (and the background, when
//! enabled) by its log-overlap. Rows are normalised with a log-sum-exp softmax,
//! so tiny overlaps never underflow to a 0/0 row.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::data::Dataset;
use crate::domain::{BackgroundMode, MembershipWeights, PriorConfig};
use crate::error::FitError;
use crate::fit::ln_prior;
use crate::math::{log_sum_exp, par_log_overlaps};
use crate::models::{Component, TraceOrbit};

/// Result of one expectation step.
#[derive(Debug, Clone)]
pub struct Expectation {
    pub memberships: MembershipWeights,
    /// `Σᵢ ln Σⱼ exp(lnolᵢⱼ)` over the same matrix that produced `memberships`.
    pub ln_likelihood: f64,
}

/// Log-overlap matrix, `n_stars × (n_components + background)`.
///
/// With `amplitudes`, `ln(amplitude)` is added to each component column. The
/// background column is never amplitude weighted.
pub fn ln_overlap_matrix(
    dataset: &Dataset,
    components: &[Component],
    orbit: &dyn TraceOrbit,
    background: BackgroundMode,
    amplitudes: Option<&[f64]>,
) -> Result<DMatrix<f64>, FitError> {
    if let Some(a) = amplitudes {
        if a.len() != components.len() {
            return Err(FitError::data(format!(
                "Got {} amplitudes for {} components.",
                a.len(),
                components.len()
            )));
        }
    }
    if background == BackgroundMode::PerStar && !dataset.has_background_column() {
        return Err(FitError::config(
            "Per-star background requested but the dataset has no background column.",
        ));
    }

    let n_stars = dataset.len();
    let n_cols = components.len() + usize::from(background.is_enabled());

    let columns: Vec<Vec<f64>> = components
        .par_iter()
        .map(|comp| {
            let (mean, cov) = comp.project(orbit);
            par_log_overlaps(&mean, &cov, dataset.stars())
        })
        .collect();

    let mut lnols = DMatrix::from_element(n_stars, n_cols, f64::NEG_INFINITY);
    for (j, column) in columns.iter().enumerate() {
        let ln_amp = amplitudes.map_or(0.0, |a| a[j].ln());
        for (i, &v) in column.iter().enumerate() {
            lnols[(i, j)] = v + ln_amp;
        }
    }

    match background {
        BackgroundMode::None => {}
        BackgroundMode::ConstantDensity { density } => {
            lnols.column_mut(n_cols - 1).fill(density.ln());
        }
        BackgroundMode::PerStar => {
            for (i, star) in dataset.stars().iter().enumerate() {
                lnols[(i, n_cols - 1)] = star.bg_ln_overlap.unwrap_or(f64::NEG_INFINITY);
            }
        }
    }

    Ok(lnols)
}

/// Membership probabilities and the mixture log-likelihood.
///
/// A star whose every column is `-inf` (or NaN) has no defined membership and
/// yields `FitError::DegenerateMembership`.
pub fn expectation(
    dataset: &Dataset,
    components: &[Component],
    orbit: &dyn TraceOrbit,
    background: BackgroundMode,
    amplitudes: Option<&[f64]>,
) -> Result<Expectation, FitError> {
    if components.is_empty() {
        return Err(FitError::config("Membership estimation needs at least one component."));
    }
    let lnols = ln_overlap_matrix(dataset, components, orbit, background, amplitudes)?;

    let mut probs = DMatrix::zeros(lnols.nrows(), lnols.ncols());
    let mut ln_likelihood = 0.0;
    for i in 0..lnols.nrows() {
        let row: Vec<f64> = lnols.row(i).iter().map(|v| if v.is_nan() { f64::NEG_INFINITY } else { *v }).collect();
        let lse = log_sum_exp(&row);
        if !lse.is_finite() {
            return Err(FitError::DegenerateMembership { star: i });
        }
        ln_likelihood += lse;

        let mut sum = 0.0;
        for (j, v) in row.iter().enumerate() {
            let p = (v - lse).exp();
            probs[(i, j)] = p;
            sum += p;
        }
        for j in 0..row.len() {
            probs[(i, j)] /= sum;
        }
    }

    let memberships = MembershipWeights::from_matrix(probs, components.len(), background.is_enabled())?;
    Ok(Expectation {
        memberships,
        ln_likelihood,
    })
}

/// Membership probabilities only.
pub fn estimate_membership(
    dataset: &Dataset,
    components: &[Component],
    orbit: &dyn TraceOrbit,
    background: BackgroundMode,
    amplitudes: Option<&[f64]>,
) -> Result<MembershipWeights, FitError> {
    expectation(dataset, components, orbit, background, amplitudes).map(|e| e.memberships)
}

/// `Σᵢ ln Σⱼ aⱼ·overlapᵢⱼ` with the given component amplitudes.
///
/// Unlike `expectation`, a star with no finite column contributes `-inf`
/// instead of an error.
pub fn mixture_ln_likelihood(
    dataset: &Dataset,
    components: &[Component],
    orbit: &dyn TraceOrbit,
    background: BackgroundMode,
    amplitudes: &[f64],
) -> Result<f64, FitError> {
    let lnols = ln_overlap_matrix(dataset, components, orbit, background, Some(amplitudes))?;
    Ok(lnols
        .row_iter()
        .map(|row| {
            let values: Vec<f64> = row.iter().copied().collect();
            log_sum_exp(&values)
        })
        .sum())
}

/// Mixture log-likelihood plus every component's log-prior.
pub fn mixture_ln_posterior(ln_likelihood: f64, components: &[Component], prior: &PriorConfig) -> f64 {
    components
        .iter()
        .fold(ln_likelihood, |acc, c| acc + ln_prior(c, prior))
}
