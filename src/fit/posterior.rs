//! Log-prior, log-likelihood and log-posterior of a single component.
//!
//! Both fitting strategies (ensemble MCMC and multistart Nelder-Mead) evaluate
//! the same `ComponentPosterior` in the same internal parameter space.
//!
//! Infeasible parameters never raise: they evaluate to `-inf`. NaN is mapped to
//! `-inf` here so nothing downstream can mistake it for a valid value.
//!
//! Star terms whose summed covariance is degenerate are left out of the sum
//! and counted. An evaluation where they carry more than half of the weight is
//! `-inf`; the fitter turns a fit dominated by such evaluations into
//! `FitError::FitFailed`.

use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::Cholesky;

use crate::data::Dataset;
use crate::domain::{BackgroundMode, ComponentKind, FitConfig, PriorConfig};
use crate::error::FitError;
use crate::math::{log_add_exp, try_log_overlap};
use crate::models::{Component, TraceOrbit};

/// A log-probability over a fixed-length parameter vector.
pub trait LogProbability: Sync {
    fn n_params(&self) -> usize;

    /// Unnormalised log-probability; `-inf` for infeasible `theta`, never NaN.
    fn ln_prob(&self, theta: &[f64]) -> f64;
}

/// Log-prior of a component under hard bounds.
///
/// Returns `-inf` when a dispersion is below its floor, the age is outside
/// `[0, max_age]`, a mean coordinate is out of range, a correlation is not in
/// `(-1, 1)` or the origin covariance is not positive definite. Otherwise
/// returns the change-of-variables term `Σ ln σ` plus the optional compactness
/// term `p · ln|Σ⁻¹|`.
pub fn ln_prior(comp: &Component, prior: &PriorConfig) -> f64 {
    let kind = comp.kind();
    let pars = comp.internal();
    if pars.iter().any(|v| !v.is_finite()) {
        return f64::NEG_INFINITY;
    }

    let mut jacobian = 0.0;
    for &i in kind.dispersion_indices() {
        let floor = if kind.is_position_dispersion(i) {
            prior.min_position_dispersion
        } else {
            prior.min_velocity_dispersion
        };
        if pars[i].exp() < floor {
            return f64::NEG_INFINITY;
        }
        jacobian += pars[i];
    }

    let age = comp.age();
    if age < 0.0 || age > prior.max_age {
        return f64::NEG_INFINITY;
    }
    if pars[..6].iter().any(|m| m.abs() > prior.max_abs_mean) {
        return f64::NEG_INFINITY;
    }
    if kind.correlation_indices().iter().any(|&i| pars[i].abs() >= 1.0) {
        return f64::NEG_INFINITY;
    }

    let Some(chol) = Cholesky::new(comp.origin_cov()) else {
        return f64::NEG_INFINITY;
    };
    if prior.compactness_exponent == 0.0 {
        return jacobian;
    }
    let log_det: f64 = chol.l().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
    jacobian - prior.compactness_exponent * log_det
}

/// Degenerate-overlap counts accumulated over every likelihood evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DegeneracyStats {
    pub evaluations: usize,
    /// Evaluations where degenerate terms carried most of the weight.
    pub dominated_evaluations: usize,
    pub degenerate_overlaps: usize,
}

impl DegeneracyStats {
    /// More than half of all evaluations were dominated by degenerate terms.
    pub fn dominates(&self) -> bool {
        self.evaluations > 0 && 2 * self.dominated_evaluations > self.evaluations
    }
}

/// Outcome of one likelihood evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikelihoodTerms {
    pub ln_likelihood: f64,
    pub degenerate_overlaps: usize,
    /// Summed weight of degenerate terms over the summed weight of used terms.
    pub degenerate_weight_fraction: f64,
}

impl LikelihoodTerms {
    pub fn is_dominated(&self) -> bool {
        self.degenerate_weight_fraction > 0.5
    }
}

#[derive(Debug, Default)]
struct DegeneracyCounter {
    evaluations: AtomicUsize,
    dominated: AtomicUsize,
    overlaps: AtomicUsize,
}

/// Posterior of one component given fixed per-star membership weights.
pub struct ComponentPosterior<'a> {
    kind: ComponentKind,
    dataset: &'a Dataset,
    weights: &'a [f64],
    orbit: &'a dyn TraceOrbit,
    background: BackgroundMode,
    prior: &'a PriorConfig,
    membership_threshold: f64,
    degeneracy: DegeneracyCounter,
}

impl<'a> ComponentPosterior<'a> {
    pub fn new(
        dataset: &'a Dataset,
        weights: &'a [f64],
        orbit: &'a dyn TraceOrbit,
        background: BackgroundMode,
        config: &'a FitConfig,
    ) -> Result<Self, FitError> {
        if weights.len() != dataset.len() {
            return Err(FitError::data(format!(
                "Got {} membership weights for {} stars.",
                weights.len(),
                dataset.len()
            )));
        }
        if weights.iter().any(|w| !(w.is_finite() && (0.0..=1.0).contains(w))) {
            return Err(FitError::data("Membership weights must lie in [0, 1]."));
        }
        if background == BackgroundMode::PerStar && !dataset.has_background_column() {
            return Err(FitError::config(
                "Per-star background requested but the dataset has no background column.",
            ));
        }
        Ok(Self {
            kind: config.component,
            dataset,
            weights,
            orbit,
            background,
            prior: &config.prior,
            membership_threshold: config.membership_threshold,
            degeneracy: DegeneracyCounter::default(),
        })
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn weights(&self) -> &[f64] {
        self.weights
    }

    /// Degenerate-overlap counts so far.
    pub fn degeneracy(&self) -> DegeneracyStats {
        DegeneracyStats {
            evaluations: self.degeneracy.evaluations.load(Ordering::Relaxed),
            dominated_evaluations: self.degeneracy.dominated.load(Ordering::Relaxed),
            degenerate_overlaps: self.degeneracy.overlaps.load(Ordering::Relaxed),
        }
    }

    /// Weighted sum of per-star log-overlaps with the projected component.
    ///
    /// Stars whose weight is zero or below the membership threshold are skipped.
    /// With a constant background density, each star's term is
    /// `ln(overlap + density)`.
    pub fn ln_likelihood(&self, comp: &Component) -> f64 {
        let terms = self.likelihood_terms(comp);
        self.degeneracy.evaluations.fetch_add(1, Ordering::Relaxed);
        if terms.degenerate_overlaps > 0 {
            self.degeneracy
                .overlaps
                .fetch_add(terms.degenerate_overlaps, Ordering::Relaxed);
        }
        if terms.is_dominated() {
            self.degeneracy.dominated.fetch_add(1, Ordering::Relaxed);
        }
        terms.ln_likelihood
    }

    /// Likelihood with its degenerate-term bookkeeping; nothing is recorded.
    pub fn likelihood_terms(&self, comp: &Component) -> LikelihoodTerms {
        let (mean_now, cov_now) = comp.project(self.orbit);
        let ln_bg = match self.background {
            BackgroundMode::ConstantDensity { density } => Some(density.ln()),
            BackgroundMode::None | BackgroundMode::PerStar => None,
        };

        let mut total = 0.0;
        let mut used_weight = 0.0;
        let mut degenerate_weight = 0.0;
        let mut degenerate_overlaps = 0;
        for (star, &w) in self.dataset.stars().iter().zip(self.weights) {
            if w == 0.0 || w < self.membership_threshold {
                continue;
            }
            used_weight += w;
            let Some(lnol) = try_log_overlap(&mean_now, &cov_now, &star.mean, &star.cov) else {
                degenerate_weight += w;
                degenerate_overlaps += 1;
                continue;
            };
            let term = match ln_bg {
                Some(b) => log_add_exp(lnol, b),
                None => lnol,
            };
            total += w * term;
        }

        let degenerate_weight_fraction = if used_weight > 0.0 {
            degenerate_weight / used_weight
        } else {
            0.0
        };
        let ln_likelihood = if degenerate_weight_fraction > 0.5 {
            f64::NEG_INFINITY
        } else {
            total
        };
        LikelihoodTerms {
            ln_likelihood,
            degenerate_overlaps,
            degenerate_weight_fraction,
        }
    }

    pub fn ln_posterior(&self, comp: &Component) -> f64 {
        let lp = ln_prior(comp, self.prior);
        if lp == f64::NEG_INFINITY {
            return lp;
        }
        let value = lp + self.ln_likelihood(comp);
        if value.is_nan() { f64::NEG_INFINITY } else { value }
    }
}

impl LogProbability for ComponentPosterior<'_> {
    fn n_params(&self) -> usize {
        self.kind.param_count()
    }

    fn ln_prob(&self, theta: &[f64]) -> f64 {
        match Component::from_internal(self.kind, theta.to_vec()) {
            Ok(comp) => self.ln_posterior(&comp),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StarMeasurement;
    use crate::models::IdentityOrbit;
    use nalgebra::{Matrix6, Vector6};

    fn dataset(n: usize) -> Dataset {
        let stars = (0..n)
            .map(|i| StarMeasurement {
                mean: Vector6::new(i as f64 - 2.0, 0.5, -0.5, 0.1 * i as f64, 0.0, 0.0),
                cov: Matrix6::identity() * 0.5,
                bg_ln_overlap: Some(-25.0),
            })
            .collect();
        Dataset::new(stars).unwrap()
    }

    fn sphere(dx: f64, dv: f64, age: f64) -> Component {
        Component::from_external(ComponentKind::Sphere, &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, dx, dv, age]).unwrap()
    }

    #[test]
    fn dispersion_below_floor_is_exactly_negative_infinity() {
        let prior = PriorConfig::default();
        assert_eq!(ln_prior(&sphere(1.9, 1.0, 1.0), &prior), f64::NEG_INFINITY);
        assert_eq!(ln_prior(&sphere(5.0, 0.49, 1.0), &prior), f64::NEG_INFINITY);

        let ds = dataset(5);
        let w = vec![1.0; 5];
        let config = FitConfig::default();
        let post = ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).unwrap();
        assert_eq!(post.ln_prob(sphere(1.0, 1.0, 1.0).internal()), f64::NEG_INFINITY);
    }

    #[test]
    fn negative_age_and_bad_correlation_are_rejected() {
        let prior = PriorConfig::default();
        assert_eq!(ln_prior(&sphere(5.0, 1.0, -0.1), &prior), f64::NEG_INFINITY);
        assert_eq!(ln_prior(&sphere(5.0, 1.0, 501.0), &prior), f64::NEG_INFINITY);

        let ellip = Component::from_external(
            ComponentKind::Ellip,
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 1.0, 1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        assert_eq!(ln_prior(&ellip, &prior), f64::NEG_INFINITY);
    }

    #[test]
    fn feasible_prior_is_log_dispersion_sum() {
        let prior = PriorConfig::default();
        let lp = ln_prior(&sphere(5.0, 2.0, 1.0), &prior);
        assert!((lp - (5f64.ln() + 2f64.ln())).abs() < 1e-12);

        let strict = PriorConfig {
            compactness_exponent: 0.5,
            ..PriorConfig::default()
        };
        // |Σ| = 5⁶·2⁶
        let expected = 5f64.ln() + 2f64.ln() - 0.5 * (6.0 * 5f64.ln() + 6.0 * 2f64.ln());
        assert!((ln_prior(&sphere(5.0, 2.0, 1.0), &strict) - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_stars_contribute_nothing() {
        let ds = dataset(5);
        let config = FitConfig::default();
        let comp = sphere(5.0, 2.0, 1.0);

        let all = vec![1.0, 1.0, 1.0, 1.0, 0.0];
        let post = ComponentPosterior::new(&ds, &all, &IdentityOrbit, BackgroundMode::None, &config).unwrap();

        let small = Dataset::new(ds.stars()[..4].to_vec()).unwrap();
        let ones = vec![1.0; 4];
        let post_small =
            ComponentPosterior::new(&small, &ones, &IdentityOrbit, BackgroundMode::None, &config).unwrap();

        assert_eq!(post.ln_likelihood(&comp), post_small.ln_likelihood(&comp));
    }

    #[test]
    fn constant_background_raises_each_term() {
        let ds = dataset(5);
        let w = vec![1.0; 5];
        let config = FitConfig::default();
        let comp = sphere(5.0, 2.0, 1.0);
        let plain = ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).unwrap();
        let with_bg = ComponentPosterior::new(
            &ds,
            &w,
            &IdentityOrbit,
            BackgroundMode::ConstantDensity { density: 1e-6 },
            &config,
        )
        .unwrap();
        assert!(with_bg.ln_likelihood(&comp) > plain.ln_likelihood(&comp));
    }

    #[test]
    fn nan_parameters_give_negative_infinity() {
        let ds = dataset(3);
        let w = vec![1.0; 3];
        let config = FitConfig::default();
        let post = ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).unwrap();
        let mut theta = sphere(5.0, 2.0, 1.0).internal().to_vec();
        theta[0] = f64::NAN;
        assert_eq!(post.ln_prob(&theta), f64::NEG_INFINITY);
        assert_eq!(post.ln_prob(&theta[..4]), f64::NEG_INFINITY);
    }

    fn with_broken_covariances(n: usize, broken: usize) -> Dataset {
        let mut stars = dataset(n).stars().to_vec();
        for star in stars.iter_mut().take(broken) {
            // Symmetric with non-negative variances, but far from positive definite.
            star.cov[(0, 3)] = 1e12;
            star.cov[(3, 0)] = 1e12;
        }
        Dataset::new(stars).unwrap()
    }

    #[test]
    fn minority_degenerate_stars_are_skipped_and_counted() {
        let ds = with_broken_covariances(5, 1);
        let w = vec![1.0; 5];
        let config = FitConfig::default();
        let comp = sphere(5.0, 2.0, 1.0);
        let post = ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).unwrap();

        let healthy = Dataset::new(ds.stars()[1..].to_vec()).unwrap();
        let ones = vec![1.0; 4];
        let post_healthy =
            ComponentPosterior::new(&healthy, &ones, &IdentityOrbit, BackgroundMode::None, &config).unwrap();

        let terms = post.likelihood_terms(&comp);
        assert_eq!(terms.degenerate_overlaps, 1);
        assert!((terms.degenerate_weight_fraction - 0.2).abs() < 1e-12);
        assert!(!terms.is_dominated());
        assert_eq!(post.ln_likelihood(&comp), post_healthy.ln_likelihood(&comp));

        let stats = post.degeneracy();
        assert_eq!(stats.evaluations, 1);
        assert_eq!(stats.degenerate_overlaps, 1);
        assert_eq!(stats.dominated_evaluations, 0);
        assert!(!stats.dominates());
    }

    #[test]
    fn majority_degenerate_stars_make_the_evaluation_infeasible() {
        let ds = with_broken_covariances(5, 3);
        let w = vec![1.0; 5];
        let config = FitConfig::default();
        let comp = sphere(5.0, 2.0, 1.0);
        let post = ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).unwrap();

        assert_eq!(post.ln_prob(comp.internal()), f64::NEG_INFINITY);
        let stats = post.degeneracy();
        assert_eq!(stats.evaluations, 1);
        assert_eq!(stats.degenerate_overlaps, 3);
        assert_eq!(stats.dominated_evaluations, 1);
        assert!(stats.dominates());
    }

    #[test]
    fn rejects_mismatched_weights_and_missing_background() {
        let ds = dataset(3);
        let config = FitConfig::default();
        let w = vec![1.0; 2];
        assert!(ComponentPosterior::new(&ds, &w, &IdentityOrbit, BackgroundMode::None, &config).is_err());

        let plain = Dataset::new(vec![StarMeasurement {
            mean: Vector6::zeros(),
            cov: Matrix6::identity(),
            bg_ln_overlap: None,
        }])
        .unwrap();
        let one = vec![1.0];
        assert!(ComponentPosterior::new(&plain, &one, &IdentityOrbit, BackgroundMode::PerStar, &config).is_err());
    }
}
