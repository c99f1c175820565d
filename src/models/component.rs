//! Gaussian kinematic components.
//!
//! A component is a Gaussian in 6D phase space at its birth (the *origin*),
//! plus an age. Its present-day distribution is obtained by tracing the origin
//! mean through a `TraceOrbit` and linearising the tracer around it.
//!
//! Parameters exist in two spaces:
//!
//! - *external*: physical values (`dx`, `dv` in pc and km/s)
//! - *internal*: what the sampler walks in (dispersions replaced by their logs)
//!
//! Layouts (external):
//!
//! ```text
//! sphere: x y z u v w dx dv age
//! ellip:  x y z u v w dx dy dz dv c_xy c_xz c_yz age
//! ```

use nalgebra::{Cholesky, Matrix6, Vector6};

use crate::domain::{ComponentKind, PriorConfig};
use crate::error::FitError;
use crate::models::orbit::TraceOrbit;

/// Step used for the finite-difference Jacobian of the orbit tracer.
const JACOBIAN_STEP: f64 = 1e-3;

/// Factor applied to dispersions when a component is split.
const SPLIT_SHRINK: f64 = 0.7;

/// Smallest age difference (Myr) between the two halves of a split.
const MIN_SPLIT_AGE_GAP: f64 = 0.5;

/// Largest correlation magnitude used when seeding an ellipsoid from data.
const MAX_SEED_CORRELATION: f64 = 0.9;

impl ComponentKind {
    /// Indices of the log-encoded dispersions in the parameter vector.
    pub fn dispersion_indices(self) -> &'static [usize] {
        match self {
            ComponentKind::Sphere => &[6, 7],
            ComponentKind::Ellip => &[6, 7, 8, 9],
        }
    }

    /// Indices of the correlation coefficients (empty for spheres).
    pub fn correlation_indices(self) -> &'static [usize] {
        match self {
            ComponentKind::Sphere => &[],
            ComponentKind::Ellip => &[10, 11, 12],
        }
    }

    pub fn age_index(self) -> usize {
        self.param_count() - 1
    }

    /// Whether a dispersion slot is positional (otherwise velocity).
    pub fn is_position_dispersion(self, index: usize) -> bool {
        match self {
            ComponentKind::Sphere => index == 6,
            ComponentKind::Ellip => (6..=8).contains(&index),
        }
    }

    /// External → internal: dispersions become their natural logs.
    pub fn internalise(self, external: &[f64]) -> Result<Vec<f64>, FitError> {
        self.check_len(external)?;
        let mut internal = external.to_vec();
        for &i in self.dispersion_indices() {
            internal[i] = external[i].ln();
        }
        Ok(internal)
    }

    /// Internal → external.
    pub fn externalise(self, internal: &[f64]) -> Result<Vec<f64>, FitError> {
        self.check_len(internal)?;
        let mut external = internal.to_vec();
        for &i in self.dispersion_indices() {
            external[i] = internal[i].exp();
        }
        Ok(external)
    }

    /// Per-parameter std-dev (internal space) for scattering initial walkers.
    pub fn sensible_walker_spread(self) -> Vec<f64> {
        let mut spread = vec![0.0; self.param_count()];
        spread[..3].fill(10.0);
        spread[3..6].fill(2.0);
        for &i in self.dispersion_indices() {
            spread[i] = 0.5;
        }
        for &i in self.correlation_indices() {
            spread[i] = 0.05;
        }
        spread[self.age_index()] = 1.0;
        spread
    }

    fn check_len(self, pars: &[f64]) -> Result<(), FitError> {
        if pars.len() != self.param_count() {
            return Err(FitError::data(format!(
                "A {} component has {} parameters, got {}.",
                self.display_name(),
                self.param_count(),
                pars.len()
            )));
        }
        Ok(())
    }
}

/// One component, stored in internal parameter space.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    kind: ComponentKind,
    pars: Vec<f64>,
}

impl Component {
    pub fn from_internal(kind: ComponentKind, pars: Vec<f64>) -> Result<Self, FitError> {
        kind.check_len(&pars)?;
        Ok(Self { kind, pars })
    }

    pub fn from_external(kind: ComponentKind, external: &[f64]) -> Result<Self, FitError> {
        let pars = kind.internalise(external)?;
        Ok(Self { kind, pars })
    }

    /// Nearest valid component to a raw mean and covariance (cold start).
    ///
    /// Dispersions are clamped to sit just above the prior floors, and the
    /// age is clamped into `[0, max_age]`.
    pub fn from_mean_cov(
        kind: ComponentKind,
        mean: &Vector6<f64>,
        cov: &Matrix6<f64>,
        age: f64,
        prior: &PriorConfig,
    ) -> Self {
        let pos_floor = 1.1 * prior.min_position_dispersion;
        let vel_floor = 1.1 * prior.min_velocity_dispersion;
        let age = if age.is_finite() { age.clamp(0.0, prior.max_age) } else { 0.0 };
        let sd = |i: usize, floor: f64| {
            let v = cov[(i, i)].max(0.0).sqrt();
            if v.is_finite() { v.max(floor) } else { floor }
        };
        let dv = {
            let var = (cov[(3, 3)] + cov[(4, 4)] + cov[(5, 5)]) / 3.0;
            let v = var.max(0.0).sqrt();
            if v.is_finite() { v.max(vel_floor) } else { vel_floor }
        };

        let mut pars: Vec<f64> = mean.iter().copied().collect();
        match kind {
            ComponentKind::Sphere => {
                let var = (cov[(0, 0)] + cov[(1, 1)] + cov[(2, 2)]) / 3.0;
                let dx = var.max(0.0).sqrt();
                let dx = if dx.is_finite() { dx.max(pos_floor) } else { pos_floor };
                pars.extend([dx.ln(), dv.ln(), age]);
            }
            ComponentKind::Ellip => {
                let d = [sd(0, pos_floor), sd(1, pos_floor), sd(2, pos_floor)];
                let corr = |i: usize, j: usize| {
                    let c = cov[(i, j)] / (d[i] * d[j]);
                    if c.is_finite() {
                        c.clamp(-MAX_SEED_CORRELATION, MAX_SEED_CORRELATION)
                    } else {
                        0.0
                    }
                };
                let c = [corr(0, 1), corr(0, 2), corr(1, 2)];
                pars.extend([d[0].ln(), d[1].ln(), d[2].ln(), dv.ln(), c[0], c[1], c[2], age]);
            }
        }

        let mut comp = Self { kind, pars };
        if kind == ComponentKind::Ellip && !comp.has_valid_origin_cov() {
            for &i in kind.correlation_indices() {
                comp.pars[i] = 0.0;
            }
        }
        comp
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Parameters in internal space.
    pub fn internal(&self) -> &[f64] {
        &self.pars
    }

    /// Parameters in external space.
    pub fn external(&self) -> Vec<f64> {
        let mut external = self.pars.clone();
        for &i in self.kind.dispersion_indices() {
            external[i] = self.pars[i].exp();
        }
        external
    }

    pub fn origin_mean(&self) -> Vector6<f64> {
        Vector6::from_column_slice(&self.pars[..6])
    }

    pub fn age(&self) -> f64 {
        self.pars[self.kind.age_index()]
    }

    /// External dispersions in vector order (`dx dv` or `dx dy dz dv`).
    pub fn dispersions(&self) -> Vec<f64> {
        self.kind
            .dispersion_indices()
            .iter()
            .map(|&i| self.pars[i].exp())
            .collect()
    }

    /// Correlation coefficients (`c_xy c_xz c_yz`), empty for spheres.
    pub fn correlations(&self) -> Vec<f64> {
        self.kind.correlation_indices().iter().map(|&i| self.pars[i]).collect()
    }

    /// Covariance of the origin distribution.
    pub fn origin_cov(&self) -> Matrix6<f64> {
        let mut cov = Matrix6::zeros();
        match self.kind {
            ComponentKind::Sphere => {
                let dx = self.pars[6].exp();
                let dv = self.pars[7].exp();
                for i in 0..3 {
                    cov[(i, i)] = dx * dx;
                    cov[(i + 3, i + 3)] = dv * dv;
                }
            }
            ComponentKind::Ellip => {
                let d = [self.pars[6].exp(), self.pars[7].exp(), self.pars[8].exp()];
                let dv = self.pars[9].exp();
                let pairs = [(0, 1, self.pars[10]), (0, 2, self.pars[11]), (1, 2, self.pars[12])];
                for i in 0..3 {
                    cov[(i, i)] = d[i] * d[i];
                    cov[(i + 3, i + 3)] = dv * dv;
                }
                for (i, j, c) in pairs {
                    cov[(i, j)] = c * d[i] * d[j];
                    cov[(j, i)] = cov[(i, j)];
                }
            }
        }
        cov
    }

    /// Whether the origin covariance admits a Cholesky factorisation.
    pub fn has_valid_origin_cov(&self) -> bool {
        let cov = self.origin_cov();
        cov.iter().all(|v| v.is_finite()) && Cholesky::new(cov).is_some()
    }

    /// Present-day mean and covariance.
    ///
    /// The mean is the traced origin mean. The covariance is `J Σ Jᵀ`, where
    /// `J` is a central-difference Jacobian of the tracer at the origin mean.
    pub fn project(&self, orbit: &dyn TraceOrbit) -> (Vector6<f64>, Matrix6<f64>) {
        let origin = self.origin_mean();
        let age = self.age();
        let mean_now = orbit.trace(&origin, age);

        let mut jac = Matrix6::zeros();
        for j in 0..6 {
            let mut fwd = origin;
            let mut back = origin;
            fwd[j] += JACOBIAN_STEP;
            back[j] -= JACOBIAN_STEP;
            let column = (orbit.trace(&fwd, age) - orbit.trace(&back, age)) / (2.0 * JACOBIAN_STEP);
            jac.set_column(j, &column);
        }

        let cov_now = jac * self.origin_cov() * jac.transpose();
        (mean_now, cov_now)
    }

    /// Replace this component by two narrower ones with distinct ages.
    ///
    /// The two origin means sit symmetrically about the original, offset by half
    /// a dispersion in each phase-space block; dispersions shrink but stay above
    /// the prior floors.
    pub fn split(&self, lo_age: f64, hi_age: f64, prior: &PriorConfig) -> [Component; 2] {
        let (lo_age, hi_age) = split_ages(lo_age, hi_age, prior.max_age);

        let disp = self.dispersions();
        let pos_sd = match self.kind {
            ComponentKind::Sphere => disp[0],
            ComponentKind::Ellip => (disp[0] * disp[1] * disp[2]).cbrt(),
        };
        let vel_sd = disp[disp.len() - 1];
        let pos_step = 0.5 * pos_sd / 3f64.sqrt();
        let vel_step = 0.5 * vel_sd / 3f64.sqrt();

        let mut halves = [self.clone(), self.clone()];
        for (half, (sign, age)) in halves.iter_mut().zip([(-1.0, lo_age), (1.0, hi_age)]) {
            for i in 0..3 {
                half.pars[i] += sign * pos_step;
                half.pars[i + 3] += sign * vel_step;
            }
            for &i in self.kind.dispersion_indices() {
                let floor = if self.kind.is_position_dispersion(i) {
                    prior.min_position_dispersion
                } else {
                    prior.min_velocity_dispersion
                };
                let shrunk = (SPLIT_SHRINK * self.pars[i].exp()).max(1.1 * floor);
                half.pars[i] = shrunk.ln();
            }
            half.pars[self.kind.age_index()] = age;
        }
        halves
    }
}

/// Clamp split ages into `[0, max_age]` and force a minimum gap between them.
fn split_ages(lo: f64, hi: f64, max_age: f64) -> (f64, f64) {
    let lo = if lo.is_finite() { lo.clamp(0.0, max_age) } else { 0.0 };
    let hi = if hi.is_finite() { hi.clamp(0.0, max_age) } else { lo };
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if hi - lo >= MIN_SPLIT_AGE_GAP {
        return (lo, hi);
    }
    let gap = MIN_SPLIT_AGE_GAP.min(max_age);
    let centre = 0.5 * (lo + hi);
    let lo = (centre - 0.5 * gap).clamp(0.0, max_age - gap);
    (lo, lo + gap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::orbit::{BallisticOrbit, IdentityOrbit, KMS_TO_PC_PER_MYR};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sphere() -> Component {
        Component::from_external(
            ComponentKind::Sphere,
            &[1.0, -2.0, 3.0, 0.5, -0.5, 1.5, 10.0, 2.0, 10.0],
        )
        .unwrap()
    }

    fn ellip() -> Component {
        Component::from_external(
            ComponentKind::Ellip,
            &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 10.0, 5.0, 3.0, 1.5, 0.3, -0.2, 0.1, 20.0],
        )
        .unwrap()
    }

    #[test]
    fn encoding_round_trips() {
        let mut rng = StdRng::seed_from_u64(7);
        for kind in [ComponentKind::Sphere, ComponentKind::Ellip] {
            for _ in 0..50 {
                let mut ext: Vec<f64> = (0..kind.param_count()).map(|_| rng.gen_range(-50.0..50.0)).collect();
                for &i in kind.dispersion_indices() {
                    ext[i] = rng.gen_range(0.5..40.0);
                }
                let int = kind.internalise(&ext).unwrap();
                let back = kind.externalise(&int).unwrap();
                for (a, b) in ext.iter().zip(&back) {
                    assert_relative_eq!(a, b, max_relative = 1e-12);
                }
                let again = kind.internalise(&back).unwrap();
                for (a, b) in int.iter().zip(&again) {
                    assert_relative_eq!(a, b, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(Component::from_external(ComponentKind::Sphere, &[0.0; 8]).is_err());
        assert!(ComponentKind::Ellip.externalise(&[0.0; 9]).is_err());
    }

    #[test]
    fn sphere_covariance_is_diagonal() {
        let cov = sphere().origin_cov();
        assert_relative_eq!(cov[(0, 0)], 100.0, epsilon = 1e-9);
        assert_relative_eq!(cov[(5, 5)], 4.0, epsilon = 1e-12);
        assert_eq!(cov[(0, 1)], 0.0);
    }

    #[test]
    fn ellip_covariance_uses_correlations() {
        let comp = ellip();
        let cov = comp.origin_cov();
        assert_relative_eq!(cov[(0, 1)], 0.3 * 10.0 * 5.0, epsilon = 1e-9);
        assert_relative_eq!(cov[(2, 0)], -0.2 * 10.0 * 3.0, epsilon = 1e-9);
        assert_relative_eq!(cov[(4, 4)], 2.25, epsilon = 1e-12);
        assert!(comp.has_valid_origin_cov());
    }

    #[test]
    fn identity_projection_keeps_origin() {
        let comp = sphere();
        let (mean, cov) = comp.project(&IdentityOrbit);
        assert_eq!(mean, comp.origin_mean());
        assert!((cov - comp.origin_cov()).amax() < 1e-8);
    }

    #[test]
    fn ballistic_projection_shears_covariance() {
        let comp = sphere();
        let (mean, cov) = comp.project(&BallisticOrbit);
        let k = comp.age() * KMS_TO_PC_PER_MYR;
        assert_relative_eq!(mean[0], 1.0 + 0.5 * k, epsilon = 1e-9);
        // var(x + k u) = dx² + k² dv²
        assert_relative_eq!(cov[(0, 0)], 100.0 + k * k * 4.0, max_relative = 1e-6);
        assert_relative_eq!(cov[(0, 3)], k * 4.0, max_relative = 1e-6);
        assert_relative_eq!(cov[(3, 3)], 4.0, max_relative = 1e-6);
    }

    #[test]
    fn split_produces_narrower_distinct_halves() {
        let prior = PriorConfig::default();
        let comp = sphere();
        let [a, b] = comp.split(5.0, 15.0, &prior);
        assert_relative_eq!(a.age(), 5.0);
        assert_relative_eq!(b.age(), 15.0);

        let centre = (a.origin_mean() + b.origin_mean()) / 2.0;
        assert!((centre - comp.origin_mean()).amax() < 1e-12);
        assert!(a.origin_mean() != b.origin_mean());

        for half in [&a, &b] {
            assert_relative_eq!(half.dispersions()[0], 7.0, epsilon = 1e-9);
            assert_relative_eq!(half.dispersions()[1], 1.4, epsilon = 1e-9);
        }
    }

    #[test]
    fn split_respects_floors_and_age_gap() {
        let prior = PriorConfig::default();
        let narrow = Component::from_external(
            ComponentKind::Ellip,
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.5, 2.5, 2.5, 0.6, 0.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
        let [a, b] = narrow.split(0.0, 0.0, &prior);
        assert!(a.age() >= 0.0);
        assert!(b.age() - a.age() >= MIN_SPLIT_AGE_GAP - 1e-12);
        for half in [&a, &b] {
            let d = half.dispersions();
            assert!(d[..3].iter().all(|&v| v >= prior.min_position_dispersion));
            assert!(d[3] >= prior.min_velocity_dispersion);
            assert!(half.has_valid_origin_cov());
        }
    }

    #[test]
    fn cold_start_clamps_to_valid_parameters() {
        let prior = PriorConfig::default();
        let cov = Matrix6::from_diagonal(&Vector6::new(0.1, 0.1, 0.1, 0.01, 0.01, 0.01));
        let comp = Component::from_mean_cov(ComponentKind::Sphere, &Vector6::zeros(), &cov, -3.0, &prior);
        assert!(comp.dispersions()[0] > prior.min_position_dispersion);
        assert!(comp.dispersions()[1] > prior.min_velocity_dispersion);
        assert_eq!(comp.age(), 0.0);

        let mut corr = Matrix6::identity() * 100.0;
        corr[(0, 1)] = 99.0;
        corr[(1, 0)] = 99.0;
        corr[(0, 2)] = -99.0;
        corr[(2, 0)] = -99.0;
        corr[(1, 2)] = 99.0;
        corr[(2, 1)] = 99.0;
        let comp = Component::from_mean_cov(ComponentKind::Ellip, &Vector6::zeros(), &corr, 1.0, &prior);
        assert!(comp.has_valid_origin_cov());
    }
}
