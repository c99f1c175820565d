//! Overlap integrals between a model Gaussian and noisy star measurements.
//!
//! The overlap of two 6D Gaussians has a closed form:
//!
//! ```text
//! ∫ N(x; μ_c, Σ_c) · N(x; μ_s, Σ_s) dx = N(μ_c; μ_s, Σ_c + Σ_s)
//! ```
//!
//! so the log-overlap is a single Gaussian log-density evaluated through the
//! Cholesky factor of the summed covariance. A summed covariance that is not
//! positive definite (or any non-finite input) yields `-inf`, which callers treat
//! as "infeasible parameters" rather than as an error.

use nalgebra::{Cholesky, Matrix6, Vector6};
use rayon::prelude::*;

use crate::domain::StarMeasurement;

/// `ln(2π)`.
const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Dimensionality of the phase space.
const DIM: f64 = 6.0;

/// Log-density of `N(diff; 0, cov)`, or `None` when the evaluation is
/// numerically degenerate.
///
/// Degenerate means a non-finite input, a covariance with no Cholesky
/// factorisation, or a non-positive factor diagonal. A well-posed density that
/// underflows (a very distant point) is `Some(-inf)`, not `None`.
pub fn try_gaussian_log_density(diff: &Vector6<f64>, cov: &Matrix6<f64>) -> Option<f64> {
    if !diff.iter().all(|v| v.is_finite()) || !cov.iter().all(|v| v.is_finite()) {
        return None;
    }

    let chol = Cholesky::new(*cov)?;
    let l = chol.l();

    let mut log_det = 0.0;
    for i in 0..6 {
        let d = l[(i, i)];
        if !(d.is_finite() && d > 0.0) {
            return None;
        }
        log_det += 2.0 * d.ln();
    }

    let y = l.solve_lower_triangular(diff)?;
    let maha = y.norm_squared();

    let value = -0.5 * (DIM * LN_2PI + log_det + maha);
    Some(if value.is_finite() { value } else { f64::NEG_INFINITY })
}

/// Log-density of `N(diff; 0, cov)`; degenerate evaluations give `-inf`.
pub fn gaussian_log_density(diff: &Vector6<f64>, cov: &Matrix6<f64>) -> f64 {
    try_gaussian_log_density(diff, cov).unwrap_or(f64::NEG_INFINITY)
}

/// Log-overlap, or `None` when the summed covariance is degenerate.
pub fn try_log_overlap(
    comp_mean: &Vector6<f64>,
    comp_cov: &Matrix6<f64>,
    star_mean: &Vector6<f64>,
    star_cov: &Matrix6<f64>,
) -> Option<f64> {
    let summed = comp_cov + star_cov;
    try_gaussian_log_density(&(comp_mean - star_mean), &summed)
}

/// Log of the overlap integral between a component and one star measurement.
pub fn log_overlap(
    comp_mean: &Vector6<f64>,
    comp_cov: &Matrix6<f64>,
    star_mean: &Vector6<f64>,
    star_cov: &Matrix6<f64>,
) -> f64 {
    try_log_overlap(comp_mean, comp_cov, star_mean, star_cov).unwrap_or(f64::NEG_INFINITY)
}

/// Log-overlaps of one component against every star (sequential).
pub fn log_overlaps(
    comp_mean: &Vector6<f64>,
    comp_cov: &Matrix6<f64>,
    stars: &[StarMeasurement],
) -> Vec<f64> {
    stars
        .iter()
        .map(|s| log_overlap(comp_mean, comp_cov, &s.mean, &s.cov))
        .collect()
}

/// Log-overlaps of one component against every star, spread across the rayon pool.
///
/// Output order matches `stars`.
pub fn par_log_overlaps(
    comp_mean: &Vector6<f64>,
    comp_cov: &Matrix6<f64>,
    stars: &[StarMeasurement],
) -> Vec<f64> {
    stars
        .par_iter()
        .map(|s| log_overlap(comp_mean, comp_cov, &s.mean, &s.cov))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd(seed: f64) -> Matrix6<f64> {
        // A = B Bᵀ + I is always symmetric positive definite.
        let b = Matrix6::from_fn(|i, j| ((i * 7 + j * 3) as f64 * seed).sin());
        b * b.transpose() + Matrix6::identity()
    }

    /// ∫ N(x; m1, s1²) N(x; m2, s2²) dx by the trapezoid rule.
    fn overlap_1d_numeric(m1: f64, s1: f64, m2: f64, s2: f64) -> f64 {
        let width = 12.0 * s1.max(s2);
        let lo = m1.min(m2) - width;
        let hi = m1.max(m2) + width;
        let n = 40_001;
        let h = (hi - lo) / (n as f64 - 1.0);
        let pdf = |x: f64, m: f64, s: f64| {
            (-(x - m) * (x - m) / (2.0 * s * s)).exp() / (s * (2.0 * std::f64::consts::PI).sqrt())
        };
        let mut total = 0.0;
        for i in 0..n {
            let x = lo + h * i as f64;
            let w = if i == 0 || i == n - 1 { 0.5 } else { 1.0 };
            total += w * pdf(x, m1, s1) * pdf(x, m2, s2);
        }
        total * h
    }

    #[test]
    fn matches_closed_form_density_of_summed_covariance() {
        let a = spd(0.3);
        let b = spd(1.1);
        let ma = Vector6::new(1.0, -2.0, 0.5, 3.0, 0.0, -1.0);
        let mb = Vector6::new(0.0, -1.0, 1.5, 2.0, 0.5, 0.0);

        let sum = a + b;
        let inv = sum.try_inverse().unwrap();
        let d = ma - mb;
        let expected = -0.5 * (6.0 * LN_2PI + sum.determinant().ln() + (d.transpose() * inv * d)[(0, 0)]);

        assert_relative_eq!(log_overlap(&ma, &a, &mb, &b), expected, epsilon = 1e-9);
    }

    #[test]
    fn matches_numerical_integration_for_diagonal_case() {
        let comp_sd = [10.0, 8.0, 12.0, 2.0, 1.5, 2.5];
        let star_sd = [1.0, 2.0, 0.5, 0.3, 0.4, 0.2];
        let comp_mean = Vector6::new(0.0, 5.0, -3.0, 1.0, 0.0, 2.0);
        let star_mean = Vector6::new(4.0, 1.0, 2.0, -1.0, 0.5, 1.0);

        let comp_cov = Matrix6::from_diagonal(&Vector6::from_fn(|i, _| comp_sd[i] * comp_sd[i]));
        let star_cov = Matrix6::from_diagonal(&Vector6::from_fn(|i, _| star_sd[i] * star_sd[i]));

        // The 6D integral factorises into a product of 1D integrals.
        let numeric: f64 = (0..6)
            .map(|i| overlap_1d_numeric(comp_mean[i], comp_sd[i], star_mean[i], star_sd[i]).ln())
            .sum();

        let closed = log_overlap(&comp_mean, &comp_cov, &star_mean, &star_cov);
        assert_relative_eq!(closed, numeric, epsilon = 1e-6);
    }

    #[test]
    fn non_positive_definite_sum_is_negative_infinity() {
        let mean = Vector6::zeros();
        let comp_cov = Matrix6::identity() * -2.0;
        let star_cov = Matrix6::identity();
        assert_eq!(log_overlap(&mean, &comp_cov, &mean, &star_cov), f64::NEG_INFINITY);

        // Rank deficient: a zero row/column.
        let mut singular = Matrix6::identity();
        singular[(2, 2)] = 0.0;
        assert_eq!(gaussian_log_density(&mean, &singular), f64::NEG_INFINITY);
    }

    #[test]
    fn degenerate_sum_is_distinguished_from_a_distant_star() {
        let mean = Vector6::zeros();
        let mut indefinite = Matrix6::identity();
        indefinite[(0, 3)] = 1e6;
        indefinite[(3, 0)] = 1e6;
        assert_eq!(try_log_overlap(&mean, &Matrix6::identity(), &mean, &indefinite), None);

        let far = Vector6::from_element(1e160);
        let value = try_log_overlap(&mean, &Matrix6::identity(), &far, &Matrix6::identity());
        assert_eq!(value, Some(f64::NEG_INFINITY));
    }

    #[test]
    fn nan_input_is_negative_infinity() {
        let mut mean = Vector6::zeros();
        mean[4] = f64::NAN;
        let cov = Matrix6::identity();
        assert_eq!(log_overlap(&mean, &cov, &Vector6::zeros(), &cov), f64::NEG_INFINITY);
    }

    #[test]
    fn swapping_roles_gives_same_value() {
        let a = spd(0.7);
        let b = spd(0.2);
        let ma = Vector6::new(3.0, 1.0, 0.0, -2.0, 1.0, 0.5);
        let mb = Vector6::zeros();
        assert_relative_eq!(
            log_overlap(&ma, &a, &mb, &b),
            log_overlap(&mb, &b, &ma, &a),
            epsilon = 1e-12
        );
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let stars: Vec<StarMeasurement> = (0..20)
            .map(|i| StarMeasurement {
                mean: Vector6::from_element(i as f64),
                cov: Matrix6::identity() * (1.0 + i as f64 * 0.1),
                bg_ln_overlap: None,
            })
            .collect();
        let mean = Vector6::from_element(3.0);
        let cov = Matrix6::identity() * 25.0;
        assert_eq!(log_overlaps(&mean, &cov, &stars), par_log_overlaps(&mean, &cov, &stars));
    }
}
