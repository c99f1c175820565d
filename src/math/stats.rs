//! Small statistics helpers used by the fitter and the EM loop.

use nalgebra::{Matrix6, Vector6};

/// Percentile of already-sorted values using linear interpolation between
/// closest ranks (the same convention as numpy's default).
///
/// `q` is in percent (`0..=100`). Returns `None` for an empty slice.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 100.0);
    let pos = q / 100.0 * (sorted.len() as f64 - 1.0);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
}

/// Percentile of unsorted values. Non-finite values are ignored.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    finite.sort_by(f64::total_cmp);
    percentile_sorted(&finite, q)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// `ln Σ exp(v_i)`, stabilised by the maximum.
///
/// All `-inf` inputs (or an empty slice) give `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `ln(exp(a) + exp(b))`.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Weighted mean and (biased, `ddof = 0`) covariance of a set of 6D points.
///
/// Returns `None` when the weights do not sum to a positive finite value.
pub fn weighted_mean_cov(points: &[Vector6<f64>], weights: &[f64]) -> Option<(Vector6<f64>, Matrix6<f64>)> {
    if points.is_empty() || points.len() != weights.len() {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return None;
    }

    let mut mean = Vector6::zeros();
    for (p, &w) in points.iter().zip(weights) {
        mean += p * w;
    }
    mean /= total;

    let mut cov = Matrix6::zeros();
    for (p, &w) in points.iter().zip(weights) {
        let d = p - mean;
        cov += d * d.transpose() * w;
    }
    cov /= total;

    Some((mean, cov))
}
