//! Burn-in diagnostics: convergence test, stuck-walker test and walker resets.

use crate::math::{mean_std, percentile};

/// Size of the first/last slices compared by the convergence test.
pub fn slice_size(n_steps: usize) -> usize {
    let half = (n_steps as f64 / 2.0).round() as usize;
    half.clamp(1, 100)
}

/// Whether the ensemble's mean log-probability has stopped drifting.
///
/// The first and last `slice_size` steps of all walkers are pooled and their
/// means compared; the difference must not exceed `tol` standard deviations of
/// the last slice. Any non-finite value in either slice means "not converged".
pub fn burnin_converged(traces: &[&[f64]], tol: f64) -> bool {
    let n_steps = traces.iter().map(|t| t.len()).min().unwrap_or(0);
    if traces.is_empty() || n_steps < 2 {
        return false;
    }
    let s = slice_size(n_steps);

    let start: Vec<f64> = traces.iter().flat_map(|t| t[..s].iter().copied()).collect();
    let end: Vec<f64> = traces
        .iter()
        .flat_map(|t| t[n_steps - s..n_steps].iter().copied())
        .collect();
    if start.iter().chain(&end).any(|v| !v.is_finite()) {
        return false;
    }

    let (Some((start_mean, _)), Some((end_mean, end_std))) = (mean_std(&start), mean_std(&end)) else {
        return false;
    };
    (start_mean - end_mean).abs() <= tol * end_std + 1e-10 * end_mean.abs()
}

/// Whether any single log-probability value occurs more than `threshold` times.
pub fn is_stuck(trace: &[f64], threshold: usize) -> bool {
    let mut values: Vec<f64> = trace.iter().copied().filter(|v| !v.is_nan()).collect();
    values.sort_by(f64::total_cmp);

    let mut run = 0;
    let mut prev: Option<f64> = None;
    for v in values {
        if prev == Some(v) {
            run += 1;
        } else {
            run = 1;
            prev = Some(v);
        }
        if run > threshold {
            return true;
        }
    }
    false
}

pub fn stuck_walkers(traces: &[&[f64]], threshold: usize) -> Vec<bool> {
    traces.iter().map(|t| is_stuck(t, threshold)).collect()
}

/// Move stuck and poorly performing walkers onto the best unstuck walker.
///
/// A walker is reset when it is stuck, or when it is unstuck and its
/// log-probability is below the `q`th percentile of the unstuck walkers.
/// Returns the number of walkers moved.
pub fn reset_walkers(positions: &mut [Vec<f64>], lnprob: &mut [f64], stuck: &[bool], q: f64) -> usize {
    let unstuck: Vec<usize> = (0..positions.len()).filter(|&k| !stuck[k]).collect();
    let Some(best) = unstuck
        .iter()
        .copied()
        .filter(|&k| lnprob[k].is_finite())
        .max_by(|&a, &b| lnprob[a].total_cmp(&lnprob[b]))
    else {
        return 0;
    };

    let unstuck_lnprob: Vec<f64> = unstuck.iter().map(|&k| lnprob[k]).collect();
    let cutoff = percentile(&unstuck_lnprob, q).unwrap_or(f64::INFINITY);

    let best_pos = positions[best].clone();
    let best_lp = lnprob[best];
    let mut moved = 0;
    for k in 0..positions.len() {
        if k == best {
            continue;
        }
        let poor = !lnprob[k].is_finite() || lnprob[k] < cutoff;
        if stuck[k] || poor {
            positions[k].clone_from(&best_pos);
            lnprob[k] = best_lp;
            moved += 1;
        }
    }
    moved
}
