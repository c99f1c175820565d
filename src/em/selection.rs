//! Model selection between component counts.
//!
//! `BIC = k · ln(n) − 2 · lnL`, lower is better, with
//! `k = n_components · params_per_component + (n_components − 1)` (the mixing
//! fractions) and `n` the number of stars.

use crate::domain::ComponentKind;

/// Free parameters of a `n_components` mixture.
pub fn n_free_params(n_components: usize, kind: ComponentKind) -> usize {
    n_components * kind.param_count() + n_components.saturating_sub(1)
}

pub fn bic(ln_likelihood: f64, n_components: usize, kind: ComponentKind, n_stars: usize) -> f64 {
    let k = n_free_params(n_components, kind) as f64;
    k * (n_stars as f64).ln() - 2.0 * ln_likelihood
}

/// Index of the lowest score; NaN never wins and ties go to the lower index.
pub fn select_lowest(scores: &[(usize, f64)]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for &(idx, score) in scores {
        if score.is_nan() {
            continue;
        }
        best = match best {
            Some((b_idx, b)) if b < score || (b == score && b_idx < idx) => Some((b_idx, b)),
            _ => Some((idx, score)),
        };
    }
    best
}

/// Whether a candidate score strictly improves on the current one.
pub fn improves(candidate: f64, current: f64) -> bool {
    !candidate.is_nan() && (candidate < current || current.is_nan())
}
