//! Reduce sampler output to a best point and a per-parameter percentile table.

use crate::domain::{ComponentKind, MedianSpan};
use crate::error::FitError;
use crate::fit::sampler::Chain;
use crate::math::percentile_sorted;

/// The single highest-probability sample seen.
#[derive(Debug, Clone, PartialEq)]
pub struct BestSample {
    pub params: Vec<f64>,
    pub ln_prob: f64,
}

impl BestSample {
    /// Keep whichever of `self` and `other` has the higher log-probability.
    pub fn merge(self, other: Option<BestSample>) -> BestSample {
        match other {
            Some(o) if o.ln_prob > self.ln_prob => o,
            _ => self,
        }
    }
}

/// Highest finite log-probability sample. NaN and `-inf` never qualify.
pub fn best_sample<'a, I>(samples: I) -> Option<BestSample>
where
    I: IntoIterator<Item = (&'a [f64], f64)>,
{
    let mut best: Option<(&[f64], f64)> = None;
    for (params, lp) in samples {
        if !lp.is_finite() {
            continue;
        }
        if best.is_none_or(|(_, b)| lp > b) {
            best = Some((params, lp));
        }
    }
    best.map(|(params, ln_prob)| BestSample {
        params: params.to_vec(),
        ln_prob,
    })
}

/// Median and `50 ± span` percentiles of every parameter, in external units.
///
/// Only samples with a finite log-probability are used.
pub fn median_and_span(kind: ComponentKind, chain: &Chain, span: f64) -> Result<Vec<MedianSpan>, FitError> {
    let n_params = kind.param_count();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); n_params];
    for (params, lp) in chain.samples() {
        if !lp.is_finite() {
            continue;
        }
        let external = kind.externalise(params)?;
        for (col, v) in columns.iter_mut().zip(external) {
            col.push(v);
        }
    }

    if columns[0].is_empty() {
        return Err(FitError::FitFailed(
            "No finite-probability samples to summarise.".to_string(),
        ));
    }

    let mut table = Vec::with_capacity(n_params);
    for mut col in columns {
        col.sort_by(f64::total_cmp);
        let at = |q: f64| percentile_sorted(&col, q).unwrap_or(f64::NAN);
        table.push(MedianSpan {
            median: at(50.0),
            upper: at(50.0 + span),
            lower: at(50.0 - span),
        });
    }
    Ok(table)
}
