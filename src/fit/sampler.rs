//! Affine-invariant ensemble sampler (stretch move).
//!
//! The ensemble is split into two halves. Each half is updated against the
//! other, so the walkers within one half are independent given the complement
//! and their log-probabilities can be evaluated in parallel. Every half-step
//! ends at a join barrier before the next one starts.
//!
//! All random numbers are drawn sequentially from the caller's RNG before the
//! parallel evaluation, so a run is reproducible from its seed regardless of
//! thread scheduling.

use rand::Rng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::error::FitError;
use crate::fit::posterior::LogProbability;

/// Trajectory of one walker.
#[derive(Debug, Clone, Default)]
pub struct WalkerTrace {
    /// Internal-space position after each step.
    pub positions: Vec<Vec<f64>>,
    pub lnprob: Vec<f64>,
}

/// Output of one sampler run: `n_walkers × n_steps × n_params`.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    pub walkers: Vec<WalkerTrace>,
    accepted: usize,
    proposed: usize,
}

impl Chain {
    /// Wrap externally built trajectories (no acceptance statistics).
    pub fn from_walkers(walkers: Vec<WalkerTrace>) -> Self {
        Self {
            walkers,
            accepted: 0,
            proposed: 0,
        }
    }

    pub fn n_walkers(&self) -> usize {
        self.walkers.len()
    }

    pub fn n_steps(&self) -> usize {
        self.walkers.first().map_or(0, |w| w.lnprob.len())
    }

    /// Fraction of proposals accepted over the whole run.
    pub fn acceptance_fraction(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Last position of every walker.
    pub fn final_positions(&self) -> Vec<Vec<f64>> {
        self.walkers
            .iter()
            .filter_map(|w| w.positions.last().cloned())
            .collect()
    }

    /// Last log-probability of every walker.
    pub fn final_lnprob(&self) -> Vec<f64> {
        self.walkers
            .iter()
            .filter_map(|w| w.lnprob.last().copied())
            .collect()
    }

    /// Per-walker log-probability trajectories.
    pub fn lnprob_traces(&self) -> Vec<&[f64]> {
        self.walkers.iter().map(|w| w.lnprob.as_slice()).collect()
    }

    /// Every `(position, lnprob)` pair, walker-major.
    pub fn samples(&self) -> impl Iterator<Item = (&[f64], f64)> + '_ {
        self.walkers.iter().flat_map(|w| {
            w.positions
                .iter()
                .zip(&w.lnprob)
                .map(|(p, &lp)| (p.as_slice(), lp))
        })
    }
}

pub struct EnsembleSampler<'a, P: LogProbability> {
    target: &'a P,
    scale: f64,
}

impl<'a, P: LogProbability> EnsembleSampler<'a, P> {
    pub fn new(target: &'a P, scale: f64) -> Result<Self, FitError> {
        if !(scale.is_finite() && scale > 1.0) {
            return Err(FitError::config("Stretch scale must be finite and > 1."));
        }
        Ok(Self { target, scale })
    }

    /// Evaluate the target at every position in parallel (order preserved).
    pub fn evaluate(&self, positions: &[Vec<f64>]) -> Vec<f64> {
        positions.par_iter().map(|p| self.target.ln_prob(p)).collect()
    }

    /// Advance the ensemble `n_steps` times from `start`.
    ///
    /// `start_lnprob` may carry already-known log-probabilities of `start`.
    pub fn run(
        &self,
        start: Vec<Vec<f64>>,
        start_lnprob: Option<Vec<f64>>,
        n_steps: usize,
        rng: &mut StdRng,
    ) -> Result<Chain, FitError> {
        let n_walkers = start.len();
        let ndim = self.target.n_params();
        if n_walkers < 4 || n_walkers % 2 != 0 {
            return Err(FitError::config(format!(
                "Ensemble needs an even number of at least 4 walkers, got {n_walkers}."
            )));
        }
        if start.iter().any(|p| p.len() != ndim) {
            return Err(FitError::data(format!("Every walker position must have {ndim} entries.")));
        }

        let mut lnprob = match start_lnprob {
            Some(lp) if lp.len() == n_walkers => lp,
            _ => self.evaluate(&start),
        };
        let mut positions = start;

        let mut chain = Chain {
            walkers: vec![
                WalkerTrace {
                    positions: Vec::with_capacity(n_steps),
                    lnprob: Vec::with_capacity(n_steps),
                };
                n_walkers
            ],
            accepted: 0,
            proposed: 0,
        };

        let half = n_walkers / 2;
        let a = self.scale;
        for _ in 0..n_steps {
            for (active, other) in [(0..half, half..n_walkers), (half..n_walkers, 0..half)] {
                let mut proposals = Vec::with_capacity(half);
                let mut stretches = Vec::with_capacity(half);
                let mut thresholds = Vec::with_capacity(half);
                for k in active.clone() {
                    let j = rng.gen_range(other.clone());
                    let u: f64 = rng.r#gen();
                    let z = ((a - 1.0) * u + 1.0).powi(2) / a;
                    let y: Vec<f64> = positions[j]
                        .iter()
                        .zip(&positions[k])
                        .map(|(xj, xk)| xj + z * (xk - xj))
                        .collect();
                    proposals.push(y);
                    stretches.push(z);
                    thresholds.push(rng.r#gen::<f64>().ln());
                }

                let new_lnprob = self.evaluate(&proposals);

                for (offset, (y, new_lp)) in proposals.into_iter().zip(new_lnprob).enumerate() {
                    let k = active.start + offset;
                    let diff = (ndim as f64 - 1.0) * stretches[offset].ln() + new_lp - lnprob[k];
                    chain.proposed += 1;
                    if diff > thresholds[offset] {
                        positions[k] = y;
                        lnprob[k] = new_lp;
                        chain.accepted += 1;
                    }
                }
            }

            for (k, walker) in chain.walkers.iter_mut().enumerate() {
                walker.positions.push(positions[k].clone());
                walker.lnprob.push(lnprob[k]);
            }
        }

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct StdNormal2;

    impl LogProbability for StdNormal2 {
        fn n_params(&self) -> usize {
            2
        }
        fn ln_prob(&self, theta: &[f64]) -> f64 {
            -0.5 * (theta[0] * theta[0] + theta[1] * theta[1])
        }
    }

    struct HalfPlane;

    impl LogProbability for HalfPlane {
        fn n_params(&self) -> usize {
            2
        }
        fn ln_prob(&self, theta: &[f64]) -> f64 {
            if theta[0] < 0.0 {
                f64::NEG_INFINITY
            } else {
                -0.5 * (theta[0] * theta[0] + theta[1] * theta[1])
            }
        }
    }

    fn ball(n: usize, rng: &mut StdRng, centre: f64) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| vec![centre + rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1)])
            .collect()
    }

    #[test]
    fn recovers_standard_normal_moments() {
        let mut rng = StdRng::seed_from_u64(11);
        let sampler = EnsembleSampler::new(&StdNormal2, 2.0).unwrap();
        let start = ball(16, &mut rng, 0.0);
        let chain = sampler.run(start, None, 2000, &mut rng).unwrap();
        assert_eq!(chain.n_walkers(), 16);
        assert_eq!(chain.n_steps(), 2000);

        let xs: Vec<f64> = chain
            .walkers
            .iter()
            .flat_map(|w| w.positions[500..].iter().map(|p| p[0]))
            .collect();
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        assert!(mean.abs() < 0.2, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.25, "var = {var}");

        let acc = chain.acceptance_fraction();
        assert!(acc > 0.2 && acc < 0.95, "acceptance = {acc}");
    }

    #[test]
    fn never_accepts_infeasible_proposals() {
        let mut rng = StdRng::seed_from_u64(3);
        let sampler = EnsembleSampler::new(&HalfPlane, 2.0).unwrap();
        let start = ball(8, &mut rng, 0.5);
        let chain = sampler.run(start, None, 300, &mut rng).unwrap();
        assert!(chain.samples().all(|(p, lp)| p[0] >= 0.0 && lp.is_finite()));
    }

    #[test]
    fn same_seed_same_chain() {
        let sampler = EnsembleSampler::new(&StdNormal2, 2.0).unwrap();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let start = ball(8, &mut rng, 0.0);
            sampler.run(start, None, 50, &mut rng).unwrap().final_positions()
        };
        assert_eq!(run(5), run(5));
    }

    #[test]
    fn rejects_odd_or_tiny_ensembles() {
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = EnsembleSampler::new(&StdNormal2, 2.0).unwrap();
        assert!(sampler.run(ball(5, &mut rng, 0.0), None, 1, &mut rng).is_err());
        assert!(sampler.run(ball(2, &mut rng, 0.0), None, 1, &mut rng).is_err());
        assert!(EnsembleSampler::new(&StdNormal2, 1.0).is_err());
    }
}
