//! Synthetic star samples drawn from known components.
//!
//! Each cluster star is an origin drawn from the component's origin Gaussian,
//! traced forward by the component age, then blurred with Gaussian measurement
//! noise. An optional uniform box adds field stars.

use nalgebra::{Cholesky, Matrix6, Vector6};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::data::Dataset;
use crate::domain::StarMeasurement;
use crate::error::FitError;
use crate::models::{Component, TraceOrbit};

/// One simulated association.
#[derive(Debug, Clone)]
pub struct SyntheticCluster {
    pub component: Component,
    pub n_stars: usize,
}

/// Uniform field population inside an axis-aligned 6D box.
#[derive(Debug, Clone)]
pub struct BackgroundBox {
    pub n_stars: usize,
    pub centre: [f64; 6],
    pub half_widths: [f64; 6],
}

impl BackgroundBox {
    pub fn volume(&self) -> f64 {
        self.half_widths.iter().map(|h| 2.0 * h).product()
    }
}

/// Measurement noise: one standard deviation for positions, one for velocities.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementNoise {
    pub position_sd: f64,
    pub velocity_sd: f64,
}

impl MeasurementNoise {
    fn covariance(&self) -> Matrix6<f64> {
        let mut cov = Matrix6::zeros();
        for i in 0..3 {
            cov[(i, i)] = self.position_sd * self.position_sd;
            cov[(i + 3, i + 3)] = self.velocity_sd * self.velocity_sd;
        }
        cov
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticSample {
    pub dataset: Dataset,
    /// Generating cluster per star; `None` for background stars.
    pub labels: Vec<Option<usize>>,
}

/// Draw a synthetic dataset.
///
/// With a background box, every star gets a background log-overlap of
/// `ln(n_bg / (n_total · V))`, the log-density of the uniform field weighted by
/// its share of the sample.
pub fn generate_sample(
    clusters: &[SyntheticCluster],
    orbit: &dyn TraceOrbit,
    noise: MeasurementNoise,
    background: Option<&BackgroundBox>,
    seed: u64,
) -> Result<SyntheticSample, FitError> {
    if !(noise.position_sd.is_finite() && noise.velocity_sd.is_finite())
        || noise.position_sd < 0.0
        || noise.velocity_sd < 0.0
    {
        return Err(FitError::config("Measurement noise must be finite and non-negative."));
    }
    if let Some(bg) = background {
        if bg.half_widths.iter().any(|h| !(h.is_finite() && *h > 0.0)) {
            return Err(FitError::config("Background box half-widths must be positive."));
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let noise_cov = noise.covariance();
    let noise_sd = Vector6::new(
        noise.position_sd,
        noise.position_sd,
        noise.position_sd,
        noise.velocity_sd,
        noise.velocity_sd,
        noise.velocity_sd,
    );

    let mut means = Vec::new();
    let mut labels = Vec::new();

    for (label, cluster) in clusters.iter().enumerate() {
        let chol = Cholesky::new(cluster.component.origin_cov()).ok_or_else(|| {
            FitError::config(format!("Cluster {label} has a non-positive-definite origin covariance."))
        })?;
        let l = chol.l();
        let origin_mean = cluster.component.origin_mean();
        let age = cluster.component.age();

        for _ in 0..cluster.n_stars {
            let origin = origin_mean + l * standard_normal(&mut rng);
            let now = orbit.trace(&origin, age);
            let measured = now + standard_normal(&mut rng).component_mul(&noise_sd);
            means.push(measured);
            labels.push(Some(label));
        }
    }

    if let Some(bg) = background {
        for _ in 0..bg.n_stars {
            let point = Vector6::from_fn(|i, _| {
                let h = bg.half_widths[i];
                bg.centre[i] + rng.gen_range(-h..=h)
            });
            means.push(point);
            labels.push(None);
        }
    }

    let n_total = means.len();
    let bg_ln_overlap = background
        .filter(|bg| bg.n_stars > 0)
        .map(|bg| (bg.n_stars as f64 / (n_total as f64 * bg.volume())).ln());

    let stars = means
        .into_iter()
        .map(|mean| StarMeasurement {
            mean,
            cov: noise_cov,
            bg_ln_overlap,
        })
        .collect();

    debug!(n_stars = n_total, n_clusters = clusters.len(), seed, "synthetic sample generated");
    let dataset = Dataset::new(stars)?;
    Ok(SyntheticSample { dataset, labels })
}

fn standard_normal(rng: &mut StdRng) -> Vector6<f64> {
    Vector6::from_fn(|_, _| rng.sample(StandardNormal))
}
