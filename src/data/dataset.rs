//! Star datasets and their array-shaped serialised form.
//!
//! A `Dataset` is always validated on construction, so fitting code can assume:
//!
//! - every mean and covariance entry is finite
//! - every covariance is symmetric
//! - either every star carries a background log-overlap or none does

use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use crate::domain::StarMeasurement;
use crate::error::FitError;
use crate::math::weighted_mean_cov;

/// Relative tolerance for the covariance symmetry check.
const SYMMETRY_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    stars: Vec<StarMeasurement>,
}

/// The `loadDataset` shape: `n × 6` means, `n × 6 × 6` covariances and an
/// optional background column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetArrays {
    pub means: Vec<[f64; 6]>,
    pub covariances: Vec<[[f64; 6]; 6]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_ln_overlaps: Option<Vec<f64>>,
}

impl Dataset {
    pub fn new(stars: Vec<StarMeasurement>) -> Result<Self, FitError> {
        if stars.is_empty() {
            return Err(FitError::data("Dataset has no stars."));
        }

        let with_bg = stars.iter().filter(|s| s.bg_ln_overlap.is_some()).count();
        if with_bg != 0 && with_bg != stars.len() {
            return Err(FitError::data(format!(
                "Background log-overlap given for {with_bg} of {} stars; provide all or none.",
                stars.len()
            )));
        }

        for (i, s) in stars.iter().enumerate() {
            if !s.mean.iter().all(|v| v.is_finite()) {
                return Err(FitError::data(format!("Star {i} has a non-finite mean.")));
            }
            if !s.cov.iter().all(|v| v.is_finite()) {
                return Err(FitError::data(format!("Star {i} has a non-finite covariance.")));
            }
            let scale = 1.0 + s.cov.amax();
            if (s.cov - s.cov.transpose()).amax() > SYMMETRY_TOL * scale {
                return Err(FitError::data(format!("Star {i} has an asymmetric covariance.")));
            }
            if (0..6).any(|d| s.cov[(d, d)] < 0.0) {
                return Err(FitError::data(format!("Star {i} has a negative variance.")));
            }
            if s.bg_ln_overlap.is_some_and(f64::is_nan) {
                return Err(FitError::data(format!("Star {i} has a NaN background log-overlap.")));
            }
        }

        Ok(Self { stars })
    }

    pub fn stars(&self) -> &[StarMeasurement] {
        &self.stars
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    /// Whether every star carries a precomputed background log-overlap.
    pub fn has_background_column(&self) -> bool {
        self.stars.first().is_some_and(|s| s.bg_ln_overlap.is_some())
    }

    /// Weighted mean and covariance of the star means.
    pub fn weighted_mean_cov(&self, weights: &[f64]) -> Option<(Vector6<f64>, Matrix6<f64>)> {
        let points: Vec<Vector6<f64>> = self.stars.iter().map(|s| s.mean).collect();
        weighted_mean_cov(&points, weights)
    }

    pub fn to_arrays(&self) -> DatasetArrays {
        let means = self
            .stars
            .iter()
            .map(|s| std::array::from_fn(|i| s.mean[i]))
            .collect();
        let covariances = self
            .stars
            .iter()
            .map(|s| std::array::from_fn(|i| std::array::from_fn(|j| s.cov[(i, j)])))
            .collect();
        let background_ln_overlaps = if self.has_background_column() {
            Some(self.stars.iter().filter_map(|s| s.bg_ln_overlap).collect())
        } else {
            None
        };
        DatasetArrays {
            means,
            covariances,
            background_ln_overlaps,
        }
    }
}

impl TryFrom<DatasetArrays> for Dataset {
    type Error = FitError;

    fn try_from(arrays: DatasetArrays) -> Result<Self, Self::Error> {
        let n = arrays.means.len();
        if arrays.covariances.len() != n {
            return Err(FitError::data(format!(
                "Dataset has {n} means but {} covariances.",
                arrays.covariances.len()
            )));
        }
        if let Some(bg) = &arrays.background_ln_overlaps {
            if bg.len() != n {
                return Err(FitError::data(format!(
                    "Dataset has {n} means but {} background log-overlaps.",
                    bg.len()
                )));
            }
        }

        let stars = arrays
            .means
            .iter()
            .zip(&arrays.covariances)
            .enumerate()
            .map(|(i, (m, c))| StarMeasurement {
                mean: Vector6::from_column_slice(m),
                cov: Matrix6::from_fn(|r, col| c[r][col]),
                bg_ln_overlap: arrays.background_ln_overlaps.as_ref().map(|bg| bg[i]),
            })
            .collect();

        Dataset::new(stars)
    }
}
