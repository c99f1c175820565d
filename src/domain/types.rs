//! Shared domain types.
//!
//! These types are intentionally kept lightweight so they can be:
//!
//! - used in-memory during fitting
//! - deserialised from a driver's JSON configuration
//! - exported alongside results

use std::str::FromStr;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// One star: a 6D phase-space estimate `(x, y, z, u, v, w)` and its covariance.
///
/// Positions are in pc and velocities in km/s throughout the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct StarMeasurement {
    pub mean: Vector6<f64>,
    pub cov: Matrix6<f64>,
    /// Log-overlap of this star with the background population, if known.
    pub bg_ln_overlap: Option<f64>,
}

/// Which Gaussian parametrisation a component uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Spherical in position and spherical in velocity (9 parameters).
    Sphere,
    /// Ellipsoidal in position with correlations, spherical in velocity (14 parameters).
    Ellip,
}

impl ComponentKind {
    /// Human-readable label for logs and reports.
    pub fn display_name(self) -> &'static str {
        match self {
            ComponentKind::Sphere => "sphere",
            ComponentKind::Ellip => "ellip",
        }
    }

    /// Number of free parameters of one component.
    pub fn param_count(self) -> usize {
        self.parameter_labels().len()
    }

    /// External parameter names, in vector order.
    pub fn parameter_labels(self) -> &'static [&'static str] {
        match self {
            ComponentKind::Sphere => &["x", "y", "z", "u", "v", "w", "dx", "dv", "age"],
            ComponentKind::Ellip => &[
                "x", "y", "z", "u", "v", "w", "dx", "dy", "dz", "dv", "c_xy", "c_xz", "c_yz", "age",
            ],
        }
    }
}

impl FromStr for ComponentKind {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sphere" => Ok(ComponentKind::Sphere),
            "ellip" => Ok(ComponentKind::Ellip),
            other => Err(FitError::config(format!(
                "Unknown component parametrisation '{other}' (expected 'sphere' or 'ellip')."
            ))),
        }
    }
}

/// How a single component is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Affine-invariant ensemble MCMC with burn-in convergence checks.
    Mcmc,
    /// Deterministic Nelder-Mead from several starting points.
    NelderMead,
}

/// Background population term.
///
/// Two strategies exist and are kept side by side on purpose: a flat density
/// added inside each star's likelihood term, and a per-star precomputed
/// log-overlap column carried by the dataset. They do not describe the same
/// quantity, so results obtained with one are not comparable with the other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum BackgroundMode {
    /// No background column.
    None,
    /// Constant density (same units as an overlap) for every star.
    ConstantDensity { density: f64 },
    /// Use `StarMeasurement::bg_ln_overlap` for each star.
    PerStar,
}

impl BackgroundMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, BackgroundMode::None)
    }
}

/// Hard limits applied by the log-prior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Smallest allowed positional dispersion (pc).
    pub min_position_dispersion: f64,
    /// Smallest allowed velocity dispersion (km/s).
    pub min_velocity_dispersion: f64,
    /// Largest allowed age (Myr).
    pub max_age: f64,
    /// Largest allowed absolute value of any origin mean coordinate.
    pub max_abs_mean: f64,
    /// Power applied to `|Σ⁻¹|` of the origin covariance (`p · ln|Σ⁻¹|`).
    ///
    /// `0.0` disables the term.
    pub compactness_exponent: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            min_position_dispersion: 2.0,
            min_velocity_dispersion: 0.5,
            max_age: 500.0,
            max_abs_mean: 1e5,
            compactness_exponent: 0.0,
        }
    }
}

impl PriorConfig {
    pub fn validate(&self) -> Result<(), FitError> {
        if !(self.min_position_dispersion.is_finite() && self.min_position_dispersion > 0.0) {
            return Err(FitError::config("min_position_dispersion must be finite and > 0."));
        }
        if !(self.min_velocity_dispersion.is_finite() && self.min_velocity_dispersion > 0.0) {
            return Err(FitError::config("min_velocity_dispersion must be finite and > 0."));
        }
        if !(self.max_age.is_finite() && self.max_age > 0.0) {
            return Err(FitError::config("max_age must be finite and > 0."));
        }
        if !(self.max_abs_mean.is_finite() && self.max_abs_mean > 0.0) {
            return Err(FitError::config("max_abs_mean must be finite and > 0."));
        }
        if !self.compactness_exponent.is_finite() {
            return Err(FitError::config("compactness_exponent must be finite."));
        }
        Ok(())
    }
}

/// Settings for one single-component fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub component: ComponentKind,
    pub strategy: OptimizerKind,

    /// Steps per burn-in iteration.
    pub burnin_steps: usize,
    /// Optional extra sampling stage after burn-in.
    pub sampling_steps: Option<usize>,
    /// Cap on burn-in iterations (`None` = run until converged).
    pub max_burnin_iterations: Option<usize>,
    /// Allowed drift of the mean lnprob, in units of the final slice's std-dev.
    pub convergence_tol: f64,
    /// A walker whose lnprob repeats more often than this is stuck.
    pub stuck_repeat_threshold: usize,
    /// Unstuck walkers below this lnprob percentile are reset between burn-ins.
    pub reset_percentile: f64,
    /// Walkers per free parameter (the ensemble is rounded up to an even size).
    pub walkers_per_param: usize,
    /// Stretch-move scale `a`.
    pub stretch_scale: f64,
    /// Extra draws of the initial ensemble if every position is infeasible.
    pub init_retries: usize,

    /// Independent starting points for the Nelder-Mead strategy.
    pub optimizer_starts: usize,
    pub optimizer_max_iters: u64,
    /// Simplex standard-deviation tolerance for Nelder-Mead.
    pub optimizer_sd_tolerance: f64,

    /// Stars with membership below this are skipped in the likelihood.
    pub membership_threshold: f64,
    /// Half-width (in percent) of the reported spread around the median.
    pub percentile_span: f64,

    pub seed: u64,
    pub prior: PriorConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            component: ComponentKind::Sphere,
            strategy: OptimizerKind::Mcmc,
            burnin_steps: 1000,
            sampling_steps: None,
            max_burnin_iterations: Some(20),
            convergence_tol: 0.25,
            stuck_repeat_threshold: 100,
            reset_percentile: 33.0,
            walkers_per_param: 2,
            stretch_scale: 2.0,
            init_retries: 5,
            optimizer_starts: 4,
            optimizer_max_iters: 2000,
            optimizer_sd_tolerance: 1e-4,
            membership_threshold: 1e-5,
            percentile_span: 34.0,
            seed: 0,
            prior: PriorConfig::default(),
        }
    }
}

impl FitConfig {
    /// Ensemble size for the configured component kind.
    pub fn n_walkers(&self) -> usize {
        let n = self.walkers_per_param * self.component.param_count();
        n + n % 2
    }

    pub fn validate(&self) -> Result<(), FitError> {
        self.prior.validate()?;

        if self.burnin_steps < 2 {
            return Err(FitError::config("burnin_steps must be >= 2."));
        }
        if self.sampling_steps == Some(0) {
            return Err(FitError::config("sampling_steps must be > 0 when set."));
        }
        if self.max_burnin_iterations == Some(0) {
            return Err(FitError::config("max_burnin_iterations must be > 0 when set."));
        }
        if !(self.convergence_tol.is_finite() && self.convergence_tol > 0.0) {
            return Err(FitError::config("convergence_tol must be finite and > 0."));
        }
        if self.stuck_repeat_threshold == 0 {
            return Err(FitError::config("stuck_repeat_threshold must be > 0."));
        }
        if !(self.reset_percentile > 0.0 && self.reset_percentile < 100.0) {
            return Err(FitError::config("reset_percentile must be in (0, 100)."));
        }
        if self.walkers_per_param < 2 {
            return Err(FitError::config("walkers_per_param must be >= 2."));
        }
        if !(self.stretch_scale.is_finite() && self.stretch_scale > 1.0) {
            return Err(FitError::config("stretch_scale must be finite and > 1."));
        }
        if self.optimizer_starts == 0 {
            return Err(FitError::config("optimizer_starts must be > 0."));
        }
        if self.optimizer_max_iters == 0 {
            return Err(FitError::config("optimizer_max_iters must be > 0."));
        }
        if !(self.optimizer_sd_tolerance.is_finite() && self.optimizer_sd_tolerance > 0.0) {
            return Err(FitError::config("optimizer_sd_tolerance must be finite and > 0."));
        }
        if !(self.membership_threshold >= 0.0 && self.membership_threshold < 1.0) {
            return Err(FitError::config("membership_threshold must be in [0, 1)."));
        }
        if !(self.percentile_span > 0.0 && self.percentile_span <= 50.0) {
            return Err(FitError::config("percentile_span must be in (0, 50]."));
        }
        Ok(())
    }
}

/// Settings for the expectation-maximisation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {
    pub fit: FitConfig,
    pub background: BackgroundMode,
    /// Cap on E/M alternations for a fixed component count.
    pub max_em_iterations: usize,
    /// Largest per-entry membership change still considered "no change".
    pub membership_tol: f64,
    /// Cap on the number of components.
    pub max_components: usize,
    /// Skip re-fitting components whose membership column did not change.
    pub ignore_stable_components: bool,
    /// Optional wall-clock budget for the whole run.
    pub max_runtime_secs: Option<f64>,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            fit: FitConfig::default(),
            background: BackgroundMode::None,
            max_em_iterations: 100,
            membership_tol: 1e-2,
            max_components: 20,
            ignore_stable_components: false,
            max_runtime_secs: None,
        }
    }
}

impl EmConfig {
    pub fn validate(&self) -> Result<(), FitError> {
        self.fit.validate()?;

        if self.max_em_iterations == 0 {
            return Err(FitError::config("max_em_iterations must be > 0."));
        }
        if !(self.membership_tol.is_finite() && self.membership_tol > 0.0) {
            return Err(FitError::config("membership_tol must be finite and > 0."));
        }
        if self.max_components == 0 {
            return Err(FitError::config("max_components must be > 0."));
        }
        if let BackgroundMode::ConstantDensity { density } = self.background {
            if !(density.is_finite() && density > 0.0) {
                return Err(FitError::config("Background density must be finite and > 0."));
            }
        }
        if let Some(secs) = self.max_runtime_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(FitError::config("max_runtime_secs must be finite and > 0."));
            }
        }
        Ok(())
    }
}

/// Wall-clock budget checked by every loop level.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    deadline: Option<Instant>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self { deadline: None }
    }

    pub fn from_secs(secs: Option<f64>) -> Self {
        Self {
            deadline: secs.map(|s| Instant::now() + Duration::from_secs_f64(s)),
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Whether an iterative fit met its convergence criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    /// An iteration or time cap was hit first; the best result so far is kept.
    NotConverged,
}

/// Median and spread of one parameter's marginal distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MedianSpan {
    pub median: f64,
    /// `(50 + span)`th percentile.
    pub upper: f64,
    /// `(50 - span)`th percentile.
    pub lower: f64,
}

impl MedianSpan {
    /// A degenerate span for point estimates (no posterior sample).
    pub fn point(value: f64) -> Self {
        Self {
            median: value,
            upper: value,
            lower: value,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Membership probabilities, `n_stars × (n_components + background)`.
///
/// Rows lie on the probability simplex. The background column, when present,
/// is always the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipWeights {
    probs: DMatrix<f64>,
    n_components: usize,
    has_background: bool,
}

/// Tolerance used when validating that rows sum to one.
const ROW_SUM_TOL: f64 = 1e-9;

impl MembershipWeights {
    /// Every star fully assigned to the first component.
    pub fn initial(n_stars: usize, n_components: usize, has_background: bool) -> Self {
        let n_cols = n_components + usize::from(has_background);
        let mut probs = DMatrix::zeros(n_stars, n_cols);
        if n_cols > 0 {
            probs.column_mut(0).fill(1.0);
        }
        Self {
            probs,
            n_components,
            has_background,
        }
    }

    /// Wrap an explicit matrix, checking shape and the simplex invariant.
    pub fn from_matrix(probs: DMatrix<f64>, n_components: usize, has_background: bool) -> Result<Self, FitError> {
        let n_cols = n_components + usize::from(has_background);
        if probs.ncols() != n_cols {
            return Err(FitError::data(format!(
                "Membership matrix has {} columns, expected {n_cols}.",
                probs.ncols()
            )));
        }
        for (i, row) in probs.row_iter().enumerate() {
            if row.iter().any(|p| !(p.is_finite() && (0.0..=1.0).contains(p))) {
                return Err(FitError::data(format!("Membership row {i} has entries outside [0, 1].")));
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOL {
                return Err(FitError::data(format!("Membership row {i} sums to {sum}, not 1.")));
            }
        }
        Ok(Self {
            probs,
            n_components,
            has_background,
        })
    }

    pub fn n_stars(&self) -> usize {
        self.probs.nrows()
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn has_background(&self) -> bool {
        self.has_background
    }

    pub fn n_columns(&self) -> usize {
        self.probs.ncols()
    }

    pub fn get(&self, star: usize, column: usize) -> f64 {
        self.probs[(star, column)]
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.probs
    }

    pub fn row(&self, star: usize) -> Vec<f64> {
        self.probs.row(star).iter().copied().collect()
    }

    pub fn column(&self, column: usize) -> Vec<f64> {
        self.probs.column(column).iter().copied().collect()
    }

    /// Expected number of members per column.
    pub fn column_sums(&self) -> Vec<f64> {
        self.probs.column_iter().map(|c| c.sum()).collect()
    }

    /// Membership fraction of each component column (background excluded).
    pub fn component_fractions(&self) -> Vec<f64> {
        let n = self.n_stars().max(1) as f64;
        self.column_sums()
            .into_iter()
            .take(self.n_components)
            .map(|s| s / n)
            .collect()
    }

    /// Column with the highest probability for a star.
    pub fn dominant(&self, star: usize) -> usize {
        let row = self.probs.row(star);
        let mut best = 0;
        for j in 1..row.len() {
            if row[j] > row[best] {
                best = j;
            }
        }
        best
    }

    /// Largest absolute per-entry difference; infinite if shapes differ.
    pub fn max_abs_diff(&self, other: &MembershipWeights) -> f64 {
        if self.probs.shape() != other.probs.shape() {
            return f64::INFINITY;
        }
        (&self.probs - &other.probs).amax()
    }

    /// Largest absolute difference restricted to one column.
    pub fn column_abs_diff(&self, other: &MembershipWeights, column: usize) -> f64 {
        if self.probs.nrows() != other.probs.nrows()
            || column >= self.probs.ncols()
            || column >= other.probs.ncols()
        {
            return f64::INFINITY;
        }
        (self.probs.column(column) - other.probs.column(column)).amax()
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.n_stars()).map(|i| self.row(i)).collect()
    }
}
