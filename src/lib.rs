//! `kinefit` library crate.
//!
//! Fits a mixture of kinematic components (plus an optional field background)
//! to 6D star measurements, where each component is a Gaussian origin traced
//! forward in time by a pluggable orbit tracer.
//!
//! Layout:
//!
//! - `math`: Gaussian overlaps and small statistics helpers
//! - `models`: component parametrisations and orbit tracing
//! - `fit`: single-component fitting (ensemble MCMC or multistart Nelder-Mead)
//! - `em`: memberships, fixed-k EM and the component-count search
//! - `data`, `io`, `report`: datasets, persistence and summaries

pub mod data;
pub mod domain;
pub mod em;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;

pub use error::FitError;
