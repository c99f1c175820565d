//! Domain types used throughout the crate.
//!
//! This module defines:
//!
//! - star measurements (`StarMeasurement`)
//! - configuration objects (`FitConfig`, `EmConfig`, `PriorConfig`, `BackgroundMode`)
//! - small result records (`FitStatus`, `MedianSpan`) and `MembershipWeights`

pub mod types;

pub use types::*;
