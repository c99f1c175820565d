//! Mathematical utilities: Gaussian overlap integrals and small statistics helpers.

pub mod overlap;
pub mod stats;

pub use overlap::*;
pub use stats::*;
