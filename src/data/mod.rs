//! Star data: validated datasets and synthetic samples.

pub mod dataset;
pub mod synth;

pub use dataset::*;
pub use synth::*;
