//! Input/output helpers.
//!
//! - dataset JSON read/write (`dataset`)
//! - fitted mixture exports (JSON report, membership CSV) (`export`)

pub mod dataset;
pub mod export;

pub use dataset::*;
pub use export::*;
