//! Kinematic component model and the orbit-tracing interface.
//!
//! Components are a closed set of parametrisations (`ComponentKind`); adding a
//! new one means adding a variant and its match arms here.

pub mod component;
pub mod orbit;

pub use component::*;
pub use orbit::*;
