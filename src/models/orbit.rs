//! Orbit tracing: map an origin phase-space point forward by an age.
//!
//! Fitting code only sees the `TraceOrbit` trait, so any integrator can be
//! plugged in. Two simple built-ins are provided for tests and quick runs.

use nalgebra::Vector6;

/// km/s expressed in pc/Myr.
pub const KMS_TO_PC_PER_MYR: f64 = 1.022_712_165_053_707_7;

/// Project an origin `(x, y, z, u, v, w)` forward by `age` Myr.
///
/// Implementations must be deterministic and safe to call from many threads.
pub trait TraceOrbit: Sync {
    fn trace(&self, origin: &Vector6<f64>, age: f64) -> Vector6<f64>;
}

/// No motion: the present-day point equals the origin.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityOrbit;

impl TraceOrbit for IdentityOrbit {
    fn trace(&self, origin: &Vector6<f64>, _age: f64) -> Vector6<f64> {
        *origin
    }
}

/// Straight-line motion at constant velocity (no potential).
#[derive(Debug, Clone, Copy, Default)]
pub struct BallisticOrbit;

impl TraceOrbit for BallisticOrbit {
    fn trace(&self, origin: &Vector6<f64>, age: f64) -> Vector6<f64> {
        let mut now = *origin;
        for i in 0..3 {
            now[i] += origin[i + 3] * age * KMS_TO_PC_PER_MYR;
        }
        now
    }
}

/// Adapter so a plain closure can act as an orbit tracer.
pub struct OrbitFn<F>(pub F);

impl<F> TraceOrbit for OrbitFn<F>
where
    F: Fn(&Vector6<f64>, f64) -> Vector6<f64> + Sync,
{
    fn trace(&self, origin: &Vector6<f64>, age: f64) -> Vector6<f64> {
        (self.0)(origin, age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ballistic_moves_positions_only() {
        let origin = Vector6::new(0.0, 10.0, -5.0, 1.0, 0.0, -2.0);
        let now = BallisticOrbit.trace(&origin, 10.0);
        assert_relative_eq!(now[0], 10.0 * KMS_TO_PC_PER_MYR, epsilon = 1e-12);
        assert_relative_eq!(now[1], 10.0);
        assert_relative_eq!(now[2], -5.0 - 20.0 * KMS_TO_PC_PER_MYR, epsilon = 1e-12);
        assert_eq!(now.fixed_rows::<3>(3), origin.fixed_rows::<3>(3));
    }

    #[test]
    fn zero_age_is_identity() {
        let origin = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        assert_eq!(BallisticOrbit.trace(&origin, 0.0), origin);
        assert_eq!(IdentityOrbit.trace(&origin, 30.0), origin);
    }

    #[test]
    fn closures_can_trace() {
        let shift = OrbitFn(|o: &Vector6<f64>, age: f64| o.add_scalar(age));
        let now = shift.trace(&Vector6::zeros(), 2.0);
        assert_eq!(now, Vector6::from_element(2.0));
    }
}
