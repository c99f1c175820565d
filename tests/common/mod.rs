#![allow(dead_code)]

use kinefit::data::{BackgroundBox, MeasurementNoise, SyntheticCluster, SyntheticSample, generate_sample};
use kinefit::domain::{ComponentKind, MedianSpan, MembershipWeights};
use kinefit::models::{Component, TraceOrbit};

pub const NOISE: MeasurementNoise = MeasurementNoise {
    position_sd: 0.5,
    velocity_sd: 0.1,
};

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Sphere component from external parameters `x y z u v w dx dv age`.
pub fn sphere(external: [f64; 9]) -> Component {
    Component::from_external(ComponentKind::Sphere, &external).unwrap()
}

pub fn cluster(external: [f64; 9], n_stars: usize) -> SyntheticCluster {
    SyntheticCluster {
        component: sphere(external),
        n_stars,
    }
}

pub fn sample(
    clusters: &[SyntheticCluster],
    orbit: &dyn TraceOrbit,
    background: Option<&BackgroundBox>,
    seed: u64,
) -> SyntheticSample {
    generate_sample(clusters, orbit, NOISE, background, seed).unwrap()
}

/// Fraction of labelled (cluster) stars whose dominant column is
/// `mapping[label]`.
pub fn dominant_agreement(memberships: &MembershipWeights, labels: &[Option<usize>], mapping: &[usize]) -> f64 {
    let mut total = 0usize;
    let mut hits = 0usize;
    for (i, label) in labels.iter().enumerate() {
        if let Some(l) = label {
            total += 1;
            if memberships.dominant(i) == mapping[*l] {
                hits += 1;
            }
        }
    }
    hits as f64 / total.max(1) as f64
}

/// Distance from the median to `truth` in units of the half-span.
pub fn half_spans_from_median(truth: f64, ms: &MedianSpan) -> f64 {
    let half_span = 0.5 * (ms.upper - ms.lower);
    let offset = (truth - ms.median).abs();
    if half_span > 0.0 {
        offset / half_span
    } else if offset == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}
