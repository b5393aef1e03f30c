//! Finite-difference checks of the analytic observation partials.
//!
//! Every observation kind is evaluated at a fixed set of well-separated
//! points and each component of the analytic gradient is compared against a
//! central-difference estimate:
//!
//!     ∂f/∂pᵢ  ≈  [ f(p + h eᵢ) − f(p − h eᵢ) ] / 2h
//!
//! The points are chosen so that no azimuth lies near the 0 / 2π seam and
//! no line of sight is vertical.

use survnet::equations::{evaluate, misclosure};
use survnet::types::*;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

const STATION: [f64; 3] = [1000.0, 2000.0, 100.0];
const TARGET: [f64; 3] = [1350.0, 2240.0, 112.5];
const THIRD: [f64; 3] = [1120.0, 2480.0, 95.0];

fn points_for(kind: ObservationKind) -> Vec<[f64; 3]> {
    match kind.arity() {
        1 => vec![TARGET],
        2 => vec![STATION, TARGET],
        _ => vec![STATION, TARGET, THIRD],
    }
}

/// Compare every analytic partial of `kind` against central differences.
fn fd_check(kind: ObservationKind, orientation: f64, h: f64, tol: f64) {
    let points = points_for(kind);
    let analytic = evaluate("fd", kind, &points, orientation).unwrap();
    assert_eq!(analytic.gradients.len(), points.len());

    for s in 0..points.len() {
        for a in 0..3 {
            let mut plus = points.clone();
            let mut minus = points.clone();
            plus[s][a] += h;
            minus[s][a] -= h;
            let fp = evaluate("fd", kind, &plus, orientation).unwrap().value;
            let fm = evaluate("fd", kind, &minus, orientation).unwrap().value;
            // difference through misclosure so angular seams wrap correctly
            let fd = -misclosure(kind, fm, fp) / (2.0 * h);
            let an = analytic.gradients[s][a];
            let scale = an.abs().max(1e-6);
            assert!(
                (fd - an).abs() <= tol * scale,
                "{kind:?}: station {s} axis {a}: analytic {an:.9e} vs fd {fd:.9e}"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Per-kind checks
// ─────────────────────────────────────────────────────────────

#[test]
fn horizontal_distance_partials() {
    fd_check(ObservationKind::HorizontalDistance, 0.0, 1e-4, 1e-6);
}

#[test]
fn slope_distance_partials() {
    fd_check(ObservationKind::SlopeDistance, 0.0, 1e-4, 1e-6);
}

#[test]
fn azimuth_partials() {
    fd_check(ObservationKind::Azimuth, 0.0, 1e-4, 1e-6);
}

#[test]
fn direction_partials() {
    fd_check(ObservationKind::Direction { set: 0 }, 0.75, 1e-4, 1e-6);
}

#[test]
fn horizontal_angle_partials() {
    fd_check(ObservationKind::HorizontalAngle, 0.0, 1e-4, 1e-6);
}

#[test]
fn zenith_angle_partials() {
    fd_check(ObservationKind::ZenithAngle, 0.0, 1e-4, 1e-5);
}

#[test]
fn vertical_angle_partials() {
    fd_check(ObservationKind::VerticalAngle, 0.0, 1e-4, 1e-5);
}

#[test]
fn height_difference_partials() {
    fd_check(ObservationKind::HeightDifference, 0.0, 1e-4, 1e-8);
}

#[test]
fn coordinate_difference_partials() {
    for axis in Axis::ALL {
        fd_check(ObservationKind::CoordinateDifference { axis }, 0.0, 1e-4, 1e-8);
    }
}

#[test]
fn coordinate_partials() {
    for axis in Axis::ALL {
        fd_check(ObservationKind::Coordinate { axis }, 0.0, 1e-4, 1e-8);
    }
}

#[test]
fn direction_orientation_partial() {
    let kind = ObservationKind::Direction { set: 0 };
    let points = points_for(kind);
    let h = 1e-6;
    let e = evaluate("fd", kind, &points, 0.75).unwrap();
    let fp = evaluate("fd", kind, &points, 0.75 + h).unwrap().value;
    let fm = evaluate("fd", kind, &points, 0.75 - h).unwrap().value;
    let fd = -misclosure(kind, fm, fp) / (2.0 * h);
    assert!((fd - e.orientation_partial).abs() < 1e-6, "fd {fd} vs {}", e.orientation_partial);
    assert_eq!(e.orientation_partial, -1.0);
}

// ─────────────────────────────────────────────────────────────
//  Values and conventions
// ─────────────────────────────────────────────────────────────

#[test]
fn model_values_follow_conventions() {
    let a = [0.0, 0.0, 0.0];
    let b = [3.0, 4.0, 12.0];

    let hd = evaluate("d", ObservationKind::HorizontalDistance, &[a, b], 0.0).unwrap();
    assert!((hd.value - 5.0).abs() < 1e-12);

    let sd = evaluate("s", ObservationKind::SlopeDistance, &[a, b], 0.0).unwrap();
    assert!((sd.value - 13.0).abs() < 1e-12);

    // azimuth is reckoned from +x towards +y
    let az = evaluate("az", ObservationKind::Azimuth, &[a, [0.0, 10.0, 0.0]], 0.0).unwrap();
    assert!((az.value - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    let az = evaluate("az", ObservationKind::Azimuth, &[a, [0.0, -10.0, 0.0]], 0.0).unwrap();
    assert!((az.value - 1.5 * std::f64::consts::PI).abs() < 1e-12);

    let z = evaluate("z", ObservationKind::ZenithAngle, &[a, b], 0.0).unwrap();
    let v = evaluate("v", ObservationKind::VerticalAngle, &[a, b], 0.0).unwrap();
    assert!((z.value + v.value - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    assert!((z.value - (5.0_f64).atan2(12.0)).abs() < 1e-12);

    let dh = evaluate("h", ObservationKind::HeightDifference, &[a, b], 0.0).unwrap();
    assert!((dh.value - 12.0).abs() < 1e-12);
}

#[test]
fn angle_misclosure_wraps_across_north() {
    let kind = ObservationKind::Azimuth;
    let tiny = 1e-5;
    // observed just past 2π, computed just above zero
    let w = misclosure(kind, 2.0 * std::f64::consts::PI - tiny, tiny);
    assert!((w + 2.0 * tiny).abs() < 1e-12, "wrapped misclosure {w}");

    // distances never wrap
    let d = misclosure(ObservationKind::HorizontalDistance, 10.0, 3.0);
    assert_eq!(d, 7.0);
}

#[test]
fn coincident_stations_are_degenerate() {
    let p = [10.0, 20.0, 30.0];
    for kind in [
        ObservationKind::HorizontalDistance,
        ObservationKind::Azimuth,
        ObservationKind::Direction { set: 0 },
        ObservationKind::ZenithAngle,
    ] {
        let err = evaluate("bad", kind, &[p, p], 0.0).unwrap_err();
        match err {
            AdjustmentError::DegenerateGeometry { observation, .. } => assert_eq!(observation, "bad"),
            other => panic!("{kind:?}: expected DegenerateGeometry, got {other}"),
        }
    }

    // a purely vertical line still has a slope distance and a height difference
    let above = [10.0, 20.0, 40.0];
    assert!(evaluate("s", ObservationKind::SlopeDistance, &[p, above], 0.0).is_ok());
    assert!(evaluate("z", ObservationKind::ZenithAngle, &[p, above], 0.0).is_err());
}

#[test]
fn wrong_point_count_is_rejected() {
    let err = evaluate("a", ObservationKind::HorizontalAngle, &[STATION, TARGET], 0.0).unwrap_err();
    assert!(matches!(err, AdjustmentError::ArityMismatch { expected: 3, found: 2, .. }));
}
