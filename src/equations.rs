//! Observation equations: model values, analytic partials, misclosures.
//!
//! Each observation kind is evaluated from the coordinates of the stations it
//! references.  [`evaluate`] is a pure function of those points (plus the
//! orientation of a direction set); [`build_system`] maps the per-station
//! gradients onto design-matrix columns and stacks one row per observation.
//!
//! Sign conventions: Δ = target − station, azimuth = atan2(Δy, Δx) in
//! [0, 2π), zenith = atan2(hd, Δz), vertical angle = atan2(Δz, hd).  The
//! misclosure is ℓ − f(x₀), wrapped into (−π, π] for angular kinds.

use crate::angles::{normalize_azimuth, wrap_difference};
use crate::network::Network;
use crate::types::*;
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Geometry kernel
// ─────────────────────────────────────────────────────────────

/// Coordinate differences of a directed line.
#[derive(Debug, Clone, Copy)]
struct Line {
    dx: f64,
    dy: f64,
    dz: f64,
    /// Horizontal length.
    hd: f64,
    /// Slope length.
    sd: f64,
}

impl Line {
    fn new(from: [f64; 3], to: [f64; 3]) -> Self {
        let dx = to[0] - from[0];
        let dy = to[1] - from[1];
        let dz = to[2] - from[2];
        let hd = dx.hypot(dy);
        Self { dx, dy, dz, hd, sd: hd.hypot(dz) }
    }
}

fn degenerate(id: &str, reason: &'static str) -> AdjustmentError {
    AdjustmentError::DegenerateGeometry { observation: id.to_string(), reason }
}

/// Azimuth of the line `from → to` and its gradient with respect to `to`.
fn azimuth_with_gradient(id: &str, line: &Line) -> Result<(f64, [f64; 3]), AdjustmentError> {
    if line.hd < DEGENERATE_LENGTH {
        return Err(degenerate(id, "coincident stations in plan"));
    }
    let d2 = line.hd * line.hd;
    let az = normalize_azimuth(line.dy.atan2(line.dx));
    Ok((az, [-line.dy / d2, line.dx / d2, 0.0]))
}

/// Azimuth of `from → to` in [0, 2π).
pub fn azimuth(id: &str, from: [f64; 3], to: [f64; 3]) -> Result<f64, AdjustmentError> {
    azimuth_with_gradient(id, &Line::new(from, to)).map(|(az, _)| az)
}

fn negate(g: [f64; 3]) -> [f64; 3] {
    [-g[0], -g[1], -g[2]]
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

// ─────────────────────────────────────────────────────────────
//  Evaluation
// ─────────────────────────────────────────────────────────────

/// Model value of one observation and its partial derivatives.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    /// ∂f/∂(x, y, z) of each referenced station, in reference order.
    pub gradients: Vec<[f64; 3]>,
    /// ∂f/∂ω for direction observations, zero otherwise.
    pub orientation_partial: f64,
}

impl Evaluation {
    fn two_point(value: f64, target_gradient: [f64; 3]) -> Self {
        Self {
            value,
            gradients: vec![negate(target_gradient), target_gradient],
            orientation_partial: 0.0,
        }
    }
}

/// Evaluate an observation of `kind` at `points` (one per referenced
/// station).  `orientation` is only read for directions.
pub fn evaluate(
    id: &str,
    kind: ObservationKind,
    points: &[[f64; 3]],
    orientation: f64,
) -> Result<Evaluation, AdjustmentError> {
    if points.len() != kind.arity() {
        return Err(AdjustmentError::ArityMismatch {
            observation: id.to_string(),
            expected: kind.arity(),
            found: points.len(),
        });
    }

    // station → target; unused by single-station and three-station kinds
    let line = Line::new(points[0], points.get(1).copied().unwrap_or(points[0]));
    let eval = match kind {
        ObservationKind::Coordinate { axis } => {
            let mut g = [0.0; 3];
            g[axis.index()] = 1.0;
            Evaluation {
                value: points[0][axis.index()],
                gradients: vec![g],
                orientation_partial: 0.0,
            }
        }
        ObservationKind::HorizontalAngle => {
            let (at, from, to) = (points[0], points[1], points[2]);
            let (az_back, g_back) = azimuth_with_gradient(id, &Line::new(at, from))?;
            let (az_fore, g_fore) = azimuth_with_gradient(id, &Line::new(at, to))?;
            Evaluation {
                value: normalize_azimuth(az_fore - az_back),
                gradients: vec![sub(g_back, g_fore), negate(g_back), g_fore],
                orientation_partial: 0.0,
            }
        }
        ObservationKind::HorizontalDistance => {
            if line.hd < DEGENERATE_LENGTH {
                return Err(degenerate(id, "zero horizontal distance"));
            }
            Evaluation::two_point(line.hd, [line.dx / line.hd, line.dy / line.hd, 0.0])
        }
        ObservationKind::SlopeDistance => {
            if line.sd < DEGENERATE_LENGTH {
                return Err(degenerate(id, "zero slope distance"));
            }
            Evaluation::two_point(line.sd, [line.dx / line.sd, line.dy / line.sd, line.dz / line.sd])
        }
        ObservationKind::Azimuth => {
            let (az, g) = azimuth_with_gradient(id, &line)?;
            Evaluation::two_point(az, g)
        }
        ObservationKind::Direction { .. } => {
            let (az, g) = azimuth_with_gradient(id, &line)?;
            let mut e = Evaluation::two_point(normalize_azimuth(az - orientation), g);
            e.orientation_partial = -1.0;
            e
        }
        ObservationKind::ZenithAngle | ObservationKind::VerticalAngle => {
            if line.hd < DEGENERATE_LENGTH {
                return Err(degenerate(id, "vertical line of sight"));
            }
            let s2 = line.sd * line.sd;
            let k = line.dz / (line.hd * s2);
            let g = [line.dx * k, line.dy * k, -line.hd / s2];
            let zenith = line.hd.atan2(line.dz);
            if kind == ObservationKind::ZenithAngle {
                Evaluation::two_point(zenith, g)
            } else {
                Evaluation::two_point(std::f64::consts::FRAC_PI_2 - zenith, negate(g))
            }
        }
        ObservationKind::HeightDifference => Evaluation::two_point(line.dz, [0.0, 0.0, 1.0]),
        ObservationKind::CoordinateDifference { axis } => {
            let mut g = [0.0; 3];
            g[axis.index()] = 1.0;
            let d = [line.dx, line.dy, line.dz];
            Evaluation::two_point(d[axis.index()], g)
        }
    };
    Ok(eval)
}

/// ℓ − f, wrapped for angular kinds.
pub fn misclosure(kind: ObservationKind, observed: f64, computed: f64) -> f64 {
    let d = observed - computed;
    if kind.is_angular() { wrap_difference(d) } else { d }
}

// ─────────────────────────────────────────────────────────────
//  Linear system
// ─────────────────────────────────────────────────────────────

/// Linearised model A·dx ≈ ℓ − f(x₀) with weights P.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    /// Design matrix A, CSR, one row per observation.
    pub design: CsMat<f64>,
    /// ℓ − f(x₀).
    pub misclosure: Vec<f64>,
    /// f(x₀).
    pub computed: Vec<f64>,
    /// Diagonal of P.
    pub weights: Vec<f64>,
}

impl LinearSystem {
    pub fn num_observations(&self) -> usize {
        self.misclosure.len()
    }

    pub fn num_unknowns(&self) -> usize {
        self.design.cols()
    }

    /// A·x, one entry per observation.
    pub fn design_times(&self, x: &[f64]) -> Vec<f64> {
        self.design
            .outer_iterator()
            .map(|row| row.iter().map(|(col, &a)| a * x[col]).sum())
            .collect()
    }

    /// Σ pᵢ(aᵢx − ℓᵢ)², the weighted square sum of the linearised residuals.
    pub fn weighted_square_sum(&self, x: &[f64]) -> f64 {
        self.design_times(x)
            .iter()
            .zip(&self.misclosure)
            .zip(&self.weights)
            .map(|((ax, l), p)| p * (ax - l).powi(2))
            .sum()
    }
}

/// Linearise every observation of `network` at its current coordinates.
pub fn build_system(network: &Network, weights: &[f64]) -> Result<LinearSystem, AdjustmentError> {
    let m = network.num_observations();
    let n = network.num_unknowns();
    let mut tri = TriMat::new((m, n));
    let mut misclosures = Vec::with_capacity(m);
    let mut computed = Vec::with_capacity(m);

    for (i, obs) in network.observations().iter().enumerate() {
        let links = network.links(i);
        let points: Vec<[f64; 3]> = links.iter().map(|&s| network.stations()[s].point).collect();
        let eval = evaluate(&obs.id, obs.kind, &points, network.orientation_value(i))?;

        for (&station, g) in links.iter().zip(&eval.gradients) {
            for axis in Axis::ALL {
                let v = g[axis.index()];
                if v == 0.0 {
                    continue;
                }
                if let Some(col) = network.coordinate_column(station, axis) {
                    tri.add_triplet(i, col, v);
                }
            }
        }
        if let Some(col) = network.orientation_column(i) {
            tri.add_triplet(i, col, eval.orientation_partial);
        }

        misclosures.push(misclosure(obs.kind, obs.value, eval.value));
        computed.push(eval.value);
    }

    Ok(LinearSystem {
        design: tri.to_csr(),
        misclosure: misclosures,
        computed,
        weights: weights.to_vec(),
    })
}
