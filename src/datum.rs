//! Datum defect of free networks and the constraints used to remove it.
//!
//! A network without fixed or controlled stations can be translated (and,
//! depending on what was measured, rotated about the vertical and scaled)
//! without changing any observation.  Each such motion is a null vector of
//! the normal matrix.  [`datum_constraints`] evaluates them at the current
//! approximate coordinates, so they are exact for the linearisation of the
//! same iteration.
//!
//! The datum is defined by a weighted set of tie coordinates S: the solution
//! satisfies GᵀS·dx = 0, which makes it the one of least S-weighted shift.
//! With every weight equal to one this is the classic inner-constraint
//! (minimum-norm) solution.
//!
//! Scale is split by direction in spatial networks.  Horizontal angles with
//! height differences leave the plan scale free but fix the vertical one;
//! angles alone leave a single uniform scale.  Only the vertical rotation is
//! modelled; a spatial network measured with slope distances alone also
//! tilts freely, which surfaces as a singular normal matrix rather than
//! being absorbed here.

use crate::network::{Network, Unknown};
use crate::types::*;
use ndarray::Array2;

/// A scale motion left undetermined by the observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// All coordinates about the centroid.
    Uniform,
    /// Plan coordinates only.
    Horizontal,
    /// Heights only.
    Vertical,
}

/// Which rigid-body and scale motions the observations leave undetermined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumDefect {
    pub translations: Vec<Axis>,
    /// Rotation about the vertical axis.
    pub rotation: bool,
    pub scales: Vec<Scale>,
}

impl DatumDefect {
    pub fn detect(dimension: Dimension, observations: &[Observation]) -> Self {
        use ObservationKind as K;
        let any = |pred: &dyn Fn(ObservationKind) -> bool| observations.iter().any(|o| pred(o.kind));

        let orients = any(&|k| matches!(k, K::Azimuth | K::CoordinateDifference { axis: Axis::X | Axis::Y }));
        let fixes_horizontal = any(&|k| {
            matches!(
                k,
                K::HorizontalDistance
                    | K::SlopeDistance
                    | K::ZenithAngle
                    | K::VerticalAngle
                    | K::CoordinateDifference { axis: Axis::X | Axis::Y }
            )
        });
        let fixes_vertical = any(&|k| {
            matches!(
                k,
                K::SlopeDistance
                    | K::HeightDifference
                    | K::ZenithAngle
                    | K::VerticalAngle
                    | K::CoordinateDifference { axis: Axis::Z }
            )
        });
        let fixes_uniform = any(&|k| {
            matches!(
                k,
                K::HorizontalDistance | K::SlopeDistance | K::HeightDifference | K::CoordinateDifference { .. }
            )
        });

        let scales = match dimension {
            Dimension::Leveling => vec![],
            Dimension::Planar if fixes_horizontal => vec![],
            Dimension::Planar => vec![Scale::Uniform],
            Dimension::Spatial => match (!fixes_horizontal, !fixes_vertical) {
                (true, true) => vec![Scale::Horizontal, Scale::Vertical],
                _ if !fixes_uniform => vec![Scale::Uniform],
                (true, false) => vec![Scale::Horizontal],
                (false, true) => vec![Scale::Vertical],
                (false, false) => vec![],
            },
        };

        Self {
            translations: dimension.axes().to_vec(),
            rotation: dimension.has_horizontal() && !orients,
            scales,
        }
    }

    pub fn count(&self) -> usize {
        self.translations.len() + usize::from(self.rotation) + self.scales.len()
    }

    /// Fewest stations that can pin this defect down.
    pub fn min_datum_stations(&self) -> usize {
        if self.rotation || !self.scales.is_empty() { 2 } else { 1 }
    }
}

/// Null-space basis G of the datum, normalised so that GᵀSG = I, and the
/// constraint matrix C = S·G.
#[derive(Debug, Clone)]
pub struct DatumConstraints {
    pub basis: Array2<f64>,
    pub constraints: Array2<f64>,
}

impl DatumConstraints {
    pub fn rank(&self) -> usize {
        self.basis.ncols()
    }
}

/// Datum constraints at the current coordinates, with `weights` the diagonal
/// of S (one entry per unknown column).
///
/// Null vectors without weight on any datum coordinate, or dependent on
/// earlier ones, are dropped, so the rank may fall short of
/// [`DatumDefect::count`].
pub fn datum_constraints(network: &Network, defect: &DatumDefect, weights: &[f64]) -> DatumConstraints {
    let n = network.num_unknowns();
    let stations = network.stations();
    let unknowns = network.unknowns();

    // Weighted centroid of the datum coordinates, per axis.
    let mut sum = [0.0; 3];
    let mut total = [0.0; 3];
    for (col, u) in unknowns.iter().enumerate() {
        if let Unknown::Coordinate { station, axis } = *u {
            let a = axis.index();
            sum[a] += weights[col] * stations[station].point[a];
            total[a] += weights[col];
        }
    }
    let centroid = [0, 1, 2].map(|a| if total[a] > 0.0 { sum[a] / total[a] } else { 0.0 });
    let offset = |station: usize, axis: Axis| stations[station].point[axis.index()] - centroid[axis.index()];

    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(defect.count());

    for &axis in &defect.translations {
        let g = unknowns
            .iter()
            .map(|u| match *u {
                Unknown::Coordinate { axis: a, .. } if a == axis => 1.0,
                _ => 0.0,
            })
            .collect();
        columns.push(g);
    }

    if defect.rotation {
        let g = unknowns
            .iter()
            .map(|u| match *u {
                Unknown::Coordinate { station, axis: Axis::X } => offset(station, Axis::Y),
                Unknown::Coordinate { station, axis: Axis::Y } => -offset(station, Axis::X),
                Unknown::Coordinate { axis: Axis::Z, .. } => 0.0,
                Unknown::Orientation { .. } => -1.0,
            })
            .collect();
        columns.push(g);
    }

    for &scale in &defect.scales {
        let g = unknowns
            .iter()
            .map(|u| match (*u, scale) {
                (Unknown::Orientation { .. }, _) => 0.0,
                (Unknown::Coordinate { axis: Axis::Z, .. }, Scale::Horizontal) => 0.0,
                (Unknown::Coordinate { axis: Axis::X | Axis::Y, .. }, Scale::Vertical) => 0.0,
                (Unknown::Coordinate { station, axis }, _) => offset(station, axis),
            })
            .collect();
        columns.push(g);
    }

    let basis = orthonormalize(columns, weights, n);
    let mut constraints = basis.clone();
    for (mut row, &w) in constraints.rows_mut().into_iter().zip(weights) {
        row *= w;
    }
    DatumConstraints { basis, constraints }
}

/// Modified Gram–Schmidt under ⟨a, b⟩ = Σ sᵢaᵢbᵢ; dependent columns are
/// discarded.
fn orthonormalize(columns: Vec<Vec<f64>>, weights: &[f64], n: usize) -> Array2<f64> {
    let dot = |a: &[f64], b: &[f64]| -> f64 { a.iter().zip(b).zip(weights).map(|((x, y), s)| s * x * y).sum() };

    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(columns.len());
    for mut g in columns {
        let original = dot(&g, &g).sqrt();
        if original == 0.0 {
            continue;
        }
        for b in &basis {
            let d = dot(&g, b);
            for (x, y) in g.iter_mut().zip(b) {
                *x -= d * y;
            }
        }
        let residual = dot(&g, &g).sqrt();
        if residual <= 1e-10 * original {
            continue;
        }
        for x in &mut g {
            *x /= residual;
        }
        basis.push(g);
    }

    let mut out = Array2::<f64>::zeros((n, basis.len()));
    for (j, b) in basis.iter().enumerate() {
        for (i, &v) in b.iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    out
}
