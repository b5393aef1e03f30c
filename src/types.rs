use serde::{Deserialize, Serialize};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, AdjustmentError>`
/// instead of panicking.  Conditions that still yield a usable result
/// (iteration cap, robust non-convergence) are reported as
/// [`AdjustmentWarning`] values instead.
#[derive(Debug)]
pub enum AdjustmentError {
    /// Linear algebra failure surfaced by `sprs` / `sprs-ldl`.
    Linalg(sprs::errors::LinalgError),
    /// Fewer independent observations than unknowns, or no datum.
    UnderdeterminedNetwork {
        observations: usize,
        unknowns: usize,
        datum_defect: usize,
        reason: &'static str,
    },
    /// Coincident stations or a zero-length line in one observation.
    DegenerateGeometry { observation: String, reason: &'static str },
    /// N is not positive definite after the datum has been applied.
    SingularNormalEquations {
        size: usize,
        rank_deficiency: usize,
        hint: &'static str,
    },
    /// The correction norm grew for too many consecutive iterations.
    Divergence { iteration: usize, correction_norm: f64 },
    /// An observation references a station id that does not exist.
    UnknownStation { observation: String, station: String },
    /// Two stations share the same id.
    DuplicateStation(String),
    /// Station count of an observation does not match its kind.
    ArityMismatch { observation: String, expected: usize, found: usize },
    /// Observation kind cannot be used in the network's dimension.
    IncompatibleObservation {
        observation: String,
        kind: &'static str,
        dimension: Dimension,
    },
    /// A priori standard deviation is not strictly positive and finite.
    InvalidSigma { observation: String, sigma: f64 },
    /// Measured value or approximate coordinate is NaN / infinite.
    InvalidValue(String),
    /// Configuration rejected by `AdjustmentConfig::validate`.
    InvalidConfig(String),
    /// A solve step produced NaN / Inf.
    NonFinite { stage: &'static str, iteration: usize },
    /// Every station is fixed and no direction set needs an orientation.
    NoUnknowns { observations: usize },
}

impl fmt::Display for AdjustmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linalg(e) => write!(f, "linear algebra error: {e}"),
            Self::UnderdeterminedNetwork { observations, unknowns, datum_defect, reason } => write!(
                f,
                "underdetermined network ({reason}): {observations} observations, \
                 {unknowns} unknowns, datum defect {datum_defect}"
            ),
            Self::DegenerateGeometry { observation, reason } =>
                write!(f, "degenerate geometry in observation '{observation}': {reason}"),
            Self::SingularNormalEquations { size, rank_deficiency, hint } => write!(
                f,
                "singular normal equations: rank deficiency {rank_deficiency} of {size} ({hint})"
            ),
            Self::Divergence { iteration, correction_norm } => write!(
                f,
                "adjustment diverged at iteration {iteration} (correction norm {correction_norm:.3e})"
            ),
            Self::UnknownStation { observation, station } =>
                write!(f, "observation '{observation}' references unknown station '{station}'"),
            Self::DuplicateStation(id) => write!(f, "duplicate station id '{id}'"),
            Self::ArityMismatch { observation, expected, found } => write!(
                f,
                "observation '{observation}' needs {expected} station(s), got {found}"
            ),
            Self::IncompatibleObservation { observation, kind, dimension } => write!(
                f,
                "observation '{observation}' of kind {kind} is not valid in a {dimension:?} network"
            ),
            Self::InvalidSigma { observation, sigma } =>
                write!(f, "observation '{observation}' has invalid standard deviation {sigma}"),
            Self::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::NonFinite { stage, iteration } =>
                write!(f, "non-finite values in {stage} at iteration {iteration}"),
            Self::NoUnknowns { observations } =>
                write!(f, "nothing to adjust: {observations} observations but every station is fixed"),
        }
    }
}

impl std::error::Error for AdjustmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for AdjustmentError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

// ─────────────────────────────────────────────────────────────
//  Warnings
// ─────────────────────────────────────────────────────────────

/// Non-fatal conditions attached to a successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdjustmentWarning {
    /// Iteration cap reached before the corrections fell below threshold.
    MaxIterationsExceeded { iterations: usize, max_correction: f64 },
    /// Robust weights had not settled when the pass cap was reached.
    RobustNonConvergence { passes: usize, max_weight_change: f64 },
    /// Residual cofactors came out negative (numerically) and were clamped.
    NegativeResidualVariance { observations: Vec<String> },
    /// Datum station weights of a free network had not settled at the pass cap.
    DatumNonConvergence { passes: usize, max_weight_change: f64 },
}

impl fmt::Display for AdjustmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxIterationsExceeded { iterations, max_correction } => write!(
                f,
                "maximum iterations ({iterations}) exceeded, last max correction {max_correction:.3e}"
            ),
            Self::RobustNonConvergence { passes, max_weight_change } => write!(
                f,
                "robust weights not stable after {passes} passes (max change {max_weight_change:.3e})"
            ),
            Self::NegativeResidualVariance { observations } => write!(
                f,
                "negative residual variance clamped for {} observation(s)",
                observations.len()
            ),
            Self::DatumNonConvergence { passes, max_weight_change } => write!(
                f,
                "datum station weights not stable after {passes} passes (max change {max_weight_change:.3e})"
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Lines shorter than this (in coordinate units) are treated as coincident points.
pub const DEGENERATE_LENGTH: f64 = 1e-9;

/// Lower bound applied to robust weight factors so P stays positive definite.
pub const MIN_WEIGHT_FACTOR: f64 = 1e-8;

pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 1e-3;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_DIVERGENCE_WINDOW: usize = 3;
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
pub const DEFAULT_MIN_REDUNDANCY: f64 = 1e-3;
pub const DEFAULT_MAX_REWEIGHT_PASSES: usize = 30;
pub const DEFAULT_WEIGHT_TOLERANCE: f64 = 1e-3;

// ─────────────────────────────────────────────────────────────
//  Axes and dimensions
// ─────────────────────────────────────────────────────────────

/// Coordinate axis.  Azimuths are reckoned from +x towards +y; z is height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Which coordinate axes carry unknowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    /// Heights only.
    Leveling,
    /// Horizontal x, y.
    Planar,
    /// Full x, y, z.
    Spatial,
}

impl Dimension {
    pub fn axes(self) -> &'static [Axis] {
        match self {
            Dimension::Leveling => &[Axis::Z],
            Dimension::Planar => &[Axis::X, Axis::Y],
            Dimension::Spatial => &Axis::ALL,
        }
    }

    pub fn contains(self, axis: Axis) -> bool {
        self.axes().contains(&axis)
    }

    pub fn has_horizontal(self) -> bool {
        !matches!(self, Dimension::Leveling)
    }
}

// ─────────────────────────────────────────────────────────────
//  Stations
// ─────────────────────────────────────────────────────────────

/// Surveyed point.  `point` holds the approximate coordinates on input and
/// the adjusted coordinates once an adjustment has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub point: [f64; 3],
    /// Fixed stations contribute no unknowns.
    #[serde(default)]
    pub fixed: bool,
}

impl Station {
    pub fn new(id: impl Into<String>, point: [f64; 3]) -> Self {
        Self { id: id.into(), point, fixed: false }
    }

    pub fn fixed(id: impl Into<String>, point: [f64; 3]) -> Self {
        Self { id: id.into(), point, fixed: true }
    }
}

// ─────────────────────────────────────────────────────────────
//  Observations
// ─────────────────────────────────────────────────────────────

/// Closed set of supported measurement kinds.
///
/// Angular values are radians.  Station order is `[station, target]` for
/// two-point kinds and `[at, from, to]` for horizontal angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationKind {
    HorizontalDistance,
    SlopeDistance,
    Azimuth,
    /// Horizontal direction in a set with an unknown orientation.
    Direction { set: u32 },
    HorizontalAngle,
    ZenithAngle,
    VerticalAngle,
    HeightDifference,
    /// One component of a GNSS baseline.
    CoordinateDifference { axis: Axis },
    /// Weighted control coordinate of a single station.
    Coordinate { axis: Axis },
}

impl ObservationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::HorizontalDistance => "horizontal distance",
            Self::SlopeDistance => "slope distance",
            Self::Azimuth => "azimuth",
            Self::Direction { .. } => "direction",
            Self::HorizontalAngle => "horizontal angle",
            Self::ZenithAngle => "zenith angle",
            Self::VerticalAngle => "vertical angle",
            Self::HeightDifference => "height difference",
            Self::CoordinateDifference { .. } => "coordinate difference",
            Self::Coordinate { .. } => "coordinate",
        }
    }

    /// Number of stations the observation references.
    pub fn arity(self) -> usize {
        match self {
            Self::Coordinate { .. } => 1,
            Self::HorizontalAngle => 3,
            _ => 2,
        }
    }

    /// Misclosures of angular kinds are wrapped into (−π, π].
    pub fn is_angular(self) -> bool {
        matches!(
            self,
            Self::Azimuth
                | Self::Direction { .. }
                | Self::HorizontalAngle
                | Self::ZenithAngle
                | Self::VerticalAngle
        )
    }

    pub fn supported_in(self, dim: Dimension) -> bool {
        match self {
            Self::HorizontalDistance
            | Self::Azimuth
            | Self::Direction { .. }
            | Self::HorizontalAngle => dim.has_horizontal(),
            Self::SlopeDistance | Self::ZenithAngle | Self::VerticalAngle => dim == Dimension::Spatial,
            Self::HeightDifference => dim.contains(Axis::Z),
            Self::CoordinateDifference { axis } | Self::Coordinate { axis } => dim.contains(axis),
        }
    }
}

/// One measurement linking one to three stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub kind: ObservationKind,
    pub stations: Vec<String>,
    pub value: f64,
    /// A priori standard deviation; falls back to `SigmaDefaults` when absent.
    #[serde(default)]
    pub sigma: Option<f64>,
}

impl Observation {
    pub fn new<S: AsRef<str>>(
        id: impl Into<String>,
        kind: ObservationKind,
        stations: &[S],
        value: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            stations: stations.iter().map(|s| s.as_ref().to_string()).collect(),
            value,
            sigma: None,
        }
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }
}
