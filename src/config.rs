//! Immutable adjustment configuration.
//!
//! Built once by the caller, validated once at the start of an adjustment
//! and shared read-only by every stage afterwards.

use crate::angles::AngleUnit;
use crate::robust::WeightFunction;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// How observation weights are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    /// Unit weights; a priori sigmas are ignored.
    Ordinary,
    /// p = σ₀² / σ².
    #[default]
    Weighted,
    /// Weighted, followed by iteratively reweighted passes.
    Robust,
}

/// A priori standard deviations used for observations that carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmaDefaults {
    /// Horizontal and slope distances.
    pub distance: f64,
    pub height_difference: f64,
    /// GNSS baseline components.
    pub coordinate_difference: f64,
    /// Weighted control coordinates.
    pub coordinate: f64,
    /// Every angular kind, radians.
    pub angle: f64,
}

impl Default for SigmaDefaults {
    fn default() -> Self {
        Self {
            distance: 0.01,
            height_difference: 0.01,
            coordinate_difference: 0.001,
            coordinate: 0.01,
            angle: AngleUnit::Gradians.to_radians(0.0020),
        }
    }
}

impl SigmaDefaults {
    pub fn for_kind(&self, kind: ObservationKind) -> f64 {
        match kind {
            ObservationKind::HorizontalDistance | ObservationKind::SlopeDistance => self.distance,
            ObservationKind::HeightDifference => self.height_difference,
            ObservationKind::CoordinateDifference { .. } => self.coordinate_difference,
            ObservationKind::Coordinate { .. } => self.coordinate,
            ObservationKind::Azimuth
            | ObservationKind::Direction { .. }
            | ObservationKind::HorizontalAngle
            | ObservationKind::ZenithAngle
            | ObservationKind::VerticalAngle => self.angle,
        }
    }

    fn validate(&self) -> Result<(), AdjustmentError> {
        let all = [
            ("distance", self.distance),
            ("height_difference", self.height_difference),
            ("coordinate_difference", self.coordinate_difference),
            ("coordinate", self.coordinate),
            ("angle", self.angle),
        ];
        for (name, v) in all {
            if !(v.is_finite() && v > 0.0) {
                return Err(AdjustmentError::InvalidConfig(format!(
                    "default sigma for {name} must be positive, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Options for the iteratively reweighted outer loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustOptions {
    pub method: WeightFunction,
    /// Cap on full re-adjustments.
    pub max_passes: usize,
    /// Weights are stable once no factor changes by more than this.
    pub weight_tolerance: f64,
}

impl Default for RobustOptions {
    fn default() -> Self {
        Self {
            method: WeightFunction::default(),
            max_passes: DEFAULT_MAX_REWEIGHT_PASSES,
            weight_tolerance: DEFAULT_WEIGHT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentConfig {
    pub mode: AdjustmentMode,
    /// Only consulted in [`AdjustmentMode::Robust`] or with a `datum_method`.
    pub robust: RobustOptions,
    /// Largest absolute coordinate correction accepted as converged.
    pub convergence_threshold: f64,
    pub max_iterations: usize,
    /// Consecutive growing corrections tolerated before aborting.
    pub divergence_window: usize,
    /// Confidence level of the global and local tests, e.g. 0.95.
    pub confidence_level: f64,
    /// σ₀², the a priori variance factor.
    pub a_priori_variance: f64,
    /// Permit a network without fixed or controlled stations; solved with
    /// inner constraints on the datum stations.
    pub free_network: bool,
    /// Stations whose coordinates define the datum of a free network.
    /// Empty means every station; ignored for constrained networks.
    pub datum_stations: Vec<String>,
    /// Reweights the datum stations of a free network from their shifts
    /// against the approximations, so stations that moved stop defining it.
    /// Pass cap and tolerance are shared with `robust`.
    pub datum_method: Option<WeightFunction>,
    /// Redundancy numbers below this mark an observation as uncontrolled.
    pub min_redundancy: f64,
    pub sigma_defaults: SigmaDefaults,
}

impl Default for AdjustmentConfig {
    fn default() -> Self {
        Self {
            mode: AdjustmentMode::default(),
            robust: RobustOptions::default(),
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            divergence_window: DEFAULT_DIVERGENCE_WINDOW,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            a_priori_variance: 1.0,
            free_network: false,
            datum_stations: Vec::new(),
            datum_method: None,
            min_redundancy: DEFAULT_MIN_REDUNDANCY,
            sigma_defaults: SigmaDefaults::default(),
        }
    }
}

impl AdjustmentConfig {
    pub fn ordinary() -> Self {
        Self { mode: AdjustmentMode::Ordinary, ..Self::default() }
    }

    pub fn robust(method: WeightFunction) -> Self {
        Self {
            mode: AdjustmentMode::Robust,
            robust: RobustOptions { method, ..RobustOptions::default() },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AdjustmentError> {
        let bad = |msg: String| Err(AdjustmentError::InvalidConfig(msg));

        if !(self.convergence_threshold.is_finite() && self.convergence_threshold > 0.0) {
            return bad(format!("convergence_threshold must be positive, got {}", self.convergence_threshold));
        }
        if self.max_iterations == 0 {
            return bad("max_iterations must be at least 1".into());
        }
        if self.divergence_window == 0 {
            return bad("divergence_window must be at least 1".into());
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return bad(format!("confidence_level must lie in (0, 1), got {}", self.confidence_level));
        }
        if !(self.a_priori_variance.is_finite() && self.a_priori_variance > 0.0) {
            return bad(format!("a_priori_variance must be positive, got {}", self.a_priori_variance));
        }
        if !(self.min_redundancy.is_finite() && (0.0..1.0).contains(&self.min_redundancy)) {
            return bad(format!("min_redundancy must lie in [0, 1), got {}", self.min_redundancy));
        }
        self.sigma_defaults.validate()?;

        let reweights = self.mode == AdjustmentMode::Robust || self.datum_method.is_some();
        if reweights {
            if self.robust.max_passes == 0 {
                return bad("robust.max_passes must be at least 1".into());
            }
            if !(self.robust.weight_tolerance.is_finite() && self.robust.weight_tolerance > 0.0) {
                return bad(format!(
                    "robust.weight_tolerance must be positive, got {}",
                    self.robust.weight_tolerance
                ));
            }
        }
        if self.mode == AdjustmentMode::Robust {
            self.robust.method.validate()?;
        }
        if let Some(method) = &self.datum_method {
            method.validate()?;
        }
        Ok(())
    }

    /// σ₀ used when standardising residuals.
    pub fn a_priori_sigma(&self) -> f64 {
        self.a_priori_variance.sqrt()
    }
}
