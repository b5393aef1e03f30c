//! Angle units and normalisation helpers.
//!
//! Everything inside the engine is radians; [`AngleUnit`] converts at the
//! boundary for callers holding degrees or gradians (gon).

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngleUnit {
    Radians,
    Degrees,
    Gradians,
}

impl AngleUnit {
    /// Size of a full circle in this unit.
    pub fn full_circle(self) -> f64 {
        match self {
            AngleUnit::Radians => TAU,
            AngleUnit::Degrees => 360.0,
            AngleUnit::Gradians => 400.0,
        }
    }

    pub fn to_radians(self, value: f64) -> f64 {
        value * TAU / self.full_circle()
    }

    pub fn from_radians(self, value: f64) -> f64 {
        value * self.full_circle() / TAU
    }
}

/// Map an angle into [0, 2π).
pub fn normalize_azimuth(angle: f64) -> f64 {
    let a = angle.rem_euclid(TAU);
    // rem_euclid can return TAU itself for tiny negative inputs
    if a >= TAU { 0.0 } else { a }
}

/// Map an angle difference into (−π, π].
pub fn wrap_difference(angle: f64) -> f64 {
    let w = angle.sin().atan2(angle.cos());
    if w <= -PI { w + TAU } else { w }
}
