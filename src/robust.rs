//! Robust estimation by iteratively reweighted least squares.
//!
//! ## Purpose
//!
//! After a converged adjustment, standardized residuals are mapped through an
//! M-estimator weight function and the network is re-adjusted with the a
//! priori weights scaled by those factors.  Gross errors lose influence while
//! well-fitting observations keep full weight.
//!
//! ## Design notes
//!
//! * **Standardization**: wᵢ = vᵢ·√p⁰ᵢ / (σ₀·√rᵢ) with the a priori weight
//!   p⁰ᵢ and the redundancy number rᵢ of the current pass.
//! * **Per-pass constants**: `Cra` scales by σ̂₀² and `T` takes its degrees
//!   of freedom from the pass being reweighted ([`PassStatistics`]).
//! * **Non-cumulative**: every pass forms P = P⁰·diag(ω) from scratch, so a
//!   good observation caught by leakage in an early pass recovers later.
//! * **Stopping**: weights stable within `weight_tolerance`, or the pass cap.
//!
//! ## Invariants
//!
//! * Weight factors lie in [`MIN_WEIGHT_FACTOR`, 1].
//! * Uncontrolled observations (rᵢ below `min_redundancy`) keep factor 1.
//! * Tuning constants are positive.

use crate::config::AdjustmentConfig;
use crate::controller::{Controller, Solution};
use crate::quality::residual_cofactors;
use crate::stats::erfc;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::{E, PI};
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────
//  Weight functions
// ─────────────────────────────────────────────────────────────

/// M-estimator weight function with its tuning constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WeightFunction {
    /// c/|w| beyond c.
    Huber { c: f64 },
    /// exp(−w²/c²) beyond c.
    Danish { c: f64 },
    /// Linear ramp from 1 at c down to 0 at c + a.
    Slope { c: f64, a: f64 },
    /// Three-part redescending.
    Hampel { a: f64, b: f64, c: f64 },
    /// Biweight (1 − (w/c)²)².
    Tukey { c: f64 },
    Epanechnikov { c: f64 },
    Cauchy { c: f64 },
    Exponential { c: f64 },
    /// sinc(w/c) inside c.
    Andrews { c: f64 },
    Wave { c: f64 },
    HalfWave { c: f64 },
    Wigner { c: f64 },
    /// Hard rejection beyond c.
    Trim { c: f64 },
    /// (1 − (w/c)ⁿ)ⁿ·(1 + (w/c)ⁿ)ⁿ inside c.
    Jacobi { c: f64, n: f64 },
    /// Choice rule of alternatives, exp(−|w|ⁿ/(σ̂₀²·c)).
    Cra { c: f64, n: f64 },
    /// 1 − erf((w/c)ⁿ).
    ErrorFunc { c: f64, n: f64 },
    /// Student's t with the degrees of freedom of the pass.
    T { c: f64, n: f64 },
    /// sech(|w|ⁿ·e/(2c)).
    ChainBell { c: f64, n: f64 },
    /// 2 − cosh(|w|·e/(2c)), zero once negative.
    Chain { c: f64 },
    /// Upper quarter ellipse to c, lower one down to zero at 2c.
    EllipseCurve { c: f64 },
}

/// Scale figures of the pass whose residuals are being reweighted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassStatistics {
    /// σ̂₀² of the pass.
    pub variance_factor: f64,
    pub degrees_of_freedom: usize,
}

impl Default for PassStatistics {
    fn default() -> Self {
        Self { variance_factor: 1.0, degrees_of_freedom: 1 }
    }
}

impl PassStatistics {
    pub fn of(solution: &Solution, degrees_of_freedom: usize, config: &AdjustmentConfig) -> Self {
        let variance_factor = if degrees_of_freedom > 0 {
            solution.weighted_square_sum() / degrees_of_freedom as f64
        } else {
            config.a_priori_variance
        };
        Self { variance_factor, degrees_of_freedom }
    }
}

impl Default for WeightFunction {
    fn default() -> Self {
        Self::huber()
    }
}

impl WeightFunction {
    pub const DEFAULT_HUBER_C: f64 = 1.5;
    pub const DEFAULT_DANISH_C: f64 = 2.5;
    pub const DEFAULT_TUKEY_C: f64 = 4.685;

    pub fn huber() -> Self {
        Self::Huber { c: Self::DEFAULT_HUBER_C }
    }

    pub fn danish() -> Self {
        Self::Danish { c: Self::DEFAULT_DANISH_C }
    }

    pub fn tukey() -> Self {
        Self::Tukey { c: Self::DEFAULT_TUKEY_C }
    }

    pub fn slope() -> Self {
        Self::Slope { c: 2.0, a: 2.0 }
    }

    pub fn hampel() -> Self {
        Self::Hampel { a: 1.7, b: 3.4, c: 8.5 }
    }

    pub fn epanechnikov() -> Self {
        Self::Epanechnikov { c: 3.674 }
    }

    pub fn cauchy() -> Self {
        Self::Cauchy { c: 2.385 }
    }

    pub fn exponential() -> Self {
        Self::Exponential { c: 2.0 }
    }

    pub fn andrews() -> Self {
        Self::Andrews { c: 4.207 }
    }

    pub fn wave() -> Self {
        Self::Wave { c: 2.5 }
    }

    pub fn half_wave() -> Self {
        Self::HalfWave { c: 2.5 }
    }

    pub fn wigner() -> Self {
        Self::Wigner { c: 3.137 }
    }

    pub fn trim() -> Self {
        Self::Trim { c: 2.5 }
    }

    pub fn jacobi() -> Self {
        Self::Jacobi { c: 4.687, n: 1.0 }
    }

    pub fn cra() -> Self {
        Self::Cra { c: 2.0, n: 2.0 }
    }

    pub fn error_func() -> Self {
        Self::ErrorFunc { c: 1.414, n: 2.0 }
    }

    pub fn t() -> Self {
        Self::T { c: 1.0, n: 2.0 }
    }

    pub fn chain_bell() -> Self {
        Self::ChainBell { c: 1.0, n: 1.0 }
    }

    pub fn chain() -> Self {
        Self::Chain { c: 1.0 }
    }

    pub fn ellipse_curve() -> Self {
        Self::EllipseCurve { c: 2.5 }
    }

    /// Weight factor for a standardized residual under unit variance and one
    /// degree of freedom, see [`WeightFunction::weight_with`].
    pub fn weight(&self, w: f64) -> f64 {
        self.weight_with(w, &PassStatistics::default())
    }

    /// Weight factor for a standardized residual, clamped to
    /// [`MIN_WEIGHT_FACTOR`, 1].
    pub fn weight_with(&self, w: f64, stats: &PassStatistics) -> f64 {
        let v = w.abs();
        let raw = match *self {
            Self::Huber { c } => {
                if v > c { c / v } else { 1.0 }
            }
            Self::Danish { c } => {
                if v > c { (-(v * v) / (c * c)).exp() } else { 1.0 }
            }
            Self::Slope { c, a } => 1.0 + (c - v) / a,
            Self::Hampel { a, b, c } => {
                if v <= a {
                    1.0
                } else if v <= b {
                    a / v
                } else if v <= c {
                    a / v * (c - v) / (c - b)
                } else {
                    0.0
                }
            }
            Self::Tukey { c } => {
                if v <= c { (1.0 - (v / c).powi(2)).powi(2) } else { 0.0 }
            }
            Self::Epanechnikov { c } => {
                if v <= c { 1.0 - (v / c).powi(2) } else { 0.0 }
            }
            Self::Cauchy { c } => 1.0 / (1.0 + (v / c).powi(2)),
            Self::Exponential { c } => (-(v / c).powi(2)).exp(),
            Self::Andrews { c } => {
                if v <= c { sinc(v / c) } else { 0.0 }
            }
            Self::Wave { c } => {
                if v <= c { ((v * PI / c).cos() + 1.0) / 2.0 } else { 0.0 }
            }
            Self::HalfWave { c } => {
                if v <= c { (v * PI / (2.0 * c)).cos() } else { 0.0 }
            }
            Self::Wigner { c } => {
                if v <= c { (1.0 - (v / c).powi(2)).sqrt() } else { 0.0 }
            }
            Self::Trim { c } => {
                if v <= c { 1.0 } else { 0.0 }
            }
            Self::Jacobi { c, n } => {
                if v <= c {
                    let x = (v / c).powf(n);
                    ((1.0 - x) * (1.0 + x)).powf(n)
                } else {
                    0.0
                }
            }
            Self::Cra { c, n } => {
                let s2 = stats.variance_factor;
                let s2 = if s2.is_finite() && s2 > 0.0 { s2 } else { 1.0 };
                (-v.powf(n) / (s2 * c)).exp()
            }
            Self::ErrorFunc { c, n } => erfc((v / c).powf(n)),
            Self::T { c, n } => {
                let k = stats.degrees_of_freedom.max(1) as f64;
                (1.0 + v.powf(n) / (c * k)).powf(-(k + 1.0) / 2.0)
            }
            Self::ChainBell { c, n } => 1.0 / (v.powf(n) * E / (2.0 * c)).cosh(),
            Self::Chain { c } => 2.0 - (v * E / (2.0 * c)).cosh(),
            Self::EllipseCurve { c } => {
                if v <= c {
                    (1.0 + (1.0 - (v / c).powi(2)).max(0.0).sqrt()) / 2.0
                } else if v <= 2.0 * c {
                    (1.0 - (1.0 - ((v - 2.0 * c) / c).powi(2)).max(0.0).sqrt()) / 2.0
                } else {
                    0.0
                }
            }
        };
        if raw.is_nan() {
            return MIN_WEIGHT_FACTOR;
        }
        raw.clamp(MIN_WEIGHT_FACTOR, 1.0)
    }

    pub fn validate(&self) -> Result<(), AdjustmentError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(AdjustmentError::InvalidConfig(format!(
                    "robust tuning constant {name} must be positive, got {v}"
                )))
            }
        };
        match *self {
            Self::Slope { c, a } => {
                positive("c", c)?;
                positive("a", a)
            }
            Self::Hampel { a, b, c } => {
                positive("a", a)?;
                positive("b", b)?;
                positive("c", c)?;
                if a < b && b < c {
                    Ok(())
                } else {
                    Err(AdjustmentError::InvalidConfig(format!(
                        "hampel constants must satisfy a < b < c, got {a}, {b}, {c}"
                    )))
                }
            }
            Self::Jacobi { c, n }
            | Self::Cra { c, n }
            | Self::ErrorFunc { c, n }
            | Self::T { c, n }
            | Self::ChainBell { c, n } => {
                positive("c", c)?;
                positive("n", n)
            }
            Self::Huber { c }
            | Self::Danish { c }
            | Self::Tukey { c }
            | Self::Epanechnikov { c }
            | Self::Cauchy { c }
            | Self::Exponential { c }
            | Self::Andrews { c }
            | Self::Wave { c }
            | Self::HalfWave { c }
            | Self::Wigner { c }
            | Self::Trim { c }
            | Self::Chain { c }
            | Self::EllipseCurve { c } => positive("c", c),
        }
    }
}

/// Normalised sinc, sin(πx)/(πx).
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

// ─────────────────────────────────────────────────────────────
//  Reweighting
// ─────────────────────────────────────────────────────────────

/// Outcome of the reweighting loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustSummary {
    pub method: WeightFunction,
    /// Full re-adjustments performed.
    pub passes: usize,
    pub converged: bool,
    /// Largest factor change between the last two passes.
    pub max_weight_change: f64,
    /// Factors ω applied in the final adjustment, one per observation.
    pub factors: Vec<f64>,
    /// wᵢ of the final adjustment; `None` for uncontrolled observations.
    pub standardized_residuals: Vec<Option<f64>>,
}

/// Standardized residuals and the factors they imply.
///
/// `a_priori` are p⁰, `current` the weights the residuals were computed with,
/// `cofactors` the residual cofactors q_vv under `current`.  The weight
/// function, σ₀ and the redundancy floor come from `config`.
pub fn reweight(
    residuals: &[f64],
    a_priori: &[f64],
    current: &[f64],
    cofactors: &[f64],
    config: &AdjustmentConfig,
    stats: &PassStatistics,
) -> (Vec<f64>, Vec<Option<f64>>) {
    let method = &config.robust.method;
    let sigma0 = config.a_priori_sigma();
    let m = residuals.len();
    let mut factors = vec![1.0; m];
    let mut standardized = vec![None; m];
    for i in 0..m {
        let redundancy = (current[i] * cofactors[i]).min(1.0);
        if !(redundancy.is_finite() && redundancy > 0.0 && redundancy >= config.min_redundancy) {
            continue;
        }
        let w = residuals[i] * a_priori[i].sqrt() / (sigma0 * redundancy.sqrt());
        standardized[i] = Some(w);
        factors[i] = method.weight_with(w, stats);
    }
    (factors, standardized)
}

/// Standardized shifts of the datum coordinates of a free network and the
/// weights they imply.
///
/// `shifts` are the coordinate changes against the approximations, one per
/// unknown column, `cofactors` the diagonal of Q_xx and `base` the datum
/// weight each column started with.  Columns outside the datum (base weight
/// zero, orientations) keep factor 1.
pub fn reweight_datum(
    method: &WeightFunction,
    shifts: &[f64],
    cofactors: &[f64],
    base: &[f64],
    sigma0: f64,
    stats: &PassStatistics,
) -> (Vec<f64>, Vec<Option<f64>>) {
    let n = shifts.len();
    let mut factors = vec![1.0; n];
    let mut standardized = vec![None; n];
    for j in 0..n {
        if base[j] <= 0.0 || !(cofactors[j] > 0.0) {
            continue;
        }
        let w = shifts[j] / (sigma0 * cofactors[j].sqrt());
        standardized[j] = Some(w);
        factors[j] = method.weight_with(w, stats);
    }
    (factors, standardized)
}

/// Outcome of reweighting the datum stations of a free network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumSummary {
    pub method: WeightFunction,
    pub passes: usize,
    pub converged: bool,
    pub max_weight_change: f64,
    /// Datum weight of every unknown column in the final pass, zero outside
    /// the datum.  Ordered like `QualityReport::unknown_labels`.
    pub weights: Vec<f64>,
    /// Shift / σ of every datum coordinate; `None` outside the datum.
    pub standardized_shifts: Vec<Option<f64>>,
}

/// Run the controller repeatedly, reweighting between passes, until the
/// robust factors settle or the pass cap is hit.
///
/// The weights of the returned solution are P⁰·diag(`summary.factors`).
pub fn robust_adjustment(
    controller: &mut Controller<'_>,
    a_priori: &[f64],
    config: &AdjustmentConfig,
) -> Result<(Solution, RobustSummary), AdjustmentError> {
    let options = &config.robust;
    let dof = controller.network().degrees_of_freedom();
    let m = a_priori.len();
    let mut factors = vec![1.0; m];
    let mut passes = 0;

    loop {
        passes += 1;
        let weights: Vec<f64> = a_priori.iter().zip(&factors).map(|(p, f)| p * f).collect();
        let solution = controller.run(&weights)?;

        let cofactors = residual_cofactors(&solution);
        let stats = PassStatistics::of(&solution, dof, config);
        let (updated, standardized) =
            reweight(&solution.residuals, a_priori, &weights, &cofactors, config, &stats);
        let change = updated
            .iter()
            .zip(&factors)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);

        let downweighted = updated.iter().filter(|&&f| f < 1.0).count();
        debug!(pass = passes, max_weight_change = change, downweighted, "robust pass");

        let converged = change < options.weight_tolerance;
        if converged || passes >= options.max_passes {
            if converged {
                info!(passes, downweighted, "robust weights converged");
            } else {
                warn!(passes, max_weight_change = change, "robust weights did not converge");
            }
            let summary = RobustSummary {
                method: options.method,
                passes,
                converged,
                max_weight_change: change,
                factors,
                standardized_residuals: standardized,
            };
            return Ok((solution, summary));
        }
        factors = updated;
    }
}
