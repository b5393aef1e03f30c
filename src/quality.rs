//! Post-adjustment statistics.
//!
//! From the final linearisation and factorisation this derives the a
//! posteriori variance factor, the covariance of the unknowns, redundancy
//! numbers and residual cofactors, the global (chi-square) model test and
//! Pope's tau test per observation.  Nothing here mutates the network.
//!
//! Residuals are standardized against the a priori weight p⁰ and the
//! redundancy of the final run, wᵢ = vᵢ·√p⁰ᵢ / (σ₀·√rᵢ).  Outside robust mode
//! this is the familiar vᵢ / (σ₀·√q_vv,i); after robust down-weighting it
//! keeps a rejected observation's residual at its true size.

use crate::angles::normalize_azimuth;
use crate::config::AdjustmentConfig;
use crate::controller::Solution;
use crate::equations::LinearSystem;
use crate::network::Network;
use crate::stats::{chi_square_quantile, tau_critical};
use crate::types::*;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ─────────────────────────────────────────────────────────────
//  Report types
// ─────────────────────────────────────────────────────────────

/// Two-sided chi-square test of vᵀPv/σ₀² against its degrees of freedom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTest {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub confidence_level: f64,
    pub lower: f64,
    pub upper: f64,
    pub passed: bool,
}

/// Outcome of the tau test for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTest {
    /// vᵢ·√p⁰ᵢ / (σ̂₀·√rᵢ); `None` for uncontrolled observations.
    pub tau: Option<f64>,
    /// τ critical value; `None` below two degrees of freedom.
    pub critical: Option<f64>,
    pub testable: bool,
    pub outlier: bool,
}

/// Standard error ellipse of a horizontal position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorEllipse {
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Direction of the major axis, reckoned like azimuths, in [0, π).
    pub bearing: f64,
}

impl ErrorEllipse {
    /// Ellipse of the 2 × 2 covariance [[sxx, sxy], [sxy, syy]].
    pub fn from_covariance(sxx: f64, syy: f64, sxy: f64) -> Self {
        let mean = 0.5 * (sxx + syy);
        let radius = (0.25 * (sxx - syy).powi(2) + sxy * sxy).sqrt();
        let mut bearing = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        if bearing < 0.0 {
            bearing += std::f64::consts::PI;
        }
        Self {
            semi_major: (mean + radius).max(0.0).sqrt(),
            semi_minor: (mean - radius).max(0.0).sqrt(),
            bearing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationReport {
    pub id: String,
    pub fixed: bool,
    pub approximate: [f64; 3],
    pub adjusted: [f64; 3],
    /// adjusted − approximate.
    pub correction: [f64; 3],
    /// Zero on axes without an unknown.
    pub std_dev: [f64; 3],
    pub covariance: [[f64; 3]; 3],
    pub ellipse: Option<ErrorEllipse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientationReport {
    pub station: String,
    pub set: u32,
    /// Radians in [0, 2π).
    pub value: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationReport {
    pub id: String,
    pub kind: ObservationKind,
    pub measured: f64,
    pub adjusted: f64,
    /// v = adjusted − measured (wrapped for angles).
    pub residual: f64,
    pub a_priori_sigma: f64,
    /// Weight used in the final adjustment.
    pub weight: f64,
    /// Robust factor ω, 1 outside robust mode.
    pub robust_factor: f64,
    pub adjusted_std: f64,
    pub residual_std: f64,
    /// rᵢ = pᵢ·q_vv,i in [0, 1].
    pub redundancy: f64,
    /// vᵢ·√p⁰ᵢ / (σ₀·√rᵢ); `None` for uncontrolled observations.
    pub standardized_residual: Option<f64>,
    pub local_test: LocalTest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// σ̂₀².
    pub variance_factor: f64,
    pub a_priori_variance: f64,
    pub degrees_of_freedom: usize,
    /// vᵀPv.
    pub weighted_square_sum: f64,
    /// Σ_xx = σ̂₀²·Q_xx, ordered like `unknown_labels`.
    pub covariance: Array2<f64>,
    pub unknown_labels: Vec<String>,
    /// `None` when there are no degrees of freedom.
    pub global_test: Option<GlobalTest>,
    pub stations: Vec<StationReport>,
    pub orientations: Vec<OrientationReport>,
    pub observations: Vec<ObservationReport>,
    pub warnings: Vec<AdjustmentWarning>,
}

impl QualityReport {
    pub fn station(&self, id: &str) -> Option<&StationReport> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn observation(&self, id: &str) -> Option<&ObservationReport> {
        self.observations.iter().find(|o| o.id == id)
    }

    /// Observations flagged by the local test.
    pub fn outliers(&self) -> impl Iterator<Item = &ObservationReport> {
        self.observations.iter().filter(|o| o.local_test.outlier)
    }
}

// ─────────────────────────────────────────────────────────────
//  Cofactors
// ─────────────────────────────────────────────────────────────

/// aᵢ·Q·aᵢᵀ for every row of the design matrix.
fn row_cofactors(system: &LinearSystem, q: &Array2<f64>) -> Vec<f64> {
    system
        .design
        .outer_iterator()
        .map(|row| {
            let mut acc = 0.0;
            for (j, &aj) in row.iter() {
                for (k, &ak) in row.iter() {
                    acc += aj * q[[j, k]] * ak;
                }
            }
            acc
        })
        .collect()
}

/// Residual cofactors q_vv,i = 1/pᵢ − aᵢQaᵢᵀ of a finished run (unclamped).
pub fn residual_cofactors(solution: &Solution) -> Vec<f64> {
    let q = solution.factorization.cofactor_matrix(solution.system.num_unknowns());
    row_cofactors(&solution.system, &q)
        .iter()
        .zip(&solution.system.weights)
        .map(|(aqa, p)| 1.0 / p - aqa)
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Assessment
// ─────────────────────────────────────────────────────────────

/// Compute every quality figure for a finished run.
///
/// `a_priori` are the weights p⁰ before robust scaling, `robust_factors` the
/// ω used in the final pass, `approximate` the station coordinates before
/// the adjustment.
pub fn assess(
    network: &Network,
    solution: &Solution,
    a_priori: &[f64],
    robust_factors: Option<&[f64]>,
    approximate: &[[f64; 3]],
    config: &AdjustmentConfig,
) -> QualityReport {
    let system = &solution.system;
    let n = system.num_unknowns();
    let q = solution.factorization.cofactor_matrix(n);
    let aqa = row_cofactors(system, &q);

    let dof = network.degrees_of_freedom();
    let vtpv = solution.weighted_square_sum();
    let variance_factor = if dof > 0 { vtpv / dof as f64 } else { config.a_priori_variance };
    let sigma0 = config.a_priori_sigma();
    let sigma0_post = variance_factor.sqrt();
    let covariance = &q * variance_factor;

    let global_test = (dof > 0).then(|| {
        let level = config.confidence_level;
        let f = dof as f64;
        let statistic = vtpv / config.a_priori_variance;
        let lower = chi_square_quantile((1.0 - level) / 2.0, f);
        let upper = chi_square_quantile((1.0 + level) / 2.0, f);
        GlobalTest {
            statistic,
            degrees_of_freedom: dof,
            confidence_level: level,
            lower,
            upper,
            passed: statistic >= lower && statistic <= upper,
        }
    });
    let critical = tau_critical(config.confidence_level, dof);

    // ── Observations ──────────────────────────────────────────
    let mut clamped = Vec::new();
    let mut observations = Vec::with_capacity(system.num_observations());
    for (i, obs) in network.observations().iter().enumerate() {
        let p = system.weights[i];
        let mut qvv = 1.0 / p - aqa[i];
        if qvv < 0.0 {
            if qvv < -1e-9 / p {
                clamped.push(obs.id.clone());
            }
            qvv = 0.0;
        }
        let redundancy = (p * qvv).clamp(0.0, 1.0);
        let controlled = redundancy >= config.min_redundancy && qvv > 0.0;
        let v = solution.residuals[i];
        let scaled = v * a_priori[i].sqrt() / redundancy.sqrt();

        let standardized_residual = controlled.then(|| scaled / sigma0);
        let tau = (controlled && sigma0_post > 0.0).then(|| scaled / sigma0_post);
        let testable = tau.is_some() && critical.is_some();
        let outlier = match (tau, critical) {
            (Some(t), Some(c)) => t.abs() > c,
            _ => false,
        };

        observations.push(ObservationReport {
            id: obs.id.clone(),
            kind: obs.kind,
            measured: obs.value,
            adjusted: system.computed[i],
            residual: v,
            a_priori_sigma: network.sigma(i),
            weight: p,
            robust_factor: robust_factors.map_or(1.0, |f| f[i]),
            adjusted_std: (variance_factor * aqa[i].max(0.0)).sqrt(),
            residual_std: (variance_factor * qvv).sqrt(),
            redundancy,
            standardized_residual,
            local_test: LocalTest { tau, critical, testable, outlier },
        });
    }

    let mut warnings = Vec::new();
    if !clamped.is_empty() {
        warn!(count = clamped.len(), "negative residual variance clamped");
        warnings.push(AdjustmentWarning::NegativeResidualVariance { observations: clamped });
    }

    // ── Stations ──────────────────────────────────────────────
    let stations = network
        .stations()
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let cols: Vec<Option<usize>> =
                Axis::ALL.iter().map(|&a| network.coordinate_column(i, a)).collect();
            let mut block = [[0.0; 3]; 3];
            for (r, cr) in cols.iter().enumerate() {
                for (c, cc) in cols.iter().enumerate() {
                    if let (Some(cr), Some(cc)) = (cr, cc) {
                        block[r][c] = covariance[[*cr, *cc]];
                    }
                }
            }
            let std_dev = [0, 1, 2].map(|a| block[a][a].max(0.0).sqrt());
            let ellipse = (cols[0].is_some() && cols[1].is_some())
                .then(|| ErrorEllipse::from_covariance(block[0][0], block[1][1], block[0][1]));
            let approx = approximate.get(i).copied().unwrap_or(s.point);
            StationReport {
                id: s.id.clone(),
                fixed: s.fixed,
                approximate: approx,
                adjusted: s.point,
                correction: [0, 1, 2].map(|a| s.point[a] - approx[a]),
                std_dev,
                covariance: block,
                ellipse,
            }
        })
        .collect();

    // ── Orientations ──────────────────────────────────────────
    let nc = network.num_coordinate_unknowns();
    let orientations = network
        .orientations()
        .enumerate()
        .map(|(k, (station, set, value))| OrientationReport {
            station: network.stations()[station].id.clone(),
            set,
            value: normalize_azimuth(value),
            std_dev: covariance[[nc + k, nc + k]].max(0.0).sqrt(),
        })
        .collect();

    QualityReport {
        variance_factor,
        a_priori_variance: config.a_priori_variance,
        degrees_of_freedom: dof,
        weighted_square_sum: vtpv,
        covariance,
        unknown_labels: (0..n).map(|c| network.unknown_label(c)).collect(),
        global_test,
        stations,
        orientations,
        observations,
        warnings,
    }
}
