//! Top-level adjustment pipeline.
//!
//! `adjust` validates the configuration, runs the controller (wrapped in the
//! reweighting loop in robust mode), then hands the final solution to quality
//! assessment.  The network keeps the adjusted coordinates afterwards; any
//! error rolls it back to the approximations it was given.
//!
//! A free network with a `datum_method` gets an outer loop around all of
//! this: after each complete adjustment the datum stations are reweighted by
//! their standardized shifts and the network is re-adjusted from the
//! approximations, so stations that moved drop out of the datum.

use crate::config::{AdjustmentConfig, AdjustmentMode};
use crate::controller::{Controller, ControllerState, IterationRecord, Solution};
use crate::network::Network;
use crate::quality::{assess, QualityReport};
use crate::robust::{reweight_datum, robust_adjustment, DatumSummary, PassStatistics, RobustSummary, WeightFunction};
use crate::types::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How the Gauss–Newton iteration ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceInfo {
    /// `Converged` or `MaxIterationsExceeded`.
    pub termination: ControllerState,
    /// Iterations of the final run.
    pub iterations: usize,
    pub final_max_correction: f64,
    pub final_correction_norm: f64,
    /// Per-iteration trace of the final run.
    pub history: Vec<IterationRecord>,
}

impl ConvergenceInfo {
    pub fn converged(&self) -> bool {
        self.termination == ControllerState::Converged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub mode: AdjustmentMode,
    pub convergence: ConvergenceInfo,
    /// Present in robust mode only.
    pub robust: Option<RobustSummary>,
    /// Present for free networks adjusted with a `datum_method`.
    pub datum: Option<DatumSummary>,
    pub quality: QualityReport,
    /// Every non-fatal condition met on the way.
    pub warnings: Vec<AdjustmentWarning>,
}

impl AdjustmentResult {
    pub fn variance_factor(&self) -> f64 {
        self.quality.variance_factor
    }

    pub fn degrees_of_freedom(&self) -> usize {
        self.quality.degrees_of_freedom
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Adjust `network` in place and report on the result.
pub fn adjust(network: &mut Network, config: &AdjustmentConfig) -> Result<AdjustmentResult, AdjustmentError> {
    config.validate()?;

    let snapshot = network.snapshot();
    let approximate: Vec<[f64; 3]> = network.stations().iter().map(|s| s.point).collect();
    let a_priori = network.a_priori_weights(config);

    info!(
        stations = network.stations().len(),
        observations = network.num_observations(),
        unknowns = network.num_unknowns(),
        dof = network.degrees_of_freedom(),
        mode = ?config.mode,
        "starting adjustment"
    );

    let mut controller = Controller::new(network, config);
    let outcome = match config.datum_method {
        Some(method) if controller.network().is_free() => {
            datum_adjustment(&mut controller, &a_priori, &method, config).map(|(s, r, d)| (s, r, Some(d)))
        }
        _ => run_mode(&mut controller, &a_priori, config).map(|(s, r)| (s, r, None)),
    };
    let (solution, robust, datum) = match outcome {
        Ok(v) => v,
        Err(e) => {
            network.restore(snapshot);
            return Err(e);
        }
    };

    let quality = assess(
        network,
        &solution,
        &a_priori,
        robust.as_ref().map(|r| r.factors.as_slice()),
        &approximate,
        config,
    );

    let mut warnings = Vec::new();
    let last = solution.history.last();
    if !solution.converged() {
        warnings.push(AdjustmentWarning::MaxIterationsExceeded {
            iterations: solution.iterations,
            max_correction: last.map_or(f64::NAN, |r| r.max_correction),
        });
    }
    if let Some(r) = robust.as_ref().filter(|r| !r.converged) {
        warnings.push(AdjustmentWarning::RobustNonConvergence {
            passes: r.passes,
            max_weight_change: r.max_weight_change,
        });
    }
    if let Some(d) = datum.as_ref().filter(|d| !d.converged) {
        warnings.push(AdjustmentWarning::DatumNonConvergence {
            passes: d.passes,
            max_weight_change: d.max_weight_change,
        });
    }
    warnings.extend(quality.warnings.iter().cloned());

    let convergence = ConvergenceInfo {
        termination: solution.termination,
        iterations: solution.iterations,
        final_max_correction: last.map_or(0.0, |r| r.max_correction),
        final_correction_norm: last.map_or(0.0, |r| r.correction_norm),
        history: solution.history.clone(),
    };

    info!(
        variance_factor = quality.variance_factor,
        dof = quality.degrees_of_freedom,
        outliers = quality.outliers().count(),
        "adjustment finished"
    );

    Ok(AdjustmentResult { mode: config.mode, convergence, robust, datum, quality, warnings })
}

/// One complete adjustment in the configured mode.
fn run_mode(
    controller: &mut Controller<'_>,
    a_priori: &[f64],
    config: &AdjustmentConfig,
) -> Result<(Solution, Option<RobustSummary>), AdjustmentError> {
    match config.mode {
        AdjustmentMode::Robust => robust_adjustment(controller, a_priori, config).map(|(s, r)| (s, Some(r))),
        AdjustmentMode::Ordinary | AdjustmentMode::Weighted => controller.run(a_priori).map(|s| (s, None)),
    }
}

/// Re-adjust a free network from its approximations until the datum
/// station weights settle.
///
/// Shifts are standardized with σ₀ and the cofactors of the pass.  Factors
/// are applied to the base tie weights afresh every pass, and the pass cap
/// and tolerance are shared with robust estimation.
fn datum_adjustment(
    controller: &mut Controller<'_>,
    a_priori: &[f64],
    method: &WeightFunction,
    config: &AdjustmentConfig,
) -> Result<(Solution, Option<RobustSummary>, DatumSummary), AdjustmentError> {
    let options = &config.robust;
    let base = controller.network().datum_weights().to_vec();
    let start = controller.network().unknown_values();
    let snapshot = controller.network().snapshot();
    let dof = controller.network().degrees_of_freedom();
    let sigma0 = config.a_priori_sigma();
    let n = base.len();
    let mut factors = vec![1.0; n];
    let mut passes = 0;

    loop {
        passes += 1;
        let weights: Vec<f64> = base.iter().zip(&factors).map(|(s, f)| s * f).collect();
        controller.set_datum_weights(weights.clone());
        controller.rewind(snapshot.clone());
        let (solution, robust) = run_mode(controller, a_priori, config)?;

        let shifts: Vec<f64> = controller
            .network()
            .unknown_values()
            .iter()
            .zip(&start)
            .map(|(x, x0)| x - x0)
            .collect();
        let cofactors = solution.factorization.cofactor_matrix(n).diag().to_vec();
        let stats = PassStatistics::of(&solution, dof, config);
        let (updated, standardized) = reweight_datum(method, &shifts, &cofactors, &base, sigma0, &stats);
        let change = updated
            .iter()
            .zip(&factors)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);

        let released = updated.iter().zip(&base).filter(|&(&f, &s)| s > 0.0 && f < 1.0).count();
        debug!(pass = passes, max_weight_change = change, released, "datum pass");

        let converged = change < options.weight_tolerance;
        if converged || passes >= options.max_passes {
            if converged {
                info!(passes, released, "datum weights converged");
            } else {
                warn!(passes, max_weight_change = change, "datum weights did not converge");
            }
            let summary = DatumSummary {
                method: *method,
                passes,
                converged,
                max_weight_change: change,
                weights,
                standardized_shifts: standardized,
            };
            return Ok((solution, robust, summary));
        }
        factors = updated;
    }
}
