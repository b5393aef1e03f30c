//! Gauss–Newton iteration over the network.
//!
//! One run walks the state machine
//!
//! ```text
//! Initialized → Iterating ─┬→ Converged ─────────────┬→ Finalized
//!                          └→ MaxIterationsExceeded ─┘
//! ```
//!
//! Each iteration re-linearises at the current coordinates, solves the normal
//! equations and applies the corrections (the only place the network is
//! written).  Divergence aborts the run and rolls the coordinates back.
//! Finalisation re-linearises once more so residuals and the factorisation
//! handed to quality assessment belong to the final coordinates.

use crate::config::AdjustmentConfig;
use crate::datum::datum_constraints;
use crate::equations::{build_system, LinearSystem};
use crate::network::{Datum, Network, Snapshot};
use crate::normal::{Factorization, NormalEquations};
use crate::types::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Initialized,
    Iterating,
    Converged,
    MaxIterationsExceeded,
    Finalized,
}

/// Per-iteration trace kept in the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Largest absolute coordinate correction.
    pub max_correction: f64,
    /// L2 norm of the full correction vector.
    pub correction_norm: f64,
    /// vᵀPv of the linearised model after this iteration's correction.
    pub weighted_square_sum: f64,
}

// ─────────────────────────────────────────────────────────────
//  Divergence monitor
// ─────────────────────────────────────────────────────────────

/// Flags divergence once the correction norm has grown for `window`
/// consecutive iterations.  Norms under `floor` never count as growth, so
/// round-off around a converged solution is ignored.
#[derive(Debug, Clone)]
pub struct DivergenceMonitor {
    window: usize,
    floor: f64,
    previous: Option<f64>,
    streak: usize,
}

impl DivergenceMonitor {
    pub fn new(window: usize, floor: f64) -> Self {
        Self { window, floor, previous: None, streak: 0 }
    }

    /// Record one correction norm; true when the run must be aborted.
    pub fn observe(&mut self, norm: f64) -> bool {
        let grew = matches!(self.previous, Some(prev) if norm > prev && norm > self.floor);
        self.streak = if grew { self.streak + 1 } else { 0 };
        self.previous = Some(norm);
        self.streak >= self.window
    }
}

// ─────────────────────────────────────────────────────────────
//  Controller
// ─────────────────────────────────────────────────────────────

/// Everything quality assessment needs from a finished run.
#[derive(Debug)]
pub struct Solution {
    /// Linearisation at the final coordinates.
    pub system: LinearSystem,
    pub factorization: Factorization,
    /// v = f(x̂) − ℓ.
    pub residuals: Vec<f64>,
    /// `Converged` or `MaxIterationsExceeded`.
    pub termination: ControllerState,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
}

impl Solution {
    pub fn converged(&self) -> bool {
        self.termination == ControllerState::Converged
    }

    /// vᵀPv at the final coordinates.
    pub fn weighted_square_sum(&self) -> f64 {
        self.residuals
            .iter()
            .zip(&self.system.weights)
            .map(|(v, p)| p * v * v)
            .sum()
    }
}

/// Single writer of the network's coordinates.
pub struct Controller<'a> {
    network: &'a mut Network,
    config: &'a AdjustmentConfig,
    state: ControllerState,
    /// Diagonal of S for a free network.
    datum_weights: Vec<f64>,
}

impl<'a> Controller<'a> {
    pub fn new(network: &'a mut Network, config: &'a AdjustmentConfig) -> Self {
        let datum_weights = network.datum_weights().to_vec();
        Self { network, config, state: ControllerState::Initialized, datum_weights }
    }

    /// Replace the datum weights used by later runs (free networks only).
    pub fn set_datum_weights(&mut self, weights: Vec<f64>) {
        self.datum_weights = weights;
    }

    pub fn datum_weights(&self) -> &[f64] {
        &self.datum_weights
    }

    /// Put the network back to `snapshot` before another run.
    pub(crate) fn rewind(&mut self, snapshot: Snapshot) {
        self.network.restore(snapshot);
        self.state = ControllerState::Initialized;
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn network(&self) -> &Network {
        &*self.network
    }

    /// Iterate to convergence with the given observation weights.
    ///
    /// On error the network is restored to the coordinates it had on entry.
    pub fn run(&mut self, weights: &[f64]) -> Result<Solution, AdjustmentError> {
        self.state = ControllerState::Initialized;
        let snapshot = self.network.snapshot();
        match self.iterate(weights) {
            Ok(solution) => Ok(solution),
            Err(e) => {
                self.network.restore(snapshot);
                self.state = ControllerState::Initialized;
                Err(e)
            }
        }
    }

    fn factorize(&self, system: &LinearSystem) -> Result<(NormalEquations, Factorization), AdjustmentError> {
        let normal = NormalEquations::assemble(system);
        let datum = match self.network.datum() {
            Datum::Constrained => None,
            Datum::Free(defect) => Some(datum_constraints(&*self.network, defect, &self.datum_weights)),
        };
        let factorization = Factorization::new(&normal, datum)?;
        Ok((normal, factorization))
    }

    fn iterate(&mut self, weights: &[f64]) -> Result<Solution, AdjustmentError> {
        let threshold = self.config.convergence_threshold;
        let mut monitor = DivergenceMonitor::new(self.config.divergence_window, threshold);
        let mut history = Vec::new();
        let mut iterations = 0;

        self.state = ControllerState::Iterating;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let system = build_system(&*self.network, weights)?;
            let (normal, factorization) = self.factorize(&system)?;
            let dx = factorization.solve(&normal.rhs);
            if dx.iter().any(|v| !v.is_finite()) {
                return Err(AdjustmentError::NonFinite { stage: "corrections", iteration: iterations });
            }

            let max_correction = self.max_correction(&dx);
            let correction_norm = dx.iter().map(|v| v * v).sum::<f64>().sqrt();
            let weighted_square_sum = system.weighted_square_sum(&dx);
            self.network.apply_corrections(&dx);

            debug!(
                iteration = iterations,
                max_correction,
                correction_norm,
                weighted_square_sum,
                "gauss-newton step"
            );
            history.push(IterationRecord { iteration: iterations, max_correction, correction_norm, weighted_square_sum });

            if max_correction < threshold {
                self.state = ControllerState::Converged;
                break;
            }
            if monitor.observe(correction_norm) {
                return Err(AdjustmentError::Divergence { iteration: iterations, correction_norm });
            }
        }

        let termination = if self.state == ControllerState::Converged {
            info!(iterations, "adjustment converged");
            ControllerState::Converged
        } else {
            let last = history.last().map(|r| r.max_correction).unwrap_or(f64::NAN);
            warn!(iterations, max_correction = last, "maximum iterations exceeded");
            self.state = ControllerState::MaxIterationsExceeded;
            ControllerState::MaxIterationsExceeded
        };

        self.finalize(weights, termination, iterations, history)
    }

    fn finalize(
        &mut self,
        weights: &[f64],
        termination: ControllerState,
        iterations: usize,
        history: Vec<IterationRecord>,
    ) -> Result<Solution, AdjustmentError> {
        let system = build_system(&*self.network, weights)?;
        let (_, factorization) = self.factorize(&system)?;
        let residuals: Vec<f64> = system.misclosure.iter().map(|l| -l).collect();
        if residuals.iter().any(|v| !v.is_finite()) {
            return Err(AdjustmentError::NonFinite { stage: "residuals", iteration: iterations });
        }
        self.state = ControllerState::Finalized;
        Ok(Solution { system, factorization, residuals, termination, iterations, history })
    }

    /// Largest coordinate correction; orientations only count when the
    /// network has no coordinate unknowns.
    fn max_correction(&self, dx: &[f64]) -> f64 {
        let nc = self.network.num_coordinate_unknowns();
        let part = if nc > 0 { &dx[..nc] } else { dx };
        part.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}
