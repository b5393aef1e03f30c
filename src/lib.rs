//! **survnet**: least-squares adjustment of geodetic survey networks.
//!
//! This crate implements the complete adjustment pipeline:
//!
//! 1. **Network model** (`network`): stations, observations, unknown layout, datum.
//! 2. **Observation equations** (`equations`): analytic partials and misclosures.
//! 3. **Normal equations** (`normal`, `datum`): sparse AᵀPA, Cholesky, free-network datum solve.
//! 4. **Controller** (`controller`): Gauss–Newton iteration with convergence and divergence checks.
//! 5. **Robust estimation** (`robust`): M-estimator weight functions and IRLS.
//! 6. **Quality assessment** (`quality`, `stats`): variance factor, covariances, global and tau tests.
//!
//! ```no_run
//! use survnet::prelude::*;
//!
//! let config = AdjustmentConfig::default();
//! let stations = vec![
//!     Station::fixed("A", [0.0, 0.0, 0.0]),
//!     Station::fixed("B", [100.0, 0.0, 0.0]),
//!     Station::new("P", [50.0, 49.0, 0.0]),
//! ];
//! let observations = vec![
//!     Observation::new("d1", ObservationKind::HorizontalDistance, &["A", "P"], 70.711),
//!     Observation::new("d2", ObservationKind::HorizontalDistance, &["B", "P"], 70.711),
//!     Observation::new("a1", ObservationKind::HorizontalAngle, &["A", "B", "P"], 0.785398),
//! ];
//! let mut network = Network::new(Dimension::Planar, stations, observations, &config)?;
//! let result = adjust(&mut network, &config)?;
//! println!("σ̂₀² = {:.3}", result.variance_factor());
//! # Ok::<(), survnet::types::AdjustmentError>(())
//! ```

pub mod types;
pub mod angles;
pub mod config;
pub mod network;
pub mod datum;
pub mod equations;
pub mod normal;
pub mod controller;
pub mod robust;
pub mod stats;
pub mod quality;
pub mod adjustment;

pub use adjustment::{adjust, AdjustmentResult};

/// The types needed to build and adjust a network.
pub mod prelude {
    pub use crate::adjustment::{adjust, AdjustmentResult, ConvergenceInfo};
    pub use crate::angles::AngleUnit;
    pub use crate::config::{AdjustmentConfig, AdjustmentMode, RobustOptions, SigmaDefaults};
    pub use crate::controller::ControllerState;
    pub use crate::datum::Scale;
    pub use crate::network::Network;
    pub use crate::robust::{DatumSummary, WeightFunction};
    pub use crate::types::{
        AdjustmentError, AdjustmentWarning, Axis, Dimension, Observation, ObservationKind, Station,
    };
}
