//! Network model: stations, observations and the unknown vector.
//!
//! Construction validates everything that can be checked without solving
//! (references, arity, dimension compatibility, sigmas, datum, redundancy)
//! and fixes the column layout of the design matrix:
//! coordinate unknowns first (station order, axis order), then one
//! orientation unknown per direction set.
//!
//! After construction the only mutation is [`Network::apply_corrections`],
//! issued by the iterative controller.

use crate::angles::{normalize_azimuth, AngleUnit};
use crate::config::{AdjustmentConfig, AdjustmentMode};
use crate::datum::DatumDefect;
use crate::equations::azimuth;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What one column of the design matrix stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unknown {
    Coordinate { station: usize, axis: Axis },
    Orientation { station: usize, set: u32 },
}

/// How the datum of the network is defined.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// Fixed stations and/or weighted control coordinates.
    Constrained,
    /// No datum-defining stations; solved with least-shift constraints on
    /// the datum stations.
    Free(DatumDefect),
}

#[derive(Debug, Clone)]
pub struct Network {
    dimension: Dimension,
    stations: Vec<Station>,
    observations: Vec<Observation>,
    station_index: HashMap<String, usize>,
    /// Resolved station indices per observation.
    links: Vec<Vec<usize>>,
    /// A priori σ per observation, defaults applied.
    sigmas: Vec<f64>,
    unknowns: Vec<Unknown>,
    /// Column of each (station, axis), `None` when fixed or outside the dimension.
    coordinate_columns: Vec<[Option<usize>; 3]>,
    /// Current orientation values, parallel to the orientation unknowns.
    orientations: Vec<f64>,
    /// Orientation slot used by each direction observation.
    observation_orientation: Vec<Option<usize>>,
    num_coordinate_unknowns: usize,
    datum: Datum,
    /// Diagonal of the datum weight matrix S, one entry per unknown column;
    /// empty for a constrained network.
    datum_weights: Vec<f64>,
}

/// Copy of every mutable value, used to roll back a failed run.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    points: Vec<[f64; 3]>,
    orientations: Vec<f64>,
}

impl Network {
    /// Validate the input and build the unknown layout.
    pub fn new(
        dimension: Dimension,
        stations: Vec<Station>,
        observations: Vec<Observation>,
        config: &AdjustmentConfig,
    ) -> Result<Self, AdjustmentError> {
        config.validate()?;

        // ── Stations ──────────────────────────────────────────
        let mut station_index = HashMap::with_capacity(stations.len());
        for (i, s) in stations.iter().enumerate() {
            if s.point.iter().any(|c| !c.is_finite()) {
                return Err(AdjustmentError::InvalidValue(format!(
                    "station '{}' has non-finite coordinates",
                    s.id
                )));
            }
            if station_index.insert(s.id.clone(), i).is_some() {
                return Err(AdjustmentError::DuplicateStation(s.id.clone()));
            }
        }

        // ── Observations ──────────────────────────────────────
        let mut links = Vec::with_capacity(observations.len());
        let mut sigmas = Vec::with_capacity(observations.len());
        for obs in &observations {
            let expected = obs.kind.arity();
            if obs.stations.len() != expected {
                return Err(AdjustmentError::ArityMismatch {
                    observation: obs.id.clone(),
                    expected,
                    found: obs.stations.len(),
                });
            }
            if !obs.kind.supported_in(dimension) {
                return Err(AdjustmentError::IncompatibleObservation {
                    observation: obs.id.clone(),
                    kind: obs.kind.name(),
                    dimension,
                });
            }
            if !obs.value.is_finite() {
                return Err(AdjustmentError::InvalidValue(format!(
                    "observation '{}' has a non-finite value",
                    obs.id
                )));
            }

            let mut idx = Vec::with_capacity(expected);
            for sid in &obs.stations {
                let &i = station_index.get(sid).ok_or_else(|| AdjustmentError::UnknownStation {
                    observation: obs.id.clone(),
                    station: sid.clone(),
                })?;
                if idx.contains(&i) {
                    return Err(AdjustmentError::DegenerateGeometry {
                        observation: obs.id.clone(),
                        reason: "station referenced twice",
                    });
                }
                idx.push(i);
            }
            links.push(idx);

            let sigma = obs.sigma.unwrap_or_else(|| config.sigma_defaults.for_kind(obs.kind));
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(AdjustmentError::InvalidSigma { observation: obs.id.clone(), sigma });
            }
            sigmas.push(sigma);
        }

        // ── Unknowns ──────────────────────────────────────────
        let mut unknowns = Vec::new();
        let mut coordinate_columns = vec![[None; 3]; stations.len()];
        for (i, s) in stations.iter().enumerate() {
            if s.fixed {
                continue;
            }
            for &axis in dimension.axes() {
                coordinate_columns[i][axis.index()] = Some(unknowns.len());
                unknowns.push(Unknown::Coordinate { station: i, axis });
            }
        }
        let num_coordinate_unknowns = unknowns.len();

        // One orientation per (station, set), seeded from the first direction
        // of the set as ω = az − r.
        let mut set_slots: HashMap<(usize, u32), usize> = HashMap::new();
        let mut orientations = Vec::new();
        let mut observation_orientation = vec![None; observations.len()];
        for (k, obs) in observations.iter().enumerate() {
            let ObservationKind::Direction { set } = obs.kind else { continue };
            let (from, to) = (links[k][0], links[k][1]);
            let slot = match set_slots.get(&(from, set)) {
                Some(&slot) => slot,
                None => {
                    let az = azimuth(&obs.id, stations[from].point, stations[to].point)?;
                    let slot = orientations.len();
                    orientations.push(normalize_azimuth(az - obs.value));
                    set_slots.insert((from, set), slot);
                    unknowns.push(Unknown::Orientation { station: from, set });
                    slot
                }
            };
            observation_orientation[k] = Some(slot);
        }

        // ── Datum and redundancy ──────────────────────────────
        let controlled = stations.iter().any(|s| s.fixed)
            || observations.iter().any(|o| matches!(o.kind, ObservationKind::Coordinate { .. }));
        let datum = if controlled {
            Datum::Constrained
        } else if config.free_network {
            Datum::Free(DatumDefect::detect(dimension, &observations))
        } else {
            return Err(AdjustmentError::UnderdeterminedNetwork {
                observations: observations.len(),
                unknowns: unknowns.len(),
                datum_defect: DatumDefect::detect(dimension, &observations).count(),
                reason: "no fixed or controlled station and free network not enabled",
            });
        };

        if unknowns.is_empty() {
            return Err(AdjustmentError::NoUnknowns { observations: observations.len() });
        }

        let datum_weights = match &datum {
            Datum::Constrained => Vec::new(),
            Datum::Free(defect) => {
                let mut tie = vec![config.datum_stations.is_empty(); stations.len()];
                for id in &config.datum_stations {
                    let &i = station_index.get(id).ok_or_else(|| {
                        AdjustmentError::InvalidConfig(format!("datum station '{id}' does not exist"))
                    })?;
                    tie[i] = true;
                }
                let count = tie.iter().filter(|&&t| t).count();
                if count < defect.min_datum_stations() {
                    return Err(AdjustmentError::UnderdeterminedNetwork {
                        observations: observations.len(),
                        unknowns: unknowns.len(),
                        datum_defect: defect.count(),
                        reason: "too few datum stations for the datum defect",
                    });
                }
                unknowns
                    .iter()
                    .map(|u| match *u {
                        Unknown::Coordinate { station, .. } if tie[station] => 1.0,
                        _ => 0.0,
                    })
                    .collect()
            }
        };

        let network = Self {
            dimension,
            stations,
            observations,
            station_index,
            links,
            sigmas,
            unknowns,
            coordinate_columns,
            orientations,
            observation_orientation,
            num_coordinate_unknowns,
            datum,
            datum_weights,
        };
        if network.redundancy() < 0 {
            return Err(AdjustmentError::UnderdeterminedNetwork {
                observations: network.observations.len(),
                unknowns: network.unknowns.len(),
                datum_defect: network.datum_defect(),
                reason: "fewer observations than unknowns",
            });
        }
        Ok(network)
    }

    // ─────────────────────────────────────────────────────────
    //  Accessors
    // ─────────────────────────────────────────────────────────

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, id: &str) -> Option<&Station> {
        self.station_index.get(id).map(|&i| &self.stations[i])
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn num_unknowns(&self) -> usize {
        self.unknowns.len()
    }

    pub fn unknowns(&self) -> &[Unknown] {
        &self.unknowns
    }

    pub fn datum(&self) -> &Datum {
        &self.datum
    }

    pub fn is_free(&self) -> bool {
        matches!(self.datum, Datum::Free(_))
    }

    /// Datum weight of every unknown column (1 for coordinates of datum
    /// stations, 0 otherwise); empty unless the network is free.
    pub fn datum_weights(&self) -> &[f64] {
        &self.datum_weights
    }

    pub fn datum_defect(&self) -> usize {
        match &self.datum {
            Datum::Constrained => 0,
            Datum::Free(defect) => defect.count(),
        }
    }

    /// m − n + d; negative for an underdetermined network.
    pub fn redundancy(&self) -> isize {
        self.observations.len() as isize - self.unknowns.len() as isize + self.datum_defect() as isize
    }

    /// Degrees of freedom of the adjustment.
    pub fn degrees_of_freedom(&self) -> usize {
        self.redundancy().max(0) as usize
    }

    pub fn sigma(&self, observation: usize) -> f64 {
        self.sigmas[observation]
    }

    /// Current orientation unknowns in radians, with their station and set.
    pub fn orientations(&self) -> impl Iterator<Item = (usize, u32, f64)> + '_ {
        self.unknowns[self.num_coordinate_unknowns..]
            .iter()
            .zip(&self.orientations)
            .filter_map(|(u, &value)| match *u {
                Unknown::Orientation { station, set } => Some((station, set, value)),
                Unknown::Coordinate { .. } => None,
            })
    }

    pub(crate) fn links(&self, observation: usize) -> &[usize] {
        &self.links[observation]
    }

    pub(crate) fn coordinate_column(&self, station: usize, axis: Axis) -> Option<usize> {
        self.coordinate_columns[station][axis.index()]
    }

    pub(crate) fn orientation_column(&self, observation: usize) -> Option<usize> {
        self.observation_orientation[observation].map(|slot| self.num_coordinate_unknowns + slot)
    }

    pub(crate) fn orientation_value(&self, observation: usize) -> f64 {
        self.observation_orientation[observation]
            .map(|slot| self.orientations[slot])
            .unwrap_or(0.0)
    }

    pub(crate) fn num_coordinate_unknowns(&self) -> usize {
        self.num_coordinate_unknowns
    }

    /// Current value of every unknown, laid out like [`Network::unknowns`].
    pub fn unknown_values(&self) -> Vec<f64> {
        self.unknowns
            .iter()
            .enumerate()
            .map(|(col, u)| match *u {
                Unknown::Coordinate { station, axis } => self.stations[station].point[axis.index()],
                Unknown::Orientation { .. } => self.orientations[col - self.num_coordinate_unknowns],
            })
            .collect()
    }

    /// Weights p⁰ before any robust scaling.
    pub fn a_priori_weights(&self, config: &AdjustmentConfig) -> Vec<f64> {
        match config.mode {
            AdjustmentMode::Ordinary => vec![1.0; self.observations.len()],
            AdjustmentMode::Weighted | AdjustmentMode::Robust => self
                .sigmas
                .iter()
                .map(|s| config.a_priori_variance / (s * s))
                .collect(),
        }
    }

    // ─────────────────────────────────────────────────────────
    //  Mutation (controller only)
    // ─────────────────────────────────────────────────────────

    /// Add a correction vector laid out like [`Network::unknowns`].
    pub(crate) fn apply_corrections(&mut self, dx: &[f64]) {
        for (col, unknown) in self.unknowns.iter().enumerate() {
            match *unknown {
                Unknown::Coordinate { station, axis } => {
                    self.stations[station].point[axis.index()] += dx[col];
                }
                Unknown::Orientation { .. } => {
                    let slot = col - self.num_coordinate_unknowns;
                    self.orientations[slot] = normalize_azimuth(self.orientations[slot] + dx[col]);
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            points: self.stations.iter().map(|s| s.point).collect(),
            orientations: self.orientations.clone(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        for (s, p) in self.stations.iter_mut().zip(snapshot.points) {
            s.point = p;
        }
        self.orientations = snapshot.orientations;
    }

    /// Human-readable label for an unknown, e.g. `P3.x` or `S1.o0`.
    pub fn unknown_label(&self, col: usize) -> String {
        match self.unknowns[col] {
            Unknown::Coordinate { station, axis } => {
                let a = match axis {
                    Axis::X => "x",
                    Axis::Y => "y",
                    Axis::Z => "z",
                };
                format!("{}.{a}", self.stations[station].id)
            }
            Unknown::Orientation { station, set } => {
                format!("{}.o{set}", self.stations[station].id)
            }
        }
    }

    /// Orientation values in the requested unit, keyed by station id and set.
    pub fn orientation_table(&self, unit: AngleUnit) -> Vec<(String, u32, f64)> {
        self.orientations()
            .map(|(st, set, v)| (self.stations[st].id.clone(), set, unit.from_radians(v)))
            .collect()
    }
}
