//! Estimator module - per-frame feature and group bookkeeping.
//!
//! This module contains:
//! - [`Estimator`] - The context object that owns the graph and state slots
//! - [`MeasurementUpdate`] - The seam to the filter, with a reference gate
//! - [`FeatureSolver`] - Triangulation, depth subfilter and depth refinement
//! - [`EstimatorConfig`] - YAML-loadable thresholds

pub mod config;
pub mod criteria;
pub mod depth;
pub mod estimator;
pub mod invariants;
pub mod report;
pub mod slots;
pub mod solver;
pub mod update;

mod groups;
mod lifecycle;
mod promotion;

#[cfg(test)]
mod tests;

pub use config::{CalibrationConfig, EstimatorConfig, InvariantMode};
pub use criteria::Criterion;
pub use depth::{AdaptiveDepth, DepthAdaptation};
pub use estimator::Estimator;
pub use report::{DiscardReason, GroupDiscard, StepReport};
pub use slots::StateSlots;
pub use solver::{CameraObservation, FeatureSolver, GeometricSolver, SolverConfig};
pub use update::{MeasurementUpdate, ReprojectionGate, UpdateOutcome, UpdateRequest};
