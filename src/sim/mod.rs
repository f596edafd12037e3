//! Simulation and synthetic tracks for exercising the estimator.
//!
//! A seeded scene of landmarks on a cylindrical wall, a camera rig moving on
//! a circle inside it, and a tracker that reports landmark projections with
//! the track statuses a real front end would assign.

pub mod scene;
pub mod tracker;

pub use scene::{CircularTrajectory, Scene};
pub use tracker::{SimTracker, SimTrackerConfig};
