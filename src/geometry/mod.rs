//! Geometry utilities: rigid transforms and pinhole projection helpers.

pub mod se3;

pub use se3::{project, SE3};
