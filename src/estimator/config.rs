//! Estimator configuration.
//!
//! Every section has a `Default` so a YAML file only needs to list the values
//! it overrides. All values are read-only while a step runs.

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::Deserialize;

use crate::geometry::SE3;

use super::solver::SolverConfig;

/// How invariant violations inside a step are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantMode {
    /// Fail the step with an error.
    Strict,
    /// Skip the check.
    Production,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Feature slots in the filter state.
    pub max_features: usize,
    /// Group slots in the filter state.
    pub max_groups: usize,
    /// Minimum in-state features a group must own to stay in state.
    pub num_gauge_xy_features: usize,
    /// Steps an unreferenced group survives before it is pruned (non-OOS mode).
    pub max_group_lifetime: u32,
    /// Use dropped out-of-state features for one-shot OOS updates.
    pub use_oos: bool,
    /// Keep every n-th in-state group when recycling group slots (OOS mode).
    pub oos_discard_step: usize,
    /// Refine depth of candidates and OOS features before use.
    pub use_depth_opt: bool,
    /// Triangulate out-of-state features on their second view.
    pub triangulate_pre_subfilter: bool,
    /// Steps that use the relaxed candidate criterion.
    pub strict_criteria_timesteps: u64,
    /// Outlier count above which an out-of-state feature is destroyed.
    pub remove_outlier_counter: u32,
    pub depth: DepthConfig,
    pub init_noise: InitNoiseConfig,
    pub criteria: CriteriaConfig,
    pub solver: SolverConfig,
    pub invariant_mode: InvariantMode,
    pub calibration: CalibrationConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_features: 30,
            max_groups: 10,
            num_gauge_xy_features: 3,
            max_group_lifetime: 1,
            use_oos: false,
            oos_discard_step: 3,
            use_depth_opt: true,
            triangulate_pre_subfilter: false,
            strict_criteria_timesteps: 20,
            remove_outlier_counter: 10,
            depth: DepthConfig::default(),
            init_noise: InitNoiseConfig::default(),
            criteria: CriteriaConfig::default(),
            solver: SolverConfig::default(),
            invariant_mode: InvariantMode::Strict,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl EstimatorConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse estimator config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_features > 0, "max_features must be positive");
        ensure!(self.max_groups > 0, "max_groups must be positive");
        ensure!(self.oos_discard_step >= 1, "oos_discard_step must be at least 1");
        ensure!(
            self.depth.min_z > 0.0 && self.depth.min_z < self.depth.max_z,
            "depth range [{}, {}] is empty",
            self.depth.min_z,
            self.depth.max_z
        );
        ensure!(
            (self.depth.min_z..=self.depth.max_z).contains(&self.depth.init_z),
            "init_z {} outside depth range",
            self.depth.init_z
        );
        ensure!(
            (0.0..=1.0).contains(&self.depth.median_weight),
            "median_weight must lie in [0, 1]"
        );
        Ok(())
    }
}

/// Initial depth and its adaptation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    pub init_z: f64,
    pub min_z: f64,
    pub max_z: f64,
    /// Blend weight of the observed median depth.
    pub median_weight: f64,
    /// Out-of-state features must be older than this to vote.
    pub min_feature_lifetime: u32,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            init_z: 2.5,
            min_z: 0.05,
            max_z: 50.0,
            median_weight: 0.05,
            min_feature_lifetime: 5,
        }
    }
}

/// 1-sigma initialization noise of new features in (x, y, z).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitNoiseConfig {
    pub std: [f64; 3],
    /// Used when early triangulation is enabled but did not succeed.
    pub std_badtri: [f64; 3],
}

impl InitNoiseConfig {
    pub fn std(&self) -> Vector3<f64> {
        Vector3::from(self.std)
    }

    pub fn std_badtri(&self) -> Vector3<f64> {
        Vector3::from(self.std_badtri)
    }
}

impl Default for InitNoiseConfig {
    fn default() -> Self {
        Self {
            std: [0.01, 0.01, 1.0],
            std_badtri: [0.02, 0.02, 2.0],
        }
    }
}

/// Thresholds of the strict candidate criterion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CriteriaConfig {
    pub strict_min_lifetime: u32,
    pub strict_max_outliers: u32,
}

impl Default for CriteriaConfig {
    fn default() -> Self {
        Self {
            strict_min_lifetime: 3,
            strict_max_outliers: 0,
        }
    }
}

/// Body-to-camera extrinsics as a quaternion (x, y, z, w) and translation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Extrinsics {
    pub rotation_xyzw: [f64; 4],
    pub translation: [f64; 3],
}

impl Extrinsics {
    pub fn to_se3(&self) -> SE3 {
        let [x, y, z, w] = self.rotation_xyzw;
        SE3::new(
            UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
            Vector3::from(self.translation),
        )
    }
}

impl Default for Extrinsics {
    fn default() -> Self {
        Self {
            rotation_xyzw: [0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImuIntrinsics {
    /// Row-major gyroscope scale/misalignment matrix.
    pub gyro: [f64; 9],
    /// Upper-triangular accelerometer scale/misalignment entries.
    pub accel: [f64; 6],
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: Vec<f64>,
}

/// Calibration states the filter estimates alongside the motion state.
///
/// Each optional section switches a block of error states on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub body_camera: Extrinsics,
    /// Camera-IMU temporal offset in seconds.
    pub temporal_offset: Option<f64>,
    pub imu_intrinsics: Option<ImuIntrinsics>,
    pub camera_intrinsics: Option<CameraIntrinsics>,
}

/// Rotation, translation, velocity, gyro bias, accel bias, gravity.
const MOTION_ERROR_STATES: usize = 17;
const EXTRINSIC_ERROR_STATES: usize = 6;

impl CalibrationConfig {
    /// Dimension of the error state excluding features and groups.
    pub fn error_state_dim(&self) -> usize {
        let mut dim = MOTION_ERROR_STATES + EXTRINSIC_ERROR_STATES;
        if self.temporal_offset.is_some() {
            dim += 1;
        }
        if let Some(imu) = &self.imu_intrinsics {
            dim += imu.gyro.len() + imu.accel.len();
        }
        if let Some(camera) = &self.camera_intrinsics {
            dim += 4 + camera.distortion.len();
        }
        dim
    }
}
