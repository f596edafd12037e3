//! Landmarks and rig trajectory.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::geometry::SE3;

/// Landmarks scattered on a vertical cylinder around the origin.
#[derive(Debug, Clone)]
pub struct Scene {
    pub landmarks: Vec<Vector3<f64>>,
}

impl Scene {
    /// `n` landmarks at roughly `radius` from the z axis, heights in
    /// `[-half_height, half_height]`.
    pub fn cylinder(n: usize, radius: f64, half_height: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let landmarks = (0..n)
            .map(|_| {
                let angle = rng.gen_range(0.0..2.0 * PI);
                let r = radius + rng.gen_range(-0.5..0.5);
                let z = rng.gen_range(-half_height..half_height);
                Vector3::new(r * angle.cos(), r * angle.sin(), z)
            })
            .collect();
        Self { landmarks }
    }
}

/// Camera moving on a horizontal circle and looking outwards.
#[derive(Debug, Clone)]
pub struct CircularTrajectory {
    pub radius: f64,
    /// Angle advanced per step, in radians.
    pub angular_step: f64,
}

impl CircularTrajectory {
    pub fn new(radius: f64, angular_step: f64) -> Self {
        Self {
            radius,
            angular_step,
        }
    }

    /// Camera pose (T_sc) at a step. Camera z points away from the circle
    /// centre and y points down.
    pub fn camera_pose(&self, step: u64) -> SE3 {
        let theta = self.angular_step * step as f64;
        let (s, c) = theta.sin_cos();
        let z_axis = Vector3::new(c, s, 0.0);
        let x_axis = Vector3::new(s, -c, 0.0);
        let y_axis = z_axis.cross(&x_axis);
        let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x_axis, y_axis, z_axis]));
        SE3::new(
            UnitQuaternion::from_rotation_matrix(&rotation),
            Vector3::new(self.radius * c, self.radius * s, 0.0),
        )
    }

    /// Body pose (T_sb) at a step for the given body-camera extrinsics.
    pub fn body_pose(&self, step: u64, t_body_cam: &SE3) -> SE3 {
        self.camera_pose(step).compose(&t_body_cam.inverse())
    }
}
