//! SE(3) rigid transform used for group anchor poses and calibration.
//!
//! Poses follow the `T_target_source` convention: a group pose `T_sb` maps
//! points from the body frame into the spatial (world) frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector2, Vector3};

/// Depths below this are treated as behind the camera.
const MIN_PROJECTION_DEPTH: f64 = 1e-6;

/// Rigid body transform (rotation + translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a 4x4 homogeneous matrix. The rotation block is assumed orthonormal.
    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let rotation =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
        let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self {
            rotation,
            translation,
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Project a camera-frame point onto the normalized image plane.
///
/// Returns `None` for points at or behind the optical center.
pub fn project(p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
    if p_cam.z <= MIN_PROJECTION_DEPTH {
        return None;
    }
    Some(Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z))
}
