//! Per-feature depth estimation: early triangulation, the depth subfilter of
//! out-of-state features, and multi-view depth refinement.
//!
//! All poses handed to the solver are camera poses `T_sc` (camera to world).

use nalgebra::{Matrix2, RowVector2, Vector2, Vector3};
use serde::Deserialize;

use crate::geometry::{project, SE3};
use crate::graph::{Feature, FeatureStatus};

/// A keypoint together with the camera pose it was observed from.
#[derive(Debug, Clone, Copy)]
pub struct CameraObservation {
    pub camera_pose: SE3,
    pub keypoint: Vector2<f64>,
}

impl CameraObservation {
    pub fn new(camera_pose: SE3, keypoint: Vector2<f64>) -> Self {
        Self {
            camera_pose,
            keypoint,
        }
    }

    /// Unit-depth bearing of the keypoint, rotated into the world frame.
    fn world_ray(&self) -> Vector3<f64> {
        self.camera_pose
            .transform_vector(&Vector3::new(self.keypoint.x, self.keypoint.y, 1.0))
    }
}

/// Depth estimation for a single feature.
pub trait FeatureSolver {
    /// Two-view triangulation against the reference view. Sets
    /// `feature.triangulated` and returns whether it succeeded.
    fn triangulate(
        &mut self,
        feature: &mut Feature,
        reference: &CameraObservation,
        current: &CameraObservation,
    ) -> bool;

    /// One subfilter step with the current keypoint of the feature.
    ///
    /// Rejected measurements increment `feature.outlier_counter`.
    fn subfilter_update(
        &mut self,
        feature: &mut Feature,
        reference_camera: &SE3,
        current: &CameraObservation,
    );

    /// Refine depth over all observations. Returns false if refinement failed.
    fn refine_depth(
        &mut self,
        feature: &mut Feature,
        reference_camera: &SE3,
        observations: &[CameraObservation],
    ) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Minimum angle between the two viewing rays.
    pub min_parallax_deg: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            min_parallax_deg: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubfilterConfig {
    /// Keypoint noise in normalized image coordinates.
    pub measurement_std: f64,
    /// Chi-square gate on the innovation (2 dof).
    pub outlier_gate: f64,
}

impl Default for SubfilterConfig {
    fn default() -> Self {
        Self {
            measurement_std: 0.005,
            outlier_gate: 9.21,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub max_iterations: usize,
    /// Relative depth step below which the iteration has converged.
    pub tolerance: f64,
    pub min_depth: f64,
    pub max_depth: f64,
    /// Largest acceptable mean reprojection error after refinement.
    pub max_mean_residual: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-6,
            min_depth: 0.05,
            max_depth: 100.0,
            max_mean_residual: 0.02,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub triangulation: TriangulationConfig,
    pub subfilter: SubfilterConfig,
    pub refinement: RefinementConfig,
}

/// Below this the depth is unobservable from the given views.
const MIN_INFORMATION: f64 = 1e-12;

/// Reference solver working purely on reprojection geometry.
#[derive(Debug, Clone, Default)]
pub struct GeometricSolver {
    config: SolverConfig,
}

impl GeometricSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

/// Predicted keypoint of a feature at `depth` along its reference ray.
fn predict(
    feature: &Feature,
    depth: f64,
    reference_camera: &SE3,
    camera_from_world: &SE3,
) -> Option<Vector2<f64>> {
    let z = feature.depth();
    if z.abs() <= f64::EPSILON {
        return None;
    }
    let p_ref = feature.xc * (depth / z);
    let p_world = reference_camera.transform_point(&p_ref);
    project(&camera_from_world.transform_point(&p_world))
}

/// Residual and its derivative with respect to depth, by central differences.
fn linearize(
    feature: &Feature,
    depth: f64,
    reference_camera: &SE3,
    obs: &CameraObservation,
) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let camera_from_world = obs.camera_pose.inverse();
    let step = 1e-4 * depth.abs().max(1.0);
    let predicted = predict(feature, depth, reference_camera, &camera_from_world)?;
    let plus = predict(feature, depth + step, reference_camera, &camera_from_world)?;
    let minus = predict(feature, depth - step, reference_camera, &camera_from_world)?;
    Some((obs.keypoint - predicted, (plus - minus) / (2.0 * step)))
}

impl FeatureSolver for GeometricSolver {
    fn triangulate(
        &mut self,
        feature: &mut Feature,
        reference: &CameraObservation,
        current: &CameraObservation,
    ) -> bool {
        feature.triangulated = false;

        let b1 = reference.world_ray();
        let b2 = current.world_ray();
        let o1 = reference.camera_pose.translation;
        let o2 = current.camera_pose.translation;

        let cos_parallax = b1.dot(&b2) / (b1.norm() * b2.norm());
        let parallax = cos_parallax.clamp(-1.0, 1.0).acos();
        if parallax < self.config.triangulation.min_parallax_deg.to_radians() {
            return false;
        }

        // Closest points o1 + s*b1 and o2 + t*b2 on the two rays.
        let a = b1.dot(&b1);
        let b = b1.dot(&b2);
        let c = b2.dot(&b2);
        let w = o1 - o2;
        let d = b1.dot(&w);
        let e = b2.dot(&w);
        let denom = a * c - b * b;
        if denom.abs() < MIN_INFORMATION {
            return false;
        }
        let s = (b * e - c * d) / denom;
        let t = (a * e - b * d) / denom;
        if s <= 0.0 || t <= 0.0 {
            return false;
        }

        let midpoint = ((o1 + b1 * s) + (o2 + b2 * t)) * 0.5;
        let xc = reference.camera_pose.inverse().transform_point(&midpoint);
        if xc.z <= 0.0 {
            return false;
        }

        feature.xc = xc;
        feature.triangulated = true;
        true
    }

    fn subfilter_update(
        &mut self,
        feature: &mut Feature,
        reference_camera: &SE3,
        current: &CameraObservation,
    ) {
        let z = feature.depth();
        let linearized = if z > 0.0 {
            linearize(feature, z, reference_camera, current)
        } else {
            None
        };
        let Some((residual, h)) = linearized else {
            feature.outlier_counter += 1;
            return;
        };

        let p = feature.depth_variance();
        let sigma = self.config.subfilter.measurement_std;
        let s = h * p * h.transpose() + Matrix2::identity() * (sigma * sigma);
        let Some(s_inv) = s.try_inverse() else {
            feature.outlier_counter += 1;
            return;
        };

        let mahalanobis = residual.dot(&(s_inv * residual));
        if mahalanobis > self.config.subfilter.outlier_gate {
            feature.outlier_counter += 1;
            return;
        }

        let gain: RowVector2<f64> = h.transpose() * s_inv * p;
        let new_depth = z + (gain * residual)[0];
        if new_depth <= 0.0 {
            feature.outlier_counter += 1;
            return;
        }
        let new_variance = (1.0 - (gain * h)[0]) * p;

        feature.set_depth(new_depth);
        feature.covariance[(2, 2)] = new_variance.max(0.0);
        if feature.status == FeatureStatus::Created {
            feature.status = FeatureStatus::Ready;
        }
    }

    fn refine_depth(
        &mut self,
        feature: &mut Feature,
        reference_camera: &SE3,
        observations: &[CameraObservation],
    ) -> bool {
        let cfg = &self.config.refinement;
        if observations.len() < 2 || feature.depth() <= 0.0 {
            return false;
        }

        let mut depth = feature.depth();
        let mut information = 0.0;
        for _ in 0..cfg.max_iterations {
            let mut jtj = 0.0;
            let mut jtr = 0.0;
            for obs in observations {
                let Some((r, j)) = linearize(feature, depth, reference_camera, obs) else {
                    return false;
                };
                jtj += j.dot(&j);
                jtr += j.dot(&r);
            }
            information = jtj;
            if jtj < MIN_INFORMATION {
                break;
            }

            let delta = jtr / jtj;
            depth += delta;
            if !(cfg.min_depth..=cfg.max_depth).contains(&depth) {
                return false;
            }
            if delta.abs() < cfg.tolerance * depth {
                break;
            }
        }

        let mut total = 0.0;
        for obs in observations {
            let Some((r, _)) = linearize(feature, depth, reference_camera, obs) else {
                return false;
            };
            total += r.norm();
        }
        if total / observations.len() as f64 > cfg.max_mean_residual {
            return false;
        }

        feature.set_depth(depth);
        if information >= MIN_INFORMATION {
            let sigma = self.config.subfilter.measurement_std;
            feature.covariance[(2, 2)] = sigma * sigma / information;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FeatureId;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera_at(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
    }

    fn observe(camera: &SE3, point: &Vector3<f64>) -> CameraObservation {
        let uv = project(&camera.inverse().transform_point(point)).unwrap();
        CameraObservation::new(*camera, uv)
    }

    /// Feature anchored at the origin camera, looking at `point`, placed at `depth`.
    fn feature_towards(point: &Vector3<f64>, depth: f64, depth_std: f64) -> Feature {
        let uv = project(point).unwrap();
        let mut f = Feature::new(FeatureId::new(0), uv);
        f.initialize(depth, &Vector3::new(0.01, 0.01, depth_std));
        f
    }

    #[test]
    fn test_triangulate_two_views() {
        let point = Vector3::new(0.5, -0.2, 4.0);
        let reference = observe(&camera_at(0.0), &point);
        let current = observe(&camera_at(0.5), &point);
        let mut f = feature_towards(&point, 1.0, 1.0);
        let mut solver = GeometricSolver::default();

        assert!(solver.triangulate(&mut f, &reference, &current));
        assert!(f.triangulated);
        assert_relative_eq!(f.xc, point, epsilon = 1e-9);
    }

    #[test]
    fn test_triangulate_without_parallax_fails() {
        let point = Vector3::new(0.0, 0.0, 4.0);
        let reference = observe(&camera_at(0.0), &point);
        let current = observe(&camera_at(0.0), &point);
        let mut f = feature_towards(&point, 1.0, 1.0);
        let mut solver = GeometricSolver::default();

        assert!(!solver.triangulate(&mut f, &reference, &current));
        assert!(!f.triangulated);
    }

    #[test]
    fn test_subfilter_moves_depth_towards_truth() {
        let point = Vector3::new(0.2, 0.1, 4.0);
        let current = observe(&camera_at(0.3), &point);
        let mut f = feature_towards(&point, 3.0, 2.0);
        let mut solver = GeometricSolver::default();

        solver.subfilter_update(&mut f, &camera_at(0.0), &current);

        assert_eq!(f.status, FeatureStatus::Ready);
        assert_eq!(f.outlier_counter, 0);
        assert!((f.depth() - 4.0).abs() < 1.0);
        assert!(f.depth_variance() < 4.0);
    }

    #[test]
    fn test_subfilter_gates_outliers() {
        let point = Vector3::new(0.2, 0.1, 4.0);
        let mut current = observe(&camera_at(0.3), &point);
        current.keypoint += Vector2::new(0.0, 0.3);
        let mut f = feature_towards(&point, 4.0, 0.1);
        let mut solver = GeometricSolver::default();

        solver.subfilter_update(&mut f, &camera_at(0.0), &current);

        assert_eq!(f.outlier_counter, 1);
        assert_eq!(f.status, FeatureStatus::Created);
        assert_relative_eq!(f.depth(), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_refine_depth_converges() {
        let point = Vector3::new(-0.3, 0.2, 5.0);
        let observations = vec![
            observe(&camera_at(0.0), &point),
            observe(&camera_at(0.4), &point),
            observe(&camera_at(0.8), &point),
        ];
        let mut f = feature_towards(&point, 3.5, 2.0);
        let mut solver = GeometricSolver::default();

        assert!(solver.refine_depth(&mut f, &camera_at(0.0), &observations));
        assert_relative_eq!(f.depth(), 5.0, epsilon = 1e-6);
        assert!(f.depth_variance() < 4.0);
    }

    #[test]
    fn test_refine_depth_needs_two_views() {
        let point = Vector3::new(0.0, 0.0, 5.0);
        let observations = vec![observe(&camera_at(0.0), &point)];
        let mut f = feature_towards(&point, 3.0, 1.0);
        let mut solver = GeometricSolver::default();

        assert!(!solver.refine_depth(&mut f, &camera_at(0.0), &observations));
        assert_relative_eq!(f.depth(), 3.0);
    }

    #[test]
    fn test_refine_depth_rejects_inconsistent_views() {
        let point = Vector3::new(0.0, 0.0, 5.0);
        let mut far = observe(&camera_at(0.5), &point);
        far.keypoint.y += 0.2;
        let observations = vec![observe(&camera_at(0.0), &point), far];
        let mut f = feature_towards(&point, 5.0, 1.0);
        let mut solver = GeometricSolver::default();

        assert!(!solver.refine_depth(&mut f, &camera_at(0.0), &observations));
    }
}
