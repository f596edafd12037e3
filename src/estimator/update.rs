//! Measurement update seam between the estimator and the filter.
//!
//! The estimator owns the graph and the state-slot bookkeeping; the filter
//! owns the motion state and covariance. Slot hooks let the filter resize its
//! covariance whenever a feature or group enters or leaves the state.

use tracing::debug;

use crate::geometry::{project, SE3};
use crate::graph::{Feature, FeatureId, FeatureStatus, Graph, Group, GroupId};

use super::config::CalibrationConfig;

/// Everything the filter sees for one measurement update.
pub struct UpdateRequest<'a> {
    pub graph: &'a Graph,
    pub instate_features: &'a [FeatureId],
    pub oos_features: &'a [FeatureId],
    pub instate_groups: &'a [GroupId],
    /// Groups whose gauge features were lost or which just entered the state.
    pub needs_new_gauge_features: &'a [GroupId],
    pub calibration: &'a CalibrationConfig,
    pub num_gauge_xy_features: usize,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// New filter-side status for each feature the update looked at.
    pub statuses: Vec<(FeatureId, FeatureStatus)>,
    pub error_state_dim: usize,
}

pub trait MeasurementUpdate {
    /// Current body pose estimate (T_sb).
    fn pose(&self) -> SE3;

    fn update(&mut self, request: &UpdateRequest<'_>) -> UpdateOutcome;

    fn on_feature_added(&mut self, _slot: usize, _feature: &Feature) {}

    fn on_feature_removed(&mut self, _slot: usize) {}

    fn on_group_added(&mut self, _slot: usize, _group: &Group) {}

    fn on_group_removed(&mut self, _slot: usize) {}
}

/// Error states per in-state feature and group.
const FEATURE_ERROR_STATES: usize = 3;
const GROUP_ERROR_STATES: usize = 6;

/// Reference update that gates features on their reprojection error at the
/// externally supplied pose.
#[derive(Debug, Clone)]
pub struct ReprojectionGate {
    pose: SE3,
    /// Largest accepted residual in normalized image coordinates.
    gate: f64,
}

impl ReprojectionGate {
    pub fn new(gate: f64) -> Self {
        Self {
            pose: SE3::identity(),
            gate,
        }
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
    }

    pub fn residual(&self, graph: &Graph, fid: FeatureId, t_body_cam: &SE3) -> Option<f64> {
        let feature = graph.feature(fid)?;
        let reference = graph.group(feature.ref_group?)?;
        let camera_from_world = self.pose.compose(t_body_cam).inverse();
        let p_world = reference.camera_pose(t_body_cam).transform_point(&feature.xc);
        let predicted = project(&camera_from_world.transform_point(&p_world))?;
        Some((feature.keypoint - predicted).norm())
    }
}

impl Default for ReprojectionGate {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl MeasurementUpdate for ReprojectionGate {
    fn pose(&self) -> SE3 {
        self.pose
    }

    fn update(&mut self, request: &UpdateRequest<'_>) -> UpdateOutcome {
        let t_body_cam = request.calibration.body_camera.to_se3();
        let mut outcome = UpdateOutcome::default();

        for &fid in request.instate_features.iter().chain(request.oos_features) {
            let Some(feature) = request.graph.feature(fid) else {
                continue;
            };
            let accepted = self
                .residual(request.graph, fid, &t_body_cam)
                .is_some_and(|r| r <= self.gate);
            let status = match (accepted, feature.status) {
                (false, _) => FeatureStatus::RejectedByFilter,
                (true, FeatureStatus::Gauge) => FeatureStatus::Gauge,
                (true, FeatureStatus::Dropped) => FeatureStatus::Dropped,
                (true, _) => FeatureStatus::Ready,
            };
            outcome.statuses.push((fid, status));
        }

        for &gid in request.needs_new_gauge_features {
            let mut gauges = request
                .graph
                .features_of(gid)
                .iter()
                .filter(|f| f.instate && f.ref_group == Some(gid) && f.status == FeatureStatus::Gauge)
                .count();
            for (fid, status) in outcome.statuses.iter_mut() {
                if gauges >= request.num_gauge_xy_features {
                    break;
                }
                if *status != FeatureStatus::Ready {
                    continue;
                }
                let owned = request
                    .graph
                    .feature(*fid)
                    .is_some_and(|f| f.instate && f.ref_group == Some(gid));
                if owned {
                    *status = FeatureStatus::Gauge;
                    gauges += 1;
                }
            }
            debug!("[Update] group {} has {} gauge features", gid, gauges);
        }

        outcome.error_state_dim = request.calibration.error_state_dim()
            + FEATURE_ERROR_STATES * request.instate_features.len()
            + GROUP_ERROR_STATES * request.instate_groups.len();
        outcome
    }
}
