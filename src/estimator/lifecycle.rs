//! Feature lifecycle: classification of the tracker's features at the start
//! of a step, and the depth subfilter for out-of-state features.

use anyhow::Result;
use tracing::{debug, info};

use crate::graph::{FeatureId, FeatureStatus, TrackStatus};

use super::estimator::{Estimator, StepContext};
use super::solver::{CameraObservation, FeatureSolver};
use super::update::MeasurementUpdate;

impl<U: MeasurementUpdate, S: FeatureSolver> Estimator<U, S> {
    /// Partition the incoming track list. Returns the features retained for
    /// the update and for promotion; new features go to `ctx.new_features`.
    pub(super) fn classify_tracks(
        &mut self,
        tracks: Vec<FeatureId>,
        ctx: &mut StepContext,
    ) -> Result<Vec<FeatureId>> {
        let mut retained = Vec::with_capacity(tracks.len());

        for fid in tracks {
            let Some(f) = self.graph.feature(fid) else {
                self.invariants
                    .check(false, || format!("track list holds dead feature {}", fid))?;
                continue;
            };
            let (track_status, instate, status) = (f.track_status, f.instate, f.status);

            match (track_status, instate) {
                (TrackStatus::Created, _) => ctx.new_features.push(fid),
                (TrackStatus::Rejected, _) | (TrackStatus::Dropped, true) => {
                    self.retire_lost_feature(fid, instate, status, ctx)?;
                }
                (TrackStatus::Dropped, false) => {
                    if self.config.use_oos {
                        if let Some(f) = self.graph.feature_mut(fid) {
                            f.status = FeatureStatus::Dropped;
                        }
                        self.oos_features.push(fid);
                    } else {
                        self.destroy_feature(fid, ctx);
                    }
                }
                (TrackStatus::Tracked, true) => retained.push(fid),
                (TrackStatus::Tracked, false) => {
                    if self.run_subfilter(fid)? {
                        retained.push(fid);
                    } else {
                        debug!("[Lifecycle] {} exceeded the outlier budget", fid);
                        self.destroy_feature(fid, ctx);
                    }
                }
            }
        }
        Ok(retained)
    }

    /// Detach a feature the tracker lost or rejected and hand it to the mapper.
    fn retire_lost_feature(
        &mut self,
        fid: FeatureId,
        instate: bool,
        status: FeatureStatus,
        ctx: &mut StepContext,
    ) -> Result<()> {
        let reference = self.graph.feature(fid).and_then(|f| f.ref_group);
        let adjacency = self.graph.remove_feature(fid);

        if instate {
            info!("[Lifecycle] tracker lost in-state feature {}", fid);
            self.invariants.check(reference.is_some(), || {
                format!("in-state feature {} has no reference group", fid)
            })?;
            if let Some(gid) = reference {
                if status == FeatureStatus::Gauge {
                    info!("[Lifecycle] group {} lost gauge feature {}", gid, fid);
                    ctx.needs_new_gauge_features.push(gid);
                }
                ctx.affected_groups.insert(gid);
            }
            self.remove_feature_from_state(fid);
        }

        self.deactivate_feature(fid, adjacency, ctx);
        Ok(())
    }

    /// One subfilter step for a tracked out-of-state feature. Returns whether
    /// the feature stays within its outlier budget.
    fn run_subfilter(&mut self, fid: FeatureId) -> Result<bool> {
        let reference = self.graph.feature(fid).and_then(|f| {
            let gid = f.ref_group?;
            let keypoint = *self.graph.feature_adj(fid)?.get(&gid)?;
            let camera = self.graph.group(gid)?.camera_pose(&self.t_body_cam);
            Some((CameraObservation::new(camera, keypoint), f.num_observations))
        });
        let Some((reference, num_observations)) = reference else {
            self.invariants.check(false, || {
                format!("tracked feature {} is not anchored in the graph", fid)
            })?;
            return Ok(false);
        };

        let current_camera = self.current_camera();
        let triangulate = self.config.triangulate_pre_subfilter && num_observations == 2;
        let max_outliers = self.config.remove_outlier_counter;
        let Some(feature) = self.graph.feature_mut(fid) else {
            return Ok(false);
        };
        let current = CameraObservation::new(current_camera, feature.keypoint);

        if triangulate {
            self.solver.triangulate(feature, &reference, &current);
        }
        self.solver
            .subfilter_update(feature, &reference.camera_pose, &current);

        Ok(feature.outlier_counter <= max_outliers)
    }
}
