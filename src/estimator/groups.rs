//! Group lifecycle: discard policies, ownership reassignment, spawning the
//! per-step group and pruning stale groups.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, info};

use crate::graph::{FeatureId, FeatureStatus, GroupId, TrackStatus};

use super::estimator::{Estimator, StepContext};
use super::report::{DiscardReason, GroupDiscard};
use super::solver::FeatureSolver;
use super::update::MeasurementUpdate;

impl<U: MeasurementUpdate, S: FeatureSolver> Estimator<U, S> {
    /// In-state groups among `affected` with too few in-state features.
    pub(super) fn floating_groups(&self, affected: &BTreeSet<GroupId>) -> Vec<(GroupId, DiscardReason)> {
        let threshold = self.config.num_gauge_xy_features;
        affected
            .iter()
            .filter(|&&gid| self.graph.group(gid).is_some_and(|g| g.instate))
            .filter_map(|&gid| {
                let instate_refs = self.graph.num_instate_referencing(gid);
                (instate_refs < threshold || instate_refs == 0)
                    .then_some((gid, DiscardReason::Floating { instate_refs }))
            })
            .collect()
    }

    /// OOS mode: once every group slot is taken, free the slots of groups
    /// without in-state features, keeping the oldest and every n-th group.
    pub(super) fn recyclable_groups(&self) -> Vec<(GroupId, DiscardReason)> {
        let mut groups = self.graph.instate_groups();
        if groups.len() != self.config.max_groups {
            return Vec::new();
        }
        groups.sort_unstable();
        let step = self.config.oos_discard_step.max(1);
        groups
            .into_iter()
            .enumerate()
            .skip(1)
            .filter(|(i, _)| i % step != 0)
            .filter(|&(_, gid)| self.graph.num_instate_referencing(gid) == 0)
            .map(|(_, gid)| (gid, DiscardReason::Recycled))
            .collect()
    }

    /// Re-parent the features owned by `discards`, destroy those left without
    /// a reference, then take the groups out of the state.
    pub(super) fn discard_with_reassignment(
        &mut self,
        discards: &[(GroupId, DiscardReason)],
        pre_update: bool,
        ctx: &mut StepContext,
    ) -> Result<()> {
        if discards.is_empty() {
            return Ok(());
        }
        let batch: BTreeSet<GroupId> = discards.iter().map(|&(gid, _)| gid).collect();

        let mut moves = Vec::new();
        let mut nullrefs = Vec::new();
        for &gid in &batch {
            for f in self.graph.features_of(gid) {
                if f.ref_group != Some(gid) {
                    continue;
                }
                let owner = self
                    .graph
                    .groups_of(f.id)
                    .into_iter()
                    .filter(|g| !batch.contains(&g.id) && (!f.instate || g.instate))
                    .min_by_key(|g| (!g.instate, g.id));
                match owner {
                    Some(g) => moves.push((f.id, gid, g.id)),
                    None => nullrefs.push(f.id),
                }
            }
        }

        for (fid, from, to) in moves {
            self.reassign_feature(fid, from, to);
            ctx.report.reassigned_features.push((fid, to));
        }

        if !nullrefs.is_empty() {
            info!(
                "[Discard] destroying {} features without a surviving owner{}: {:?}",
                nullrefs.len(),
                if pre_update { " before the update" } else { "" },
                nullrefs
            );
        }
        for &fid in &nullrefs {
            self.remove_feature_from_state(fid);
            self.destroy_feature(fid, ctx);
        }
        ctx.report.nullref_features.extend(nullrefs);

        for &(gid, reason) in discards {
            info!("[Discard] group {} leaves the state ({:?})", gid, reason);
            self.remove_group_from_state(gid);
            if self.config.use_oos {
                self.retire_group(gid);
            }
            ctx.report.discarded_groups.push(GroupDiscard {
                group: gid,
                reason,
                pre_update,
            });
        }
        Ok(())
    }

    /// Re-express a feature against another adjacent group.
    fn reassign_feature(&mut self, fid: FeatureId, from: GroupId, to: GroupId) {
        let (Some(old), Some(new)) = (self.graph.group(from), self.graph.group(to)) else {
            return;
        };
        let new_from_old = new
            .camera_pose(&self.t_body_cam)
            .inverse()
            .compose(&old.camera_pose(&self.t_body_cam));
        if let Some(f) = self.graph.feature_mut(fid) {
            f.change_ref(to, &new_from_old.rotation_matrix(), &new_from_old.translation);
            debug!("[Discard] {} now references {}", fid, to);
        }
    }

    /// Detach a group from the graph and hand it to the mapper.
    fn retire_group(&mut self, gid: GroupId) {
        let adjacency = self.graph.remove_group(gid);
        if let Some(group) = self.graph.destroy_group(gid) {
            if let Some(mapper) = &self.mapper {
                mapper.hand_off_group(group, adjacency);
            }
        }
    }

    /// Create this step's group at the current pose estimate.
    pub(super) fn spawn_group(&mut self, timestamp_ns: u64, ctx: &mut StepContext) -> GroupId {
        let gid = self.graph.create_group(timestamp_ns, self.updater.pose());
        self.graph.add_group(gid);
        if self.config.use_oos && !self.add_group_to_state(gid) {
            self.warn_capacity("group");
        }
        ctx.report.new_group = Some(gid);
        gid
    }

    /// Anchor new features to `gid` and link every tracked feature to it.
    /// Returns the next track list.
    pub(super) fn attach_features(&mut self, gid: GroupId, ctx: &mut StepContext) -> Result<Vec<FeatureId>> {
        let new_features = std::mem::take(&mut ctx.new_features);
        let init_z = self.depth.value();
        let std = self.config.init_noise.std();
        let std_badtri = self.config.init_noise.std_badtri();
        let triangulate = self.config.triangulate_pre_subfilter;
        let mut tracks = Vec::with_capacity(new_features.len());

        for fid in new_features {
            let Some(f) = self.graph.feature_mut(fid) else {
                continue;
            };
            let fresh = f.track_status == TrackStatus::Created
                && f.status == FeatureStatus::Created
                && f.ref_group.is_none();
            self.invariants
                .check(fresh, || format!("new feature {} was already anchored", fid))?;

            f.ref_group = Some(gid);
            if triangulate && !f.triangulated {
                f.initialize(init_z, &std_badtri);
            } else {
                f.initialize(init_z, &std);
            }
            let keypoint = f.keypoint;
            self.graph.add_feature(fid);
            self.graph.add_edge(fid, gid, keypoint);
            tracks.push(fid);
        }

        for fid in self.tracked_graph_features() {
            let Some(f) = self.graph.feature(fid) else {
                continue;
            };
            let anchored = f.ref_group.is_some();
            let keypoint = f.keypoint;
            self.invariants
                .check(anchored, || format!("tracked feature {} has no reference group", fid))?;
            self.graph.add_edge(fid, gid, keypoint);
            tracks.push(fid);
        }
        Ok(tracks)
    }

    /// Retire old groups that no feature references any more.
    pub(super) fn prune_groups(&mut self, ctx: &mut StepContext) -> Result<()> {
        let max_lifetime = self.config.max_group_lifetime;
        let stale = self.graph.groups_if(|g| g.lifetime > max_lifetime);
        for gid in stale {
            if self.graph.is_referenced(gid) {
                continue;
            }
            let instate = self.graph.group(gid).is_some_and(|g| g.instate);
            self.invariants
                .check(!instate, || format!("pruned group {} is still in state", gid))?;
            if instate {
                self.remove_group_from_state(gid);
            }
            self.retire_group(gid);
            ctx.report.pruned_groups.push(gid);
        }
        if !ctx.report.pruned_groups.is_empty() {
            debug!("[Discard] pruned groups {:?}", ctx.report.pruned_groups);
        }
        Ok(())
    }
}
