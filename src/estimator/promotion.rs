//! Candidate promotion into free state slots, and OOS depth refinement.

use anyhow::Result;
use tracing::{debug, error, info};

use crate::graph::{Feature, FeatureId};

use super::criteria::{candidate_order, Criterion};
use super::estimator::{Estimator, StepContext};
use super::solver::FeatureSolver;
use super::update::MeasurementUpdate;

impl<U: MeasurementUpdate, S: FeatureSolver> Estimator<U, S> {
    pub(super) fn promote_candidates(&mut self, ctx: &mut StepContext) -> Result<()> {
        let criterion = Criterion::for_step(self.vision_counter, self.config.strict_criteria_timesteps);
        let criteria = &self.config.criteria;
        let mut candidates: Vec<&Feature> = self
            .graph
            .features_if(|f| criterion.accepts(f, criteria))
            .into_iter()
            .filter_map(|fid| self.graph.feature(fid))
            .collect();
        candidates.sort_by(|a, b| candidate_order(a, b));
        candidates.dedup_by_key(|f| f.id);
        let ordered: Vec<FeatureId> = candidates.iter().map(|f| f.id).collect();
        if ordered.is_empty() {
            return Ok(());
        }

        let mut free_group_slots = self.slots.free_group_slots();
        let mut refinement_failures = Vec::new();
        debug!(
            "[Promotion] {} candidates ({:?}), {} free group slots",
            ordered.len(),
            criterion,
            free_group_slots
        );

        for fid in ordered {
            if self.instate_features.len() >= self.config.max_features {
                break;
            }

            if self.config.use_depth_opt {
                let observations = self.camera_observations(fid);
                if observations.is_empty() {
                    error!("[Promotion] candidate {} has no observations", fid);
                    self.invariants
                        .check(false, || format!("candidate {} has no observations", fid))?;
                } else if observations.len() > 1 && !self.refine_feature_depth(fid, &observations) {
                    refinement_failures.push(fid);
                    continue;
                }
            }

            let Some(gid) = self.graph.feature(fid).and_then(|f| f.ref_group) else {
                continue;
            };
            let Some(group_instate) = self.graph.group(gid).map(|g| g.instate) else {
                self.invariants
                    .check(false, || format!("candidate {} references dead group {}", fid, gid))?;
                continue;
            };
            if !group_instate && free_group_slots == 0 {
                continue;
            }

            if !self.add_feature_to_state(fid) {
                self.warn_capacity("feature");
                break;
            }
            self.instate_features.push(fid);
            ctx.report.promoted_features.push(fid);

            if !group_instate {
                let linked = self.graph.group_adj(gid).is_some_and(|adj| adj.contains(&fid))
                    && self.graph.feature_adj(fid).is_some_and(|adj| adj.contains_key(&gid));
                self.invariants.check(linked, || {
                    format!("candidate {} is not linked to its reference group {}", fid, gid)
                })?;
                if !self.add_group_to_state(gid) {
                    self.warn_capacity("group");
                    self.remove_feature_from_state(fid);
                    self.instate_features.pop();
                    ctx.report.promoted_features.pop();
                    continue;
                }
                ctx.needs_new_gauge_features.push(gid);
                ctx.report.promoted_groups.push(gid);
                free_group_slots -= 1;
            }
        }

        for &fid in &refinement_failures {
            info!("[Promotion] depth refinement failed for {}", fid);
            self.destroy_feature(fid, ctx);
        }
        ctx.report.refinement_failures.extend(refinement_failures);

        if !ctx.report.promoted_features.is_empty() {
            info!(
                "[Promotion] promoted {} features and {} groups",
                ctx.report.promoted_features.len(),
                ctx.report.promoted_groups.len()
            );
        }
        Ok(())
    }

    /// Final depth refinement of OOS features; failures are destroyed.
    pub(super) fn refine_oos_features(&mut self, ctx: &mut StepContext) {
        let oos = std::mem::take(&mut self.oos_features);
        let mut kept = Vec::with_capacity(oos.len());
        for fid in oos {
            let observations = self.camera_observations(fid);
            if observations.len() > 1 && self.refine_feature_depth(fid, &observations) {
                kept.push(fid);
            } else {
                debug!("[OOS] depth refinement failed for {}", fid);
                ctx.report.refinement_failures.push(fid);
                self.destroy_feature(fid, ctx);
            }
        }
        self.oos_features = kept;
    }
}
