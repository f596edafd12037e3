//! Estimator - Owns the graph and drives one processing step per frame.
//!
//! `process_tracks` runs the whole bookkeeping pipeline for a frame:
//! 1. Classify the tracker's features (lifecycle)
//! 2. Promote candidates into free state slots
//! 3. Refine OOS features, discard floating groups, run the update
//! 4. Remove OOS and rejected features, discard or recycle groups
//! 5. Spawn the new group, attach features, adapt the initial depth
//! 6. Prune unreferenced groups (non-OOS mode)

use std::collections::BTreeSet;

use anyhow::Result;
use nalgebra::Vector2;
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::graph::{FeatureAdj, FeatureId, FeatureStatus, Graph, GroupId, TrackStatus};
use crate::mapper::MapperHandle;

use super::config::EstimatorConfig;
use super::depth::{AdaptiveDepth, DepthAdaptation};
use super::invariants::InvariantChecker;
use super::report::StepReport;
use super::slots::StateSlots;
use super::solver::{CameraObservation, FeatureSolver};
use super::update::{MeasurementUpdate, UpdateRequest};

/// Scratch state of a single step.
pub(super) struct StepContext {
    /// Groups that lost in-state features this step.
    pub affected_groups: BTreeSet<GroupId>,
    pub needs_new_gauge_features: Vec<GroupId>,
    pub new_features: Vec<FeatureId>,
    pub report: StepReport,
}

impl StepContext {
    fn new(timestamp_ns: u64, step: u64) -> Self {
        Self {
            affected_groups: BTreeSet::new(),
            needs_new_gauge_features: Vec::new(),
            new_features: Vec::new(),
            report: StepReport::new(timestamp_ns, step),
        }
    }
}

pub struct Estimator<U, S> {
    pub(super) config: EstimatorConfig,
    pub(super) graph: Graph,
    pub(super) slots: StateSlots,
    pub(super) updater: U,
    pub(super) solver: S,
    pub(super) mapper: Option<MapperHandle>,
    pub(super) depth: AdaptiveDepth,
    pub(super) invariants: InvariantChecker,
    pub(super) t_body_cam: SE3,

    pub(super) instate_features: Vec<FeatureId>,
    pub(super) oos_features: Vec<FeatureId>,
    pub(super) instate_groups: Vec<GroupId>,

    /// Completed steps.
    pub(super) vision_counter: u64,
    measurement_update_initialized: bool,
}

impl<U: MeasurementUpdate, S: FeatureSolver> Estimator<U, S> {
    pub fn new(config: EstimatorConfig, updater: U, solver: S) -> Result<Self> {
        config.validate()?;
        info!(
            "[Estimator] {} feature slots, {} group slots, OOS {}",
            config.max_features,
            config.max_groups,
            if config.use_oos { "on" } else { "off" }
        );
        Ok(Self {
            slots: StateSlots::new(config.max_features, config.max_groups),
            depth: AdaptiveDepth::new(&config.depth),
            invariants: InvariantChecker::new(config.invariant_mode),
            t_body_cam: config.calibration.body_camera.to_se3(),
            config,
            graph: Graph::new(),
            updater,
            solver,
            mapper: None,
            instate_features: Vec::new(),
            oos_features: Vec::new(),
            instate_groups: Vec::new(),
            vision_counter: 0,
            measurement_update_initialized: false,
        })
    }

    /// Hand deactivated features and groups to a mapper.
    pub fn with_mapper(mut self, mapper: MapperHandle) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Tracker access between steps (creating and updating features).
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn slots(&self) -> &StateSlots {
        &self.slots
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn updater_mut(&mut self) -> &mut U {
        &mut self.updater
    }

    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    pub fn body_camera(&self) -> &SE3 {
        &self.t_body_cam
    }

    /// Depth assigned to the next batch of new features.
    pub fn init_depth(&self) -> f64 {
        self.depth.value()
    }

    pub fn vision_counter(&self) -> u64 {
        self.vision_counter
    }

    pub fn measurement_update_initialized(&self) -> bool {
        self.measurement_update_initialized
    }

    /// Register a feature detected by the tracker in the current frame.
    pub fn create_feature(&mut self, keypoint: Vector2<f64>) -> FeatureId {
        self.graph.create_feature(keypoint)
    }

    /// Process one frame worth of tracks.
    ///
    /// `tracks` holds ids whose track status the tracker has already set. On
    /// return it holds the features to keep tracking: the new features of
    /// this step followed by every tracked feature left in the graph.
    pub fn process_tracks(&mut self, timestamp_ns: u64, tracks: &mut Vec<FeatureId>) -> Result<StepReport> {
        let mut ctx = StepContext::new(timestamp_ns, self.vision_counter);
        self.instate_features.clear();
        self.oos_features.clear();
        self.instate_groups.clear();

        self.graph.increment_lifetimes();

        let incoming = std::mem::take(tracks);
        let retained = self.classify_tracks(incoming, &mut ctx)?;
        ctx.report.num_retained = retained.len();
        ctx.report.num_new_features = ctx.new_features.len();

        self.instate_features = self.graph.instate_features();
        if self.instate_features.len() < self.config.max_features {
            self.promote_candidates(&mut ctx)?;
        }

        if self.config.use_oos && self.config.use_depth_opt {
            self.refine_oos_features(&mut ctx);
        }

        // Groups left floating by the tracker leave the state before the update.
        let floating = self.floating_groups(&ctx.affected_groups);
        self.discard_with_reassignment(&floating, true, &mut ctx)?;
        for (gid, _) in &floating {
            ctx.affected_groups.remove(gid);
        }
        let graph = &self.graph;
        self.instate_features
            .retain(|&fid| graph.feature(fid).is_some_and(|f| f.instate));
        self.oos_features.retain(|&fid| graph.has_feature(fid));

        if !self.instate_features.is_empty() || !self.oos_features.is_empty() {
            self.run_update(&mut ctx);
        }

        self.remove_oos_features(&mut ctx)?;
        self.remove_rejected_features(&mut ctx)?;

        let discards = if self.config.use_oos {
            self.recyclable_groups()
        } else {
            self.floating_groups(&ctx.affected_groups)
        };
        self.discard_with_reassignment(&discards, false, &mut ctx)?;

        let gid = self.spawn_group(timestamp_ns, &mut ctx);
        *tracks = self.attach_features(gid, &mut ctx)?;
        ctx.report.num_tracks_out = tracks.len();

        ctx.report.depth_adaptation = Some(self.adapt_initial_depth());

        if !self.config.use_oos {
            self.prune_groups(&mut ctx)?;
        }

        self.invariants.check_step(
            &self.graph,
            &self.slots,
            self.config.max_features,
            self.config.max_groups,
        )?;

        self.vision_counter += 1;

        let mut report = ctx.report;
        report.needs_new_gauge_features = ctx.needs_new_gauge_features;
        report.num_instate_features = self.graph.instate_features().len();
        report.num_instate_groups = self.graph.instate_groups().len();
        report.init_depth = self.depth.value();
        debug!(
            "[Estimator] step {}: {} tracks, {} in-state features, {} in-state groups, {} destroyed",
            report.step,
            report.num_tracks_out,
            report.num_instate_features,
            report.num_instate_groups,
            report.num_destroyed
        );
        Ok(report)
    }

    fn run_update(&mut self, ctx: &mut StepContext) {
        self.instate_features.sort_unstable();
        self.instate_features.dedup();
        self.oos_features.sort_unstable();
        self.oos_features.dedup();
        self.instate_groups = self.graph.instate_groups();

        let request = UpdateRequest {
            graph: &self.graph,
            instate_features: &self.instate_features,
            oos_features: &self.oos_features,
            instate_groups: &self.instate_groups,
            needs_new_gauge_features: &ctx.needs_new_gauge_features,
            calibration: &self.config.calibration,
            num_gauge_xy_features: self.config.num_gauge_xy_features,
        };
        let outcome = self.updater.update(&request);

        for (fid, status) in outcome.statuses {
            if let Some(f) = self.graph.feature_mut(fid) {
                f.status = status;
            }
        }
        debug!(
            "[Update] {} in-state, {} OOS features, error state dim {}",
            self.instate_features.len(),
            self.oos_features.len(),
            outcome.error_state_dim
        );

        self.measurement_update_initialized = true;
        ctx.report.update_performed = true;
        ctx.report.num_oos_features = self.oos_features.len();
        ctx.report.error_state_dim = Some(outcome.error_state_dim);
    }

    /// OOS features are used once and then destroyed.
    fn remove_oos_features(&mut self, ctx: &mut StepContext) -> Result<()> {
        for fid in std::mem::take(&mut self.oos_features) {
            let instate = self.graph.feature(fid).is_some_and(|f| f.instate);
            self.invariants
                .check(!instate, || format!("OOS feature {} is in state", fid))?;
            self.destroy_feature(fid, ctx);
        }
        Ok(())
    }

    fn remove_rejected_features(&mut self, ctx: &mut StepContext) -> Result<()> {
        let rejected = self
            .graph
            .features_if(|f| f.status == FeatureStatus::RejectedByFilter);
        if rejected.is_empty() {
            return Ok(());
        }
        info!("[Update] removing {} features rejected by the filter", rejected.len());

        for &fid in &rejected {
            let reference = self.graph.feature(fid).and_then(|f| f.ref_group);
            self.invariants.check(reference.is_some(), || {
                format!("rejected feature {} has no reference group", fid)
            })?;
            if let Some(gid) = reference {
                ctx.affected_groups.insert(gid);
            }
        }
        self.graph.remove_features(&rejected);
        for &fid in &rejected {
            self.remove_feature_from_state(fid);
            self.destroy_feature(fid, ctx);
        }
        ctx.report.rejected_by_filter = rejected;
        Ok(())
    }

    fn adapt_initial_depth(&mut self) -> DepthAdaptation {
        let min_lifetime = self.config.depth.min_feature_lifetime;
        let depths: Vec<f64> = self
            .graph
            .graph_feature_ids()
            .filter_map(|fid| self.graph.feature(fid))
            .filter(|f| {
                f.instate || (f.status == FeatureStatus::Ready && f.lifetime > min_lifetime)
            })
            .map(|f| f.depth())
            .collect();
        self.depth.update(depths)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State slots
    // ─────────────────────────────────────────────────────────────────────────

    pub(super) fn add_feature_to_state(&mut self, fid: FeatureId) -> bool {
        let Some(slot) = self.slots.acquire_feature(fid) else {
            return false;
        };
        let Some(f) = self.graph.feature_mut(fid) else {
            self.slots.release_feature(slot);
            return false;
        };
        f.instate = true;
        f.slot = Some(slot);
        self.updater.on_feature_added(slot, f);
        true
    }

    pub(super) fn remove_feature_from_state(&mut self, fid: FeatureId) {
        let Some(f) = self.graph.feature_mut(fid) else {
            return;
        };
        f.instate = false;
        if let Some(slot) = f.slot.take() {
            self.slots.release_feature(slot);
            self.updater.on_feature_removed(slot);
        }
    }

    pub(super) fn add_group_to_state(&mut self, gid: GroupId) -> bool {
        let Some(slot) = self.slots.acquire_group(gid) else {
            return false;
        };
        let Some(g) = self.graph.group_mut(gid) else {
            self.slots.release_group(slot);
            return false;
        };
        g.instate = true;
        g.slot = Some(slot);
        self.updater.on_group_added(slot, g);
        true
    }

    pub(super) fn remove_group_from_state(&mut self, gid: GroupId) {
        let Some(g) = self.graph.group_mut(gid) else {
            return;
        };
        g.instate = false;
        if let Some(slot) = g.slot.take() {
            self.slots.release_group(slot);
            self.updater.on_group_removed(slot);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Feature disposal
    // ─────────────────────────────────────────────────────────────────────────

    /// Free a feature without keeping any record of it.
    pub(super) fn destroy_feature(&mut self, fid: FeatureId, ctx: &mut StepContext) {
        self.graph.remove_feature(fid);
        if self.graph.destroy_feature(fid).is_some() {
            ctx.report.num_destroyed += 1;
        }
    }

    /// Retire a feature to the mapper, if one is attached.
    pub(super) fn deactivate_feature(&mut self, fid: FeatureId, adjacency: FeatureAdj, ctx: &mut StepContext) {
        self.graph.remove_feature(fid);
        let Some(feature) = self.graph.destroy_feature(fid) else {
            return;
        };
        ctx.report.num_deactivated += 1;
        if let Some(mapper) = &self.mapper {
            mapper.hand_off_feature(feature, adjacency);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Solver plumbing
    // ─────────────────────────────────────────────────────────────────────────

    pub(super) fn current_camera(&self) -> SE3 {
        self.updater.pose().compose(&self.t_body_cam)
    }

    pub(super) fn reference_camera(&self, fid: FeatureId) -> Option<SE3> {
        let gid = self.graph.feature(fid)?.ref_group?;
        Some(self.graph.group(gid)?.camera_pose(&self.t_body_cam))
    }

    /// Observations of a feature from every adjacent group, as camera poses.
    pub(super) fn camera_observations(&self, fid: FeatureId) -> Vec<CameraObservation> {
        self.graph
            .observations_of(fid)
            .into_iter()
            .map(|obs| CameraObservation::new(obs.pose.compose(&self.t_body_cam), obs.keypoint))
            .collect()
    }

    /// Run depth refinement; false if the solver failed or the feature has no
    /// reference group.
    pub(super) fn refine_feature_depth(&mut self, fid: FeatureId, observations: &[CameraObservation]) -> bool {
        let Some(reference_camera) = self.reference_camera(fid) else {
            return false;
        };
        match self.graph.feature_mut(fid) {
            Some(feature) => self.solver.refine_depth(feature, &reference_camera, observations),
            None => false,
        }
    }

    /// Tracked features whose keypoint in the current frame still matters.
    pub(super) fn tracked_graph_features(&self) -> Vec<FeatureId> {
        self.graph
            .features_if(|f| f.track_status == TrackStatus::Tracked)
    }

    pub(super) fn warn_capacity(&self, what: &str) {
        warn!(
            "[Estimator] no free {} slot ({} features, {} groups in state)",
            what,
            self.slots.used_feature_slots(),
            self.slots.used_group_slots()
        );
    }
}
