//! Scenario tests for the per-step pipeline, driven by scripted doubles.

use std::collections::{HashMap, HashSet};

use approx::assert_relative_eq;
use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::geometry::SE3;
use crate::graph::{Feature, FeatureId, FeatureStatus, GroupId, TrackStatus};
use crate::mapper::spawn_mapper;

use super::*;

/// Solver whose outcomes are set per feature.
#[derive(Default)]
struct ScriptedSolver {
    /// Never leave `Created` status.
    unready: HashSet<FeatureId>,
    refine_failures: HashSet<FeatureId>,
    /// Count an outlier on every subfilter update.
    outliers: HashSet<FeatureId>,
    variances: HashMap<FeatureId, f64>,
    subfilter_depth: Option<f64>,
    triangulations: usize,
}

impl FeatureSolver for ScriptedSolver {
    fn triangulate(&mut self, feature: &mut Feature, _: &CameraObservation, _: &CameraObservation) -> bool {
        self.triangulations += 1;
        feature.triangulated = true;
        true
    }

    fn subfilter_update(&mut self, feature: &mut Feature, _: &SE3, _: &CameraObservation) {
        if self.outliers.contains(&feature.id) {
            feature.outlier_counter += 1;
        }
        if self.unready.contains(&feature.id) {
            return;
        }
        if let Some(&variance) = self.variances.get(&feature.id) {
            feature.covariance[(2, 2)] = variance;
        }
        if let Some(depth) = self.subfilter_depth {
            feature.set_depth(depth);
        }
        if feature.status == FeatureStatus::Created {
            feature.status = FeatureStatus::Ready;
        }
    }

    fn refine_depth(&mut self, feature: &mut Feature, _: &SE3, observations: &[CameraObservation]) -> bool {
        observations.len() > 1 && !self.refine_failures.contains(&feature.id)
    }
}

/// Update that keeps statuses, rejects listed features and records requests.
#[derive(Default)]
struct ScriptedUpdate {
    pose: SE3,
    reject: HashSet<FeatureId>,
    calls: usize,
    last_instate: Vec<FeatureId>,
    last_oos: Vec<FeatureId>,
    last_needs_gauge: Vec<GroupId>,
    features_added: usize,
    features_removed: usize,
}

impl MeasurementUpdate for ScriptedUpdate {
    fn pose(&self) -> SE3 {
        self.pose
    }

    fn update(&mut self, request: &UpdateRequest<'_>) -> UpdateOutcome {
        self.calls += 1;
        self.last_instate = request.instate_features.to_vec();
        self.last_oos = request.oos_features.to_vec();
        self.last_needs_gauge = request.needs_new_gauge_features.to_vec();

        let statuses = request
            .instate_features
            .iter()
            .chain(request.oos_features)
            .filter_map(|&fid| {
                let f = request.graph.feature(fid)?;
                let status = if self.reject.contains(&fid) {
                    FeatureStatus::RejectedByFilter
                } else {
                    f.status
                };
                Some((fid, status))
            })
            .collect();
        UpdateOutcome {
            statuses,
            error_state_dim: 0,
        }
    }

    fn on_feature_added(&mut self, _slot: usize, _feature: &Feature) {
        self.features_added += 1;
    }

    fn on_feature_removed(&mut self, _slot: usize) {
        self.features_removed += 1;
    }
}

type TestEstimator = Estimator<ScriptedUpdate, ScriptedSolver>;

fn config() -> EstimatorConfig {
    EstimatorConfig {
        max_features: 30,
        max_groups: 10,
        ..Default::default()
    }
}

fn estimator(config: EstimatorConfig) -> TestEstimator {
    Estimator::new(config, ScriptedUpdate::default(), ScriptedSolver::default()).unwrap()
}

fn body_at(x: f64) -> SE3 {
    SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
}

fn detect(est: &mut TestEstimator, n: usize) -> Vec<FeatureId> {
    (0..n)
        .map(|i| est.create_feature(Vector2::new(0.01 * i as f64, -0.01 * i as f64)))
        .collect()
}

/// Report every listed feature as tracked at its previous keypoint.
fn track(est: &mut TestEstimator, ids: &[FeatureId]) {
    for &fid in ids {
        if let Some(f) = est.graph_mut().feature_mut(fid) {
            let keypoint = f.keypoint;
            f.track(keypoint);
        }
    }
}

fn set_track_status(est: &mut TestEstimator, fid: FeatureId, status: TrackStatus) {
    est.graph_mut().feature_mut(fid).unwrap().track_status = status;
}

fn step(est: &mut TestEstimator, timestamp_ns: u64, tracks: &mut Vec<FeatureId>) -> StepReport {
    let report = est.process_tracks(timestamp_ns, tracks).unwrap();
    assert_step_invariants(est, tracks);
    report
}

fn assert_step_invariants(est: &TestEstimator, tracks: &[FeatureId]) {
    let graph = est.graph();
    assert!(graph.instate_features().len() <= est.config().max_features);
    assert!(graph.instate_groups().len() <= est.config().max_groups);
    for fid in graph.instate_features() {
        let gid = graph.feature(fid).unwrap().ref_group.unwrap();
        assert!(graph.group(gid).unwrap().instate, "{} references out-of-state {}", fid, gid);
    }
    assert!(graph
        .features_if(|f| f.status == FeatureStatus::RejectedByFilter)
        .is_empty());
    for fid in tracks {
        assert!(graph.has_feature(*fid), "track list holds destroyed {}", fid);
    }
    graph.sanity_check().unwrap();
}

/// Anchor `n` features at step 0 and promote them at step 1.
fn promoted_setup(est: &mut TestEstimator, n: usize) -> (Vec<FeatureId>, GroupId) {
    let mut tracks = detect(est, n);
    let report = step(est, 0, &mut tracks);
    let g0 = report.new_group.unwrap();
    track(est, &tracks);
    step(est, 1, &mut tracks);
    (tracks, g0)
}

#[test]
fn test_empty_tracks_spawn_one_group_per_step() {
    let mut est = estimator(config());
    let mut tracks = Vec::new();
    let mut groups = Vec::new();

    for k in 0..3 {
        let report = step(&mut est, k, &mut tracks);
        groups.push(report.new_group.unwrap());
        assert!(!report.update_performed);
        assert!(tracks.is_empty());
    }

    assert_eq!(groups.iter().collect::<HashSet<_>>().len(), 3);
    assert!(!est.graph().has_group(groups[0]));
    assert!(est.graph().has_group(groups[2]));
    assert!(!est.measurement_update_initialized());
    assert_eq!(est.vision_counter(), 3);
}

#[test]
fn test_new_features_anchor_to_new_group() {
    let mut est = estimator(config());
    let mut tracks = detect(&mut est, 3);
    let first = tracks.clone();

    let report = step(&mut est, 0, &mut tracks);
    let g0 = report.new_group.unwrap();
    assert_eq!(tracks, first);
    assert_eq!(report.num_new_features, 3);
    for &fid in &first {
        let f = est.graph().feature(fid).unwrap();
        assert_eq!(f.ref_group, Some(g0));
        assert_relative_eq!(f.depth(), 2.5);
        assert_relative_eq!(f.depth_variance(), 1.0);
        assert!(est.graph().feature_adj(fid).unwrap().contains_key(&g0));
    }

    track(&mut est, &tracks);
    let fresh = detect(&mut est, 2);
    let mut next: Vec<FeatureId> = tracks.iter().chain(&fresh).copied().collect();
    let report = step(&mut est, 1, &mut next);
    let g1 = report.new_group.unwrap();

    assert_eq!(&next[..2], &fresh[..]);
    assert_eq!(next.len(), 5);
    for &fid in &first {
        let adj = est.graph().feature_adj(fid).unwrap();
        assert!(adj.contains_key(&g0) && adj.contains_key(&g1));
    }
    for &fid in &fresh {
        assert_eq!(est.graph().feature(fid).unwrap().ref_group, Some(g1));
    }
}

#[test]
fn test_promotes_in_priority_order_until_full() {
    let mut est = estimator(EstimatorConfig {
        max_features: 4,
        ..config()
    });
    let mut tracks = detect(&mut est, 5);
    let g0 = step(&mut est, 0, &mut tracks).new_group.unwrap();
    let ids = tracks.clone();
    for (i, variance) in [0.4, 0.2, 0.5, 0.1, 0.3].into_iter().enumerate() {
        est.solver_mut().variances.insert(ids[i], variance);
    }

    track(&mut est, &tracks);
    let report = step(&mut est, 1, &mut tracks);

    assert_eq!(report.promoted_features, vec![ids[3], ids[1], ids[4], ids[0]]);
    assert_eq!(report.promoted_groups, vec![g0]);
    assert_eq!(report.needs_new_gauge_features, vec![g0]);
    assert_eq!(est.updater().features_added, 4);

    let last = est.graph().feature(ids[2]).unwrap();
    assert!(!last.instate);
    assert!(Criterion::Candidate.accepts(last, &est.config().criteria));
}

#[test]
fn test_strict_criterion_after_warmup() {
    let mut est = estimator(EstimatorConfig {
        strict_criteria_timesteps: 0,
        ..config()
    });
    let mut tracks = detect(&mut est, 3);
    step(&mut est, 0, &mut tracks);

    for k in 1..=3 {
        track(&mut est, &tracks);
        let report = step(&mut est, k, &mut tracks);
        if k < 3 {
            assert!(report.promoted_features.is_empty(), "promoted at step {}", k);
        } else {
            assert_eq!(report.promoted_features.len(), 3);
        }
    }
}

#[test]
fn test_dropped_gauge_flags_group_and_reaches_mapper() {
    let (handle, mut worker) = spawn_mapper(16);
    let mut est = estimator(config()).with_mapper(handle);
    let (mut tracks, g0) = promoted_setup(&mut est, 5);
    let gauge = tracks[0];
    est.graph_mut().feature_mut(gauge).unwrap().status = FeatureStatus::Gauge;

    track(&mut est, &tracks);
    set_track_status(&mut est, gauge, TrackStatus::Dropped);
    let report = step(&mut est, 2, &mut tracks);

    assert_eq!(report.needs_new_gauge_features, vec![g0]);
    assert_eq!(est.updater().last_needs_gauge, vec![g0]);
    assert!(!est.updater().last_instate.contains(&gauge));
    assert!(est.graph().feature(gauge).is_none());
    assert!(!tracks.contains(&gauge));
    assert_eq!(est.updater().features_removed, 1);
    assert!(est.graph().group(g0).unwrap().instate);
    assert_eq!(report.num_deactivated, 1);

    worker.shutdown();
    let mapped = worker.store().feature(gauge).unwrap();
    assert_eq!(mapped.feature.status, FeatureStatus::Gauge);
    assert!(worker.store().groups_of(gauge).contains(&g0));
}

#[test]
fn test_group_at_threshold_is_kept() {
    let mut est = estimator(config());
    let (mut tracks, g0) = promoted_setup(&mut est, 5);

    track(&mut est, &tracks);
    set_track_status(&mut est, tracks[0], TrackStatus::Dropped);
    set_track_status(&mut est, tracks[1], TrackStatus::Rejected);
    let report = step(&mut est, 2, &mut tracks);

    assert!(report.discarded_groups.is_empty());
    assert!(est.graph().group(g0).unwrap().instate);
    assert_eq!(est.graph().num_instate_referencing(g0), 3);
}

#[test]
fn test_floating_group_discard_reassigns_and_destroys() {
    let mut est = estimator(EstimatorConfig {
        max_features: 5,
        ..config()
    });
    let mut tracks = detect(&mut est, 6);
    let ids = tracks.clone();
    est.solver_mut().unready.insert(ids[5]);

    let g0 = step(&mut est, 0, &mut tracks).new_group.unwrap();
    est.updater_mut().pose = body_at(0.1);
    track(&mut est, &tracks);
    let g1 = step(&mut est, 1, &mut tracks).new_group.unwrap();
    assert!(ids[..5].iter().all(|&fid| est.graph().feature(fid).unwrap().instate));
    let xc_before = est.graph().feature(ids[5]).unwrap().xc;

    est.updater_mut().pose = body_at(0.2);
    track(&mut est, &tracks);
    for &fid in &ids[..3] {
        set_track_status(&mut est, fid, TrackStatus::Dropped);
    }
    let report = step(&mut est, 2, &mut tracks);

    assert_eq!(
        report.discarded_groups,
        vec![GroupDiscard {
            group: g0,
            reason: DiscardReason::Floating { instate_refs: 2 },
            pre_update: true,
        }]
    );
    for discard in &report.discarded_groups {
        if let DiscardReason::Floating { instate_refs } = discard.reason {
            assert!(instate_refs < est.config().num_gauge_xy_features);
        }
    }
    assert_eq!(report.nullref_features, vec![ids[3], ids[4]]);
    assert_eq!(report.reassigned_features, vec![(ids[5], g1)]);
    assert!(!report.update_performed);

    let moved = est.graph().feature(ids[5]).unwrap();
    assert_eq!(moved.ref_group, Some(g1));
    assert_relative_eq!(moved.xc, xc_before - Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-12);

    assert!(report.pruned_groups.contains(&g0));
    assert!(!est.graph().has_group(g0));
    assert_eq!(est.slots().used_feature_slots(), 0);
    assert_eq!(est.slots().used_group_slots(), 0);
}

#[test]
fn test_filter_rejections_leave_graph() {
    let mut est = estimator(config());
    let (mut tracks, g0) = promoted_setup(&mut est, 5);
    let rejected = tracks[2];
    est.updater_mut().reject.insert(rejected);

    track(&mut est, &tracks);
    let report = step(&mut est, 2, &mut tracks);

    assert!(report.update_performed);
    assert!(est.measurement_update_initialized());
    assert_eq!(report.rejected_by_filter, vec![rejected]);
    assert!(est.graph().feature(rejected).is_none());
    assert!(!tracks.contains(&rejected));
    assert!(report.discarded_groups.is_empty());
    assert!(est.graph().group(g0).unwrap().instate);
    assert_eq!(est.slots().used_feature_slots(), 4);
}

#[test]
fn test_filter_rejections_starve_group_after_update() {
    let mut est = estimator(config());
    let (mut tracks, g0) = promoted_setup(&mut est, 5);
    let ids = tracks.clone();
    for &fid in &ids[..3] {
        est.updater_mut().reject.insert(fid);
    }

    track(&mut est, &tracks);
    let report = step(&mut est, 2, &mut tracks);

    assert!(report.update_performed);
    assert_eq!(report.rejected_by_filter, ids[..3].to_vec());
    assert_eq!(
        report.discarded_groups,
        vec![GroupDiscard {
            group: g0,
            reason: DiscardReason::Floating { instate_refs: 2 },
            pre_update: false,
        }]
    );
    assert_eq!(report.nullref_features, vec![ids[3], ids[4]]);
    assert!(tracks.is_empty());
    assert!(!est.graph().group(g0).is_some_and(|g| g.instate));
    assert_eq!(est.slots().used_feature_slots(), 0);
    assert_eq!(est.slots().used_group_slots(), 0);
}

#[test]
fn test_candidates_wait_for_a_free_group_slot() {
    let mut est = estimator(EstimatorConfig {
        max_groups: 1,
        ..config()
    });
    let mut tracks = detect(&mut est, 3);
    let g0 = step(&mut est, 0, &mut tracks).new_group.unwrap();

    track(&mut est, &tracks);
    let fresh = detect(&mut est, 3);
    let mut tracks: Vec<FeatureId> = tracks.iter().chain(&fresh).copied().collect();
    let report = step(&mut est, 1, &mut tracks);
    assert_eq!(report.promoted_groups, vec![g0]);
    let g1 = report.new_group.unwrap();

    track(&mut est, &tracks);
    let report = step(&mut est, 2, &mut tracks);

    assert!(report.promoted_features.is_empty());
    assert!(report.promoted_groups.is_empty());
    assert_eq!(est.graph().instate_groups(), vec![g0]);
    assert!(!est.graph().group(g1).unwrap().instate);
    for &fid in &fresh {
        let f = est.graph().feature(fid).unwrap();
        assert_eq!(f.ref_group, Some(g1));
        assert_eq!(f.status, FeatureStatus::Ready);
        assert!(!f.instate);
    }
}

#[test]
fn test_outlier_budget_destroys_feature() {
    let mut est = estimator(EstimatorConfig {
        remove_outlier_counter: 1,
        ..config()
    });
    let mut tracks = detect(&mut est, 2);
    let victim = tracks[1];
    est.solver_mut().unready.insert(victim);
    est.solver_mut().outliers.insert(victim);
    step(&mut est, 0, &mut tracks);

    track(&mut est, &tracks);
    let report = step(&mut est, 1, &mut tracks);
    assert_eq!(est.graph().feature(victim).unwrap().outlier_counter, 1);
    assert_eq!(report.num_destroyed, 0);

    track(&mut est, &tracks);
    let report = step(&mut est, 2, &mut tracks);
    assert_eq!(report.num_destroyed, 1);
    assert!(est.graph().feature(victim).is_none());
    assert!(!tracks.contains(&victim));
}

#[test]
fn test_oos_discard_keeps_every_third_group() {
    let mut est = estimator(EstimatorConfig {
        use_oos: true,
        ..config()
    });
    let mut tracks = Vec::new();
    let mut groups = Vec::new();

    for k in 0..10 {
        track(&mut est, &tracks);
        if k == 4 {
            tracks.extend(detect(&mut est, 1));
        }
        let report = step(&mut est, k, &mut tracks);
        assert!(report.discarded_groups.is_empty());
        groups.push(report.new_group.unwrap());
    }
    assert_eq!(est.graph().instate_groups().len(), 10);
    assert!(est.graph().feature(tracks[0]).unwrap().instate);

    track(&mut est, &tracks);
    let report = step(&mut est, 10, &mut tracks);

    let discarded: Vec<GroupId> = report.discarded().collect();
    assert_eq!(
        discarded,
        vec![groups[1], groups[2], groups[5], groups[7], groups[8]]
    );
    assert!(report
        .discarded_groups
        .iter()
        .all(|d| d.reason == DiscardReason::Recycled && !d.pre_update));
    assert!(est.graph().group(groups[0]).unwrap().instate);
    assert!(est.graph().group(groups[4]).unwrap().instate);
    assert!(!est.graph().has_group(groups[1]));
    assert_eq!(est.slots().used_group_slots(), 6);
}

#[test]
fn test_oos_features_are_used_once() {
    let mut est = estimator(EstimatorConfig {
        use_oos: true,
        ..config()
    });
    let mut tracks = detect(&mut est, 3);
    let ids = tracks.clone();
    for &fid in &ids {
        est.solver_mut().unready.insert(fid);
    }
    est.solver_mut().refine_failures.insert(ids[2]);

    step(&mut est, 0, &mut tracks);
    track(&mut est, &tracks);
    step(&mut est, 1, &mut tracks);

    track(&mut est, &tracks);
    set_track_status(&mut est, ids[1], TrackStatus::Dropped);
    set_track_status(&mut est, ids[2], TrackStatus::Dropped);
    let report = step(&mut est, 2, &mut tracks);

    assert!(report.update_performed);
    assert_eq!(est.updater().last_oos, vec![ids[1]]);
    assert_eq!(report.num_oos_features, 1);
    assert_eq!(report.refinement_failures, vec![ids[2]]);
    assert!(est.graph().feature(ids[1]).is_none());
    assert!(est.graph().feature(ids[2]).is_none());
    assert_eq!(tracks, vec![ids[0]]);
}

#[test]
fn test_non_oos_dropped_features_are_destroyed() {
    let mut est = estimator(config());
    let mut tracks = detect(&mut est, 2);
    let ids = tracks.clone();
    est.solver_mut().unready.insert(ids[0]);
    step(&mut est, 0, &mut tracks);

    track(&mut est, &tracks);
    set_track_status(&mut est, ids[0], TrackStatus::Dropped);
    let report = step(&mut est, 1, &mut tracks);

    assert!(est.graph().feature(ids[0]).is_none());
    assert_eq!(report.num_destroyed, 1);
    assert_eq!(report.num_oos_features, 0);
}

#[test]
fn test_early_triangulation_and_noise_preset() {
    let mut est = estimator(EstimatorConfig {
        triangulate_pre_subfilter: true,
        ..config()
    });
    let mut tracks = detect(&mut est, 2);
    step(&mut est, 0, &mut tracks);
    for &fid in &tracks {
        assert_relative_eq!(est.graph().feature(fid).unwrap().depth_variance(), 4.0);
    }

    track(&mut est, &tracks);
    step(&mut est, 1, &mut tracks);
    assert_eq!(est.solver_mut().triangulations, 2);

    track(&mut est, &tracks);
    step(&mut est, 2, &mut tracks);
    assert_eq!(est.solver_mut().triangulations, 2);
}

#[test]
fn test_initial_depth_follows_instate_median() {
    let mut est = estimator(config());
    est.solver_mut().subfilter_depth = Some(4.0);
    let mut tracks = detect(&mut est, 5);

    let report = step(&mut est, 0, &mut tracks);
    assert_eq!(report.depth_adaptation, Some(DepthAdaptation::NoSamples));
    assert_relative_eq!(est.init_depth(), 2.5);

    track(&mut est, &tracks);
    let report = step(&mut est, 1, &mut tracks);
    assert_eq!(report.promoted_features.len(), 5);
    assert_relative_eq!(est.init_depth(), 0.95 * 2.5 + 0.05 * 4.0, epsilon = 1e-12);
    assert_eq!(report.depth_adaptation, Some(DepthAdaptation::Updated(est.init_depth())));
    assert_relative_eq!(report.init_depth, est.init_depth());
}

#[test]
fn test_dead_track_fails_only_in_strict_mode() {
    let mut est = estimator(config());
    let mut tracks = vec![FeatureId::new(999)];
    assert!(est.process_tracks(0, &mut tracks).is_err());

    let mut est = estimator(EstimatorConfig {
        invariant_mode: InvariantMode::Production,
        ..config()
    });
    let mut tracks = vec![FeatureId::new(999)];
    let report = est.process_tracks(0, &mut tracks).unwrap();
    assert!(report.new_group.is_some());
    assert!(tracks.is_empty());
}
