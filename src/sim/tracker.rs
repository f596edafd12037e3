//! Simulated feature tracker.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};
use rand::prelude::*;
use tracing::debug;

use crate::geometry::{project, SE3};
use crate::graph::{FeatureId, Graph, TrackStatus};

use super::scene::Scene;

#[derive(Debug, Clone)]
pub struct SimTrackerConfig {
    pub max_tracks: usize,
    /// Keypoint noise in normalized image coordinates.
    pub keypoint_noise: f64,
    pub drop_probability: f64,
    pub reject_probability: f64,
    /// Half-width of the visible region in normalized coordinates.
    pub half_fov: f64,
    pub min_depth: f64,
}

impl Default for SimTrackerConfig {
    fn default() -> Self {
        Self {
            max_tracks: 60,
            keypoint_noise: 0.001,
            drop_probability: 0.02,
            reject_probability: 0.005,
            half_fov: 0.6,
            min_depth: 0.5,
        }
    }
}

/// Assigns track statuses to landmark projections frame by frame.
pub struct SimTracker {
    config: SimTrackerConfig,
    rng: StdRng,
    /// Landmark index -> live feature.
    active: BTreeMap<usize, FeatureId>,
}

impl SimTracker {
    pub fn new(config: SimTrackerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            active: BTreeMap::new(),
        }
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    fn observe(&mut self, camera_from_world: &SE3, landmark: &Vector3<f64>) -> Option<Vector2<f64>> {
        let p = camera_from_world.transform_point(landmark);
        if p.z < self.config.min_depth {
            return None;
        }
        let uv = project(&p)?;
        if uv.x.abs() > self.config.half_fov || uv.y.abs() > self.config.half_fov {
            return None;
        }
        let noise = self.config.keypoint_noise;
        Some(uv + Vector2::new(self.rng.gen_range(-noise..=noise), self.rng.gen_range(-noise..=noise)))
    }

    /// Track the scene into a new frame. Returns the track list for the step.
    pub fn step(&mut self, graph: &mut Graph, scene: &Scene, camera_pose: &SE3) -> Vec<FeatureId> {
        let camera_from_world = camera_pose.inverse();
        let mut tracks = Vec::new();

        // Forget features the estimator no longer keeps.
        self.active.retain(|_, fid| graph.feature(*fid).is_some());

        let active: Vec<(usize, FeatureId)> = self.active.iter().map(|(&l, &f)| (l, f)).collect();
        for (landmark, fid) in active {
            let observed = self.observe(&camera_from_world, &scene.landmarks[landmark]);
            let rejected = self.rng.gen_bool(self.config.reject_probability);
            let dropped = self.rng.gen_bool(self.config.drop_probability);
            let Some(feature) = graph.feature_mut(fid) else {
                continue;
            };
            match observed {
                Some(_) if rejected => {
                    feature.track_status = TrackStatus::Rejected;
                    self.active.remove(&landmark);
                }
                Some(kp) if !dropped => feature.track(kp),
                _ => {
                    feature.track_status = TrackStatus::Dropped;
                    self.active.remove(&landmark);
                }
            }
            tracks.push(fid);
        }

        let mut detected = 0;
        for (landmark, point) in scene.landmarks.iter().enumerate() {
            if self.active.len() >= self.config.max_tracks {
                break;
            }
            if self.active.contains_key(&landmark) {
                continue;
            }
            if let Some(kp) = self.observe(&camera_from_world, point) {
                let fid = graph.create_feature(kp);
                self.active.insert(landmark, fid);
                tracks.push(fid);
                detected += 1;
            }
        }
        debug!("[SimTracker] {} tracks, {} new", tracks.len(), detected);
        tracks
    }
}
