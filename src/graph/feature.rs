//! Feature - A tracked visual landmark.
//!
//! Features are created by the tracker, enter the visibility graph when the
//! estimator first anchors them to a group, may be promoted into the filter
//! state, and are eventually destroyed or handed to the mapper. The position
//! estimate is kept in the camera frame of the reference group.

use nalgebra::{Matrix3, Vector2, Vector3};

use super::types::{FeatureId, GroupId};

/// Tracker-side status, assigned before every processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// Detected this frame, not yet in the graph.
    Created,
    /// Successfully tracked into the current frame.
    Tracked,
    /// Lost by the tracker.
    Dropped,
    /// Rejected by the tracker's own outlier checks.
    Rejected,
}

/// Filter-side status, assigned by the estimator and the measurement update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatus {
    Created,
    /// Depth subfilter has accepted at least one measurement.
    Ready,
    /// Fixes the gauge freedom of its reference group.
    Gauge,
    /// Out-of-state feature awaiting its one-shot OOS update.
    Dropped,
    RejectedByFilter,
}

/// A tracked landmark.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Unique identifier for this Feature.
    pub id: FeatureId,

    pub track_status: TrackStatus,

    pub status: FeatureStatus,

    /// Whether the feature occupies a filter state slot.
    pub instate: bool,

    /// State slot index while in state.
    pub slot: Option<usize>,

    /// Number of processing steps this feature has spent in the graph.
    pub lifetime: u32,

    /// Number of rejected depth-subfilter measurements.
    pub outlier_counter: u32,

    /// Group this feature is parameterized against (back-reference only).
    pub ref_group: Option<GroupId>,

    /// Latest keypoint in normalized image coordinates.
    pub keypoint: Vector2<f64>,

    /// Position in the reference group's camera frame.
    pub xc: Vector3<f64>,

    /// Covariance of `xc`.
    pub covariance: Matrix3<f64>,

    /// Number of frames in which the tracker reported this feature.
    pub num_observations: u32,

    /// Whether an early two-view triangulation succeeded.
    pub triangulated: bool,
}

impl Feature {
    /// Create a freshly detected feature.
    pub fn new(id: FeatureId, keypoint: Vector2<f64>) -> Self {
        Self {
            id,
            track_status: TrackStatus::Created,
            status: FeatureStatus::Created,
            instate: false,
            slot: None,
            lifetime: 0,
            outlier_counter: 0,
            ref_group: None,
            keypoint,
            xc: Vector3::new(keypoint.x, keypoint.y, 1.0),
            covariance: Matrix3::identity(),
            num_observations: 1,
            triangulated: false,
        }
    }

    /// Record a successful track into a new frame.
    pub fn track(&mut self, keypoint: Vector2<f64>) {
        self.keypoint = keypoint;
        self.track_status = TrackStatus::Tracked;
        self.num_observations += 1;
    }

    pub fn increment_lifetime(&mut self) {
        self.lifetime += 1;
    }

    /// Depth along the reference camera's optical axis.
    pub fn depth(&self) -> f64 {
        self.xc.z
    }

    pub fn depth_variance(&self) -> f64 {
        self.covariance[(2, 2)]
    }

    /// Place the feature at `depth` along its current keypoint ray.
    ///
    /// `std` holds the 1-sigma uncertainty of (x, y, z).
    pub fn initialize(&mut self, depth: f64, std: &Vector3<f64>) {
        self.xc = Vector3::new(self.keypoint.x, self.keypoint.y, 1.0) * depth;
        self.covariance = Matrix3::from_diagonal(&std.component_mul(std));
    }

    /// Move the feature along its reference ray so that its depth becomes `depth`.
    pub fn set_depth(&mut self, depth: f64) {
        let z = self.xc.z;
        if z.abs() > f64::EPSILON {
            self.xc *= depth / z;
        } else {
            self.xc.z = depth;
        }
    }

    /// Re-express the position in another reference frame.
    ///
    /// `rotation` and `translation` map points from the old reference camera
    /// frame into the new one.
    pub fn change_ref(
        &mut self,
        new_ref: GroupId,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) {
        self.xc = rotation * self.xc + translation;
        self.covariance = rotation * self.covariance * rotation.transpose();
        self.ref_group = Some(new_ref);
    }
}
