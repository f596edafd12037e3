//! Group - An anchor pose that a bundle of features is parameterized against.
//!
//! One group is spawned per processing step at the current pose estimate.
//! Features reference a group; the graph records which groups observed which
//! features. A group only needs a filter state slot while in-state features
//! reference it.

use crate::geometry::SE3;

use super::types::GroupId;

#[derive(Debug, Clone)]
pub struct Group {
    /// Unique identifier for this Group.
    pub id: GroupId,

    /// Timestamp of the step that spawned this group, in nanoseconds.
    pub timestamp_ns: u64,

    /// Body pose in the spatial frame (T_sb) at spawn time.
    pub pose: SE3,

    /// Whether the group occupies a filter state slot.
    pub instate: bool,

    /// State slot index while in state.
    pub slot: Option<usize>,

    /// Number of processing steps this group has spent in the graph.
    pub lifetime: u32,
}

impl Group {
    pub fn new(id: GroupId, timestamp_ns: u64, pose: SE3) -> Self {
        Self {
            id,
            timestamp_ns,
            pose,
            instate: false,
            slot: None,
            lifetime: 0,
        }
    }

    pub fn increment_lifetime(&mut self) {
        self.lifetime += 1;
    }

    /// Camera pose in the spatial frame: T_sc = T_sb * T_bc.
    pub fn camera_pose(&self, t_body_cam: &SE3) -> SE3 {
        self.pose.compose(t_body_cam)
    }
}
