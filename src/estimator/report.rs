//! Per-step diagnostics.
//!
//! A `StepReport` describes what happened to features and groups during one
//! call to `process_tracks`. It is purely informational.

use crate::graph::{FeatureId, GroupId};

use super::depth::DepthAdaptation;

/// Why a group left the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Fewer than the gauge threshold of in-state features referenced it.
    Floating { instate_refs: usize },
    /// Recycled to free a group slot in OOS mode.
    Recycled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDiscard {
    pub group: GroupId,
    pub reason: DiscardReason,
    /// Discarded before the measurement update.
    pub pre_update: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub timestamp_ns: u64,
    /// Index of this step, starting at zero.
    pub step: u64,
    pub new_group: Option<GroupId>,

    pub num_new_features: usize,
    pub num_retained: usize,
    /// Length of the track list handed back to the tracker.
    pub num_tracks_out: usize,

    pub promoted_features: Vec<FeatureId>,
    pub promoted_groups: Vec<GroupId>,
    pub needs_new_gauge_features: Vec<GroupId>,
    pub rejected_by_filter: Vec<FeatureId>,
    pub refinement_failures: Vec<FeatureId>,
    pub discarded_groups: Vec<GroupDiscard>,
    pub reassigned_features: Vec<(FeatureId, GroupId)>,
    pub nullref_features: Vec<FeatureId>,
    pub pruned_groups: Vec<GroupId>,

    pub num_instate_features: usize,
    pub num_instate_groups: usize,
    pub num_oos_features: usize,
    pub num_destroyed: usize,
    pub num_deactivated: usize,

    pub update_performed: bool,
    pub error_state_dim: Option<usize>,
    pub init_depth: f64,
    pub depth_adaptation: Option<DepthAdaptation>,
}

impl StepReport {
    pub fn new(timestamp_ns: u64, step: u64) -> Self {
        Self {
            timestamp_ns,
            step,
            ..Default::default()
        }
    }

    pub fn discarded(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.discarded_groups.iter().map(|d| d.group)
    }
}
