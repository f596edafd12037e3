//! Promotion criteria for out-of-state features.

use std::cmp::Ordering;

use crate::graph::{Feature, FeatureStatus, TrackStatus};

use super::config::CriteriaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Tracked, out of state, subfilter converged, anchored to a group.
    Candidate,
    /// `Candidate` plus a minimum lifetime and outlier budget.
    CandidateStrict,
}

impl Criterion {
    /// The relaxed criterion is used during the first `relaxed_steps` steps.
    pub fn for_step(vision_counter: u64, relaxed_steps: u64) -> Self {
        if vision_counter < relaxed_steps {
            Criterion::Candidate
        } else {
            Criterion::CandidateStrict
        }
    }

    pub fn accepts(&self, feature: &Feature, config: &CriteriaConfig) -> bool {
        let candidate = feature.track_status == TrackStatus::Tracked
            && !feature.instate
            && feature.status == FeatureStatus::Ready
            && feature.ref_group.is_some();
        match self {
            Criterion::Candidate => candidate,
            Criterion::CandidateStrict => {
                candidate
                    && feature.lifetime >= config.strict_min_lifetime
                    && feature.outlier_counter <= config.strict_max_outliers
            }
        }
    }
}

/// Promotion order: longest tracked first, then most certain depth, then id.
pub fn candidate_order(a: &Feature, b: &Feature) -> Ordering {
    b.lifetime
        .cmp(&a.lifetime)
        .then_with(|| a.depth_variance().total_cmp(&b.depth_variance()))
        .then_with(|| a.id.cmp(&b.id))
}
