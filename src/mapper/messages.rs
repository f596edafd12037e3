//! Messages sent from the estimator to the mapper thread.

use crate::graph::{Feature, FeatureAdj, Group, GroupAdj};

/// A feature or group leaving the estimator, with its graph adjacency at the
/// time it was removed.
pub enum MapperMsg {
    Feature {
        feature: Feature,
        adjacency: FeatureAdj,
    },
    Group {
        group: Group,
        adjacency: GroupAdj,
    },
}
