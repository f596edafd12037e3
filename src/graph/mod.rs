//! Visibility graph module - Features, Groups and their bipartite relation.
//!
//! This module contains:
//! - [`Feature`] - Tracked landmarks with track and filter status
//! - [`Group`] - Anchor poses that features are parameterized against
//! - [`Graph`] - Arena of both plus the Feature↔Group adjacency
//!
//! # Example
//!
//! ```ignore
//! let mut graph = Graph::new();
//! let fid = graph.create_feature(keypoint);
//! let gid = graph.create_group(timestamp_ns, pose);
//! graph.add_feature(fid);
//! graph.add_group(gid);
//! graph.add_edge(fid, gid, keypoint);
//! ```

pub mod feature;
pub mod graph;
pub mod group;
pub mod types;

pub use feature::{Feature, FeatureStatus, TrackStatus};
pub use graph::{FeatureAdj, Graph, GroupAdj, Observation};
pub use group::Group;
pub use types::{FeatureId, GroupId};
