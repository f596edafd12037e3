//! Graph - Arena and visibility graph for Features and Groups.
//!
//! The arena owns every live Feature and Group, keyed by stable ids. The
//! visibility graph is a bipartite relation layered on top of it:
//! - a Feature is "in the graph" once it has an adjacency entry
//! - each Feature↔Group edge stores the keypoint the feature had in that
//!   group's view, which doubles as the observation used for depth refinement
//!
//! Lifetime is explicit: entities leave the arena only through
//! `destroy_feature` / `destroy_group`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use nalgebra::Vector2;

use crate::geometry::SE3;

use super::feature::Feature;
use super::group::Group;
use super::types::{FeatureId, GroupId};

/// Groups adjacent to a feature, with the keypoint observed in each.
pub type FeatureAdj = BTreeMap<GroupId, Vector2<f64>>;

/// Features adjacent to a group.
pub type GroupAdj = BTreeSet<FeatureId>;

/// A feature as seen from one of its adjacent groups.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub group: GroupId,
    /// Body pose of the observing group (T_sb).
    pub pose: SE3,
    pub keypoint: Vector2<f64>,
}

#[derive(Default)]
pub struct Graph {
    features: BTreeMap<FeatureId, Feature>,
    groups: BTreeMap<GroupId, Group>,

    feature_adj: BTreeMap<FeatureId, FeatureAdj>,
    group_adj: BTreeMap<GroupId, GroupAdj>,

    next_feature_id: u64,
    next_group_id: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Arena
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new feature in the arena. It is not part of the graph yet.
    pub fn create_feature(&mut self, keypoint: Vector2<f64>) -> FeatureId {
        let id = FeatureId::new(self.next_feature_id);
        self.next_feature_id += 1;
        self.features.insert(id, Feature::new(id, keypoint));
        id
    }

    /// Create a new group in the arena. It is not part of the graph yet.
    pub fn create_group(&mut self, timestamp_ns: u64, pose: SE3) -> GroupId {
        let id = GroupId::new(self.next_group_id);
        self.next_group_id += 1;
        self.groups.insert(id, Group::new(id, timestamp_ns, pose));
        id
    }

    pub fn feature(&self, id: FeatureId) -> Option<&Feature> {
        self.features.get(&id)
    }

    pub fn feature_mut(&mut self, id: FeatureId) -> Option<&mut Feature> {
        self.features.get_mut(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    /// All live features, in the graph or not.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }

    /// All live groups, in the graph or not.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Remove a feature from the graph and the arena.
    pub fn destroy_feature(&mut self, id: FeatureId) -> Option<Feature> {
        self.remove_feature(id);
        self.features.remove(&id)
    }

    /// Remove a group from the graph and the arena.
    pub fn destroy_group(&mut self, id: GroupId) -> Option<Group> {
        self.remove_group(id);
        self.groups.remove(&id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph membership
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a feature into the graph. Returns false if it is not in the arena.
    pub fn add_feature(&mut self, id: FeatureId) -> bool {
        if !self.features.contains_key(&id) {
            return false;
        }
        self.feature_adj.entry(id).or_default();
        true
    }

    /// Insert a group into the graph. Returns false if it is not in the arena.
    pub fn add_group(&mut self, id: GroupId) -> bool {
        if !self.groups.contains_key(&id) {
            return false;
        }
        self.group_adj.entry(id).or_default();
        true
    }

    pub fn has_feature(&self, id: FeatureId) -> bool {
        self.feature_adj.contains_key(&id)
    }

    pub fn has_group(&self, id: GroupId) -> bool {
        self.group_adj.contains_key(&id)
    }

    /// Detach a feature from the graph, returning its former adjacency.
    ///
    /// The feature stays in the arena.
    pub fn remove_feature(&mut self, id: FeatureId) -> FeatureAdj {
        let adj = self.feature_adj.remove(&id).unwrap_or_default();
        for gid in adj.keys() {
            if let Some(g_adj) = self.group_adj.get_mut(gid) {
                g_adj.remove(&id);
            }
        }
        adj
    }

    pub fn remove_features(&mut self, ids: &[FeatureId]) {
        for &id in ids {
            self.remove_feature(id);
        }
    }

    /// Detach a group from the graph, returning its former adjacency.
    pub fn remove_group(&mut self, id: GroupId) -> GroupAdj {
        let adj = self.group_adj.remove(&id).unwrap_or_default();
        for fid in &adj {
            if let Some(f_adj) = self.feature_adj.get_mut(fid) {
                f_adj.remove(&id);
            }
        }
        adj
    }

    /// Link a feature and a group in both directions.
    ///
    /// Returns false if either side is not in the graph.
    pub fn add_edge(&mut self, fid: FeatureId, gid: GroupId, keypoint: Vector2<f64>) -> bool {
        if !self.has_feature(fid) || !self.has_group(gid) {
            return false;
        }
        if let Some(f_adj) = self.feature_adj.get_mut(&fid) {
            f_adj.insert(gid, keypoint);
        }
        if let Some(g_adj) = self.group_adj.get_mut(&gid) {
            g_adj.insert(fid);
        }
        true
    }

    pub fn feature_adj(&self, id: FeatureId) -> Option<&FeatureAdj> {
        self.feature_adj.get(&id)
    }

    pub fn group_adj(&self, id: GroupId) -> Option<&GroupAdj> {
        self.group_adj.get(&id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Ids of all features in the graph.
    pub fn graph_feature_ids(&self) -> impl Iterator<Item = FeatureId> + '_ {
        self.feature_adj.keys().copied()
    }

    /// Ids of all groups in the graph.
    pub fn graph_group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.group_adj.keys().copied()
    }

    pub fn num_graph_features(&self) -> usize {
        self.feature_adj.len()
    }

    pub fn num_graph_groups(&self) -> usize {
        self.group_adj.len()
    }

    /// Features adjacent to a group.
    pub fn features_of(&self, gid: GroupId) -> Vec<&Feature> {
        self.group_adj
            .get(&gid)
            .map(|adj| adj.iter().filter_map(|fid| self.features.get(fid)).collect())
            .unwrap_or_default()
    }

    /// Groups adjacent to a feature.
    pub fn groups_of(&self, fid: FeatureId) -> Vec<&Group> {
        self.feature_adj
            .get(&fid)
            .map(|adj| adj.keys().filter_map(|gid| self.groups.get(gid)).collect())
            .unwrap_or_default()
    }

    /// Graph features matching a predicate, in id order.
    pub fn features_if<P>(&self, pred: P) -> Vec<FeatureId>
    where
        P: Fn(&Feature) -> bool,
    {
        self.feature_adj
            .keys()
            .filter_map(|fid| self.features.get(fid))
            .filter(|&f| pred(f))
            .map(|f| f.id)
            .collect()
    }

    /// Graph groups matching a predicate, in id (age) order.
    pub fn groups_if<P>(&self, pred: P) -> Vec<GroupId>
    where
        P: Fn(&Group) -> bool,
    {
        self.group_adj
            .keys()
            .filter_map(|gid| self.groups.get(gid))
            .filter(|&g| pred(g))
            .map(|g| g.id)
            .collect()
    }

    pub fn instate_features(&self) -> Vec<FeatureId> {
        self.features_if(|f| f.instate)
    }

    pub fn instate_groups(&self) -> Vec<GroupId> {
        self.groups_if(|g| g.instate)
    }

    /// Number of in-state adjacent features that use `gid` as reference.
    pub fn num_instate_referencing(&self, gid: GroupId) -> usize {
        self.features_of(gid)
            .iter()
            .filter(|f| f.instate && f.ref_group == Some(gid))
            .count()
    }

    /// Whether any adjacent feature uses `gid` as reference.
    pub fn is_referenced(&self, gid: GroupId) -> bool {
        self.features_of(gid)
            .iter()
            .any(|f| f.ref_group == Some(gid))
    }

    /// Observations of a feature from each adjacent group.
    pub fn observations_of(&self, fid: FeatureId) -> Vec<Observation> {
        let Some(adj) = self.feature_adj.get(&fid) else {
            return Vec::new();
        };
        adj.iter()
            .filter_map(|(gid, kp)| {
                self.groups.get(gid).map(|g| Observation {
                    group: *gid,
                    pose: g.pose,
                    keypoint: *kp,
                })
            })
            .collect()
    }

    /// Increment the lifetime of every feature and group in the graph.
    pub fn increment_lifetimes(&mut self) {
        for fid in self.feature_adj.keys() {
            if let Some(f) = self.features.get_mut(fid) {
                f.increment_lifetime();
            }
        }
        for gid in self.group_adj.keys() {
            if let Some(g) = self.groups.get_mut(gid) {
                g.increment_lifetime();
            }
        }
    }

    /// Verify adjacency symmetry and that every referenced id is live.
    pub fn sanity_check(&self) -> Result<()> {
        for (fid, adj) in &self.feature_adj {
            if !self.features.contains_key(fid) {
                bail!("graph feature {} missing from arena", fid);
            }
            for gid in adj.keys() {
                match self.group_adj.get(gid) {
                    Some(g_adj) if g_adj.contains(fid) => {}
                    _ => bail!("edge {}-{} is not symmetric", fid, gid),
                }
            }
        }
        for (gid, adj) in &self.group_adj {
            if !self.groups.contains_key(gid) {
                bail!("graph group {} missing from arena", gid);
            }
            for fid in adj {
                match self.feature_adj.get(fid) {
                    Some(f_adj) if f_adj.contains_key(gid) => {}
                    _ => bail!("edge {}-{} is not symmetric", fid, gid),
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("num_features", &self.features.len())
            .field("num_groups", &self.groups.len())
            .field("num_graph_features", &self.feature_adj.len())
            .field("num_graph_groups", &self.group_adj.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_edge() -> (Graph, FeatureId, GroupId) {
        let mut graph = Graph::new();
        let fid = graph.create_feature(Vector2::new(0.1, 0.2));
        let gid = graph.create_group(0, SE3::identity());
        assert!(graph.add_feature(fid));
        assert!(graph.add_group(gid));
        assert!(graph.add_edge(fid, gid, Vector2::new(0.1, 0.2)));
        (graph, fid, gid)
    }

    #[test]
    fn test_create_is_outside_graph() {
        let mut graph = Graph::new();
        let fid = graph.create_feature(Vector2::zeros());
        let gid = graph.create_group(10, SE3::identity());

        assert_eq!(fid, FeatureId::new(0));
        assert_eq!(gid, GroupId::new(0));
        assert!(!graph.has_feature(fid));
        assert!(!graph.has_group(gid));
        assert_eq!(graph.num_features(), 1);
    }

    #[test]
    fn test_edge_requires_membership() {
        let mut graph = Graph::new();
        let fid = graph.create_feature(Vector2::zeros());
        let gid = graph.create_group(0, SE3::identity());
        graph.add_feature(fid);

        assert!(!graph.add_edge(fid, gid, Vector2::zeros()));
        graph.add_group(gid);
        assert!(graph.add_edge(fid, gid, Vector2::zeros()));
    }

    #[test]
    fn test_edge_is_bidirectional() {
        let (graph, fid, gid) = graph_with_edge();

        assert!(graph.feature_adj(fid).unwrap().contains_key(&gid));
        assert!(graph.group_adj(gid).unwrap().contains(&fid));
        assert_eq!(graph.features_of(gid).len(), 1);
        assert_eq!(graph.groups_of(fid).len(), 1);
        graph.sanity_check().unwrap();
    }

    #[test]
    fn test_remove_feature_cleans_group_side() {
        let (mut graph, fid, gid) = graph_with_edge();

        let adj = graph.remove_feature(fid);
        assert_eq!(adj.len(), 1);
        assert!(!graph.has_feature(fid));
        assert!(graph.group_adj(gid).unwrap().is_empty());
        // still alive in the arena
        assert!(graph.feature(fid).is_some());
        graph.sanity_check().unwrap();
    }

    #[test]
    fn test_destroy_group_cleans_feature_side() {
        let (mut graph, fid, gid) = graph_with_edge();

        assert!(graph.destroy_group(gid).is_some());
        assert!(graph.group(gid).is_none());
        assert!(graph.feature_adj(fid).unwrap().is_empty());
        graph.sanity_check().unwrap();
    }

    #[test]
    fn test_reference_counting_queries() {
        let (mut graph, fid, gid) = graph_with_edge();
        assert!(!graph.is_referenced(gid));

        graph.feature_mut(fid).unwrap().ref_group = Some(gid);
        assert!(graph.is_referenced(gid));
        assert_eq!(graph.num_instate_referencing(gid), 0);

        graph.feature_mut(fid).unwrap().instate = true;
        assert_eq!(graph.num_instate_referencing(gid), 1);
        assert_eq!(graph.instate_features(), vec![fid]);
    }

    #[test]
    fn test_observations_carry_group_pose() {
        let (mut graph, fid, _) = graph_with_edge();
        let pose = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            nalgebra::Vector3::new(1.0, 0.0, 0.0),
        );
        let g2 = graph.create_group(1, pose);
        graph.add_group(g2);
        graph.add_edge(fid, g2, Vector2::new(-0.1, 0.2));

        let obs = graph.observations_of(fid);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[1].group, g2);
        assert_eq!(obs[1].pose.translation.x, 1.0);
        assert_eq!(obs[1].keypoint, Vector2::new(-0.1, 0.2));
    }

    #[test]
    fn test_increment_lifetimes_only_graph_members() {
        let (mut graph, fid, gid) = graph_with_edge();
        let outside = graph.create_feature(Vector2::zeros());

        graph.increment_lifetimes();
        graph.increment_lifetimes();

        assert_eq!(graph.feature(fid).unwrap().lifetime, 2);
        assert_eq!(graph.group(gid).unwrap().lifetime, 2);
        assert_eq!(graph.feature(outside).unwrap().lifetime, 0);
    }
}
