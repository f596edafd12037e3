//! Storage for mapped features and groups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::graph::{Feature, FeatureAdj, FeatureId, Group, GroupAdj, GroupId};

#[derive(Debug, Clone)]
pub struct MappedFeature {
    pub feature: Feature,
    pub groups: BTreeSet<GroupId>,
}

#[derive(Debug, Clone)]
pub struct MappedGroup {
    pub group: Group,
    pub features: BTreeSet<FeatureId>,
}

/// Mapper storage shared between the worker thread and readers.
///
/// Features and groups have separate locks; operations that touch both
/// always take the feature lock first.
pub struct MapStore {
    features: RwLock<BTreeMap<FeatureId, MappedFeature>>,
    groups: RwLock<BTreeMap<GroupId, MappedGroup>>,

    /// Request the worker to drain its queue and exit.
    shutdown_requested: AtomicBool,
}

impl MapStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// File a feature. Edges to groups already in the store are linked both ways.
    pub fn add_feature(&self, feature: Feature, adjacency: &FeatureAdj) {
        let mut features = self.features.write();
        let mut groups = self.groups.write();
        let fid = feature.id;
        for gid in adjacency.keys() {
            if let Some(g) = groups.get_mut(gid) {
                g.features.insert(fid);
            }
        }
        features.insert(
            fid,
            MappedFeature {
                feature,
                groups: adjacency.keys().copied().collect(),
            },
        );
    }

    /// File a group. Features already in the store that saw it are linked too.
    pub fn add_group(&self, group: Group, adjacency: &GroupAdj) {
        let mut features = self.features.write();
        let mut groups = self.groups.write();
        let gid = group.id;
        let mut linked = adjacency.clone();
        for (fid, f) in features.iter_mut() {
            if f.groups.contains(&gid) {
                linked.insert(*fid);
            } else if adjacency.contains(fid) {
                f.groups.insert(gid);
            }
        }
        groups.insert(
            gid,
            MappedGroup {
                group,
                features: linked,
            },
        );
    }

    pub fn remove_feature(&self, fid: FeatureId) -> Option<MappedFeature> {
        let mut features = self.features.write();
        let mut groups = self.groups.write();
        let removed = features.remove(&fid)?;
        for gid in &removed.groups {
            if let Some(g) = groups.get_mut(gid) {
                g.features.remove(&fid);
            }
        }
        Some(removed)
    }

    pub fn remove_group(&self, gid: GroupId) -> Option<MappedGroup> {
        let mut features = self.features.write();
        let mut groups = self.groups.write();
        let removed = groups.remove(&gid)?;
        for fid in &removed.features {
            if let Some(f) = features.get_mut(fid) {
                f.groups.remove(&gid);
            }
        }
        Some(removed)
    }

    pub fn features_of(&self, gid: GroupId) -> Vec<FeatureId> {
        self.groups
            .read()
            .get(&gid)
            .map(|g| g.features.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn groups_of(&self, fid: FeatureId) -> Vec<GroupId> {
        self.features
            .read()
            .get(&fid)
            .map(|f| f.groups.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn feature(&self, fid: FeatureId) -> Option<MappedFeature> {
        self.features.read().get(&fid).cloned()
    }

    pub fn group(&self, gid: GroupId) -> Option<MappedGroup> {
        self.groups.read().get(&gid).cloned()
    }

    pub fn num_features(&self) -> usize {
        self.features.read().len()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.read().len()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self {
            features: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use nalgebra::Vector2;

    fn feature(id: u64) -> Feature {
        Feature::new(FeatureId::new(id), Vector2::zeros())
    }

    #[test]
    fn test_links_regardless_of_arrival_order() {
        let store = MapStore::new();
        let gid = GroupId::new(1);

        let mut adj = FeatureAdj::new();
        adj.insert(gid, Vector2::zeros());
        store.add_feature(feature(10), &adj);
        store.add_group(Group::new(gid, 0, SE3::identity()), &GroupAdj::new());

        let mut group_adj = GroupAdj::new();
        group_adj.insert(FeatureId::new(11));
        store.add_feature(feature(11), &FeatureAdj::new());
        store.add_group(Group::new(GroupId::new(2), 0, SE3::identity()), &group_adj);

        assert_eq!(store.features_of(gid), vec![FeatureId::new(10)]);
        assert_eq!(store.groups_of(FeatureId::new(11)), vec![GroupId::new(2)]);
    }

    #[test]
    fn test_remove_unlinks() {
        let store = MapStore::new();
        let gid = GroupId::new(1);
        store.add_group(Group::new(gid, 0, SE3::identity()), &GroupAdj::new());
        let mut adj = FeatureAdj::new();
        adj.insert(gid, Vector2::zeros());
        store.add_feature(feature(3), &adj);

        assert!(store.remove_feature(FeatureId::new(3)).is_some());
        assert!(store.features_of(gid).is_empty());
        assert!(store.remove_group(gid).is_some());
        assert!(store.remove_group(gid).is_none());
        assert_eq!(store.num_groups(), 0);
    }
}
