//! Fixed-capacity state slots for features and groups.
//!
//! A slot index is the block a feature or group occupies in the filter state.
//! Capacities are the configured maxima and never change after construction.

use crate::graph::{FeatureId, GroupId};

#[derive(Debug, Clone)]
pub struct StateSlots {
    features: Vec<Option<FeatureId>>,
    groups: Vec<Option<GroupId>>,
}

fn acquire<T: Copy>(slots: &mut [Option<T>], id: T) -> Option<usize> {
    let index = slots.iter().position(Option::is_none)?;
    slots[index] = Some(id);
    Some(index)
}

fn release<T>(slots: &mut [Option<T>], index: usize) -> Option<T> {
    slots.get_mut(index).and_then(Option::take)
}

impl StateSlots {
    pub fn new(max_features: usize, max_groups: usize) -> Self {
        Self {
            features: vec![None; max_features],
            groups: vec![None; max_groups],
        }
    }

    /// Lowest free feature slot, now owned by `id`.
    pub fn acquire_feature(&mut self, id: FeatureId) -> Option<usize> {
        acquire(&mut self.features, id)
    }

    pub fn release_feature(&mut self, slot: usize) -> Option<FeatureId> {
        release(&mut self.features, slot)
    }

    pub fn acquire_group(&mut self, id: GroupId) -> Option<usize> {
        acquire(&mut self.groups, id)
    }

    pub fn release_group(&mut self, slot: usize) -> Option<GroupId> {
        release(&mut self.groups, slot)
    }

    pub fn feature_at(&self, slot: usize) -> Option<FeatureId> {
        self.features.get(slot).copied().flatten()
    }

    pub fn group_at(&self, slot: usize) -> Option<GroupId> {
        self.groups.get(slot).copied().flatten()
    }

    pub fn free_feature_slots(&self) -> usize {
        self.features.iter().filter(|s| s.is_none()).count()
    }

    pub fn free_group_slots(&self) -> usize {
        self.groups.iter().filter(|s| s.is_none()).count()
    }

    pub fn used_feature_slots(&self) -> usize {
        self.features.len() - self.free_feature_slots()
    }

    pub fn used_group_slots(&self) -> usize {
        self.groups.len() - self.free_group_slots()
    }
}
