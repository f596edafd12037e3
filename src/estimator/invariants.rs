//! Runtime invariant checks.
//!
//! In strict mode a violated invariant aborts the step with an error. In
//! production mode checks are skipped and the step continues.

use anyhow::{bail, Result};
use tracing::error;

use crate::graph::{FeatureStatus, Graph};

use super::config::InvariantMode;
use super::slots::StateSlots;

#[derive(Debug, Clone, Copy)]
pub struct InvariantChecker {
    mode: InvariantMode,
}

impl InvariantChecker {
    pub fn new(mode: InvariantMode) -> Self {
        Self { mode }
    }

    pub fn is_strict(&self) -> bool {
        self.mode == InvariantMode::Strict
    }

    /// Fail with `message` if `condition` does not hold and checks are enabled.
    pub fn check<M>(&self, condition: bool, message: M) -> Result<()>
    where
        M: FnOnce() -> String,
    {
        if condition || !self.is_strict() {
            return Ok(());
        }
        let message = message();
        error!("[Invariant] {}", message);
        bail!(message)
    }

    /// Structural checks that must hold at the end of every step.
    pub fn check_step(
        &self,
        graph: &Graph,
        slots: &StateSlots,
        max_features: usize,
        max_groups: usize,
    ) -> Result<()> {
        if !self.is_strict() {
            return Ok(());
        }
        graph.sanity_check()?;

        let instate_features = graph.instate_features();
        let instate_groups = graph.instate_groups();
        self.check(instate_features.len() <= max_features, || {
            format!("{} in-state features exceed capacity {}", instate_features.len(), max_features)
        })?;
        self.check(instate_groups.len() <= max_groups, || {
            format!("{} in-state groups exceed capacity {}", instate_groups.len(), max_groups)
        })?;
        self.check(slots.used_feature_slots() == instate_features.len(), || {
            format!(
                "{} feature slots used for {} in-state features",
                slots.used_feature_slots(),
                instate_features.len()
            )
        })?;
        self.check(slots.used_group_slots() == instate_groups.len(), || {
            format!(
                "{} group slots used for {} in-state groups",
                slots.used_group_slots(),
                instate_groups.len()
            )
        })?;

        for f in graph.features() {
            self.check(f.status != FeatureStatus::RejectedByFilter, || {
                format!("rejected feature {} survived the step", f.id)
            })?;
            if !f.instate {
                continue;
            }
            let reference = f.ref_group.and_then(|gid| graph.group(gid));
            self.check(reference.is_some_and(|g| g.instate), || {
                format!("in-state feature {} has no in-state reference group", f.id)
            })?;
            self.check(
                f.slot.and_then(|slot| slots.feature_at(slot)) == Some(f.id),
                || format!("in-state feature {} does not own its slot", f.id),
            )?;
        }
        for g in graph.groups() {
            if g.instate {
                self.check(
                    g.slot.and_then(|slot| slots.group_at(slot)) == Some(g.id),
                    || format!("in-state group {} does not own its slot", g.id),
                )?;
            }
        }
        Ok(())
    }
}
