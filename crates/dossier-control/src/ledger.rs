//! The section ledger: registered sections, their records, and the
//! dependency-ordered execution schedule.

use std::collections::{BTreeMap, BTreeSet};

use dossier_types::{SectionId, SectionRecord, SectionState};
use serde::{Deserialize, Serialize};

use crate::transition::ControlError;

/// The controller's in-memory state. The version counter bumps on every
/// accepted transition; snapshots carry it so readers can detect staleness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionLedger {
    sections: BTreeMap<SectionId, SectionRecord>,
    version: u64,
}

/// A version-stamped read-only copy handed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u64,
    pub sections: BTreeMap<SectionId, SectionRecord>,
}

impl SectionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: SectionId) -> Option<&SectionRecord> {
        self.sections.get(&id)
    }

    pub fn contains(&self, id: SectionId) -> bool {
        self.sections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// True iff the section may start: state is IDLE or REVISION_REQUESTED
    /// and every dependency is COMPLETED.
    pub fn can_run(&self, id: SectionId) -> Result<bool, ControlError> {
        let record = self.sections.get(&id).ok_or(ControlError::Unregistered(id))?;
        if !matches!(
            record.state,
            SectionState::Idle | SectionState::RevisionRequested
        ) {
            return Ok(false);
        }
        Ok(self.dependencies_completed(record))
    }

    /// True iff every dependency of `record` is COMPLETED. Unregistered
    /// dependencies count as incomplete.
    pub fn dependencies_completed(&self, record: &SectionRecord) -> bool {
        record.depends_on.iter().all(|dep| {
            self.sections
                .get(dep)
                .is_some_and(|r| r.state == SectionState::Completed)
        })
    }

    /// Stable topological order over `depends_on`, ties broken by priority
    /// ascending, then by section label lexicographically.
    ///
    /// Registration rejects cycles, so this cannot fail on a ledger built
    /// through [`crate::apply`]; a cycle here means corruption.
    pub fn execution_order(&self) -> Vec<SectionId> {
        let mut remaining: BTreeSet<SectionId> = self.sections.keys().copied().collect();
        let mut order = Vec::with_capacity(remaining.len());
        let mut done: BTreeSet<SectionId> = BTreeSet::new();

        while !remaining.is_empty() {
            let mut ready: Vec<SectionId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.sections[id]
                        .depends_on
                        .iter()
                        // Dependencies outside the registered set cannot
                        // order anything; skip them here.
                        .filter(|dep| self.sections.contains_key(dep))
                        .all(|dep| done.contains(dep))
                })
                .collect();
            assert!(!ready.is_empty(), "section dependency graph contains a cycle");
            ready.sort_by(|a, b| {
                let pa = self.sections[a].priority;
                let pb = self.sections[b].priority;
                pa.cmp(&pb).then_with(|| a.as_str().cmp(b.as_str()))
            });
            let next = ready[0];
            remaining.remove(&next);
            done.insert(next);
            order.push(next);
        }
        order
    }

    /// Sections transitively blocked behind `id` (its dependents, their
    /// dependents, and so on).
    pub fn downstream_of(&self, id: SectionId) -> BTreeSet<SectionId> {
        let mut blocked = BTreeSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for (candidate, record) in &self.sections {
                if record.depends_on.contains(&current) && blocked.insert(*candidate) {
                    frontier.push(*candidate);
                }
            }
        }
        blocked
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: self.version,
            sections: self.sections.clone(),
        }
    }

    /// Would inserting `id` with these dependencies close a cycle?
    pub(crate) fn would_cycle(&self, id: SectionId, depends_on: &[SectionId]) -> bool {
        // DFS from each dependency through existing edges; reaching `id`
        // back means the new edges close a loop.
        let mut stack: Vec<SectionId> = depends_on.to_vec();
        let mut seen: BTreeSet<SectionId> = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == id {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(record) = self.sections.get(&current) {
                stack.extend(record.depends_on.iter().copied());
            }
        }
        false
    }

    pub(crate) fn insert(&mut self, record: SectionRecord) {
        self.sections.insert(record.section_id, record);
    }

    pub(crate) fn get_mut(&mut self, id: SectionId) -> Option<&mut SectionRecord> {
        self.sections.get_mut(&id)
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}
