//! PID to pod ownership

use crate::models::{Pid, PodKey, PodProcesses};
use std::collections::HashMap;

/// A PID claimed by two pods in the same cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidConflict {
    pub pid: Pid,
    /// Pod that held the PID before the tie-break
    pub previous: PodKey,
    /// Pod that owns the PID after the tie-break
    pub winner: PodKey,
}

/// Which pod owns each PID in the current cycle
///
/// Pods are applied in ascending `(namespace, name)` order and the last
/// writer wins, so a contested PID always goes to the greatest pod key no
/// matter what order the pods were listed in.
#[derive(Debug, Clone, Default)]
pub struct OwnershipMap {
    owners: HashMap<Pid, PodKey>,
    conflicts: Vec<PidConflict>,
}

impl OwnershipMap {
    pub fn build(pods: &[PodProcesses]) -> Self {
        let mut ordered: Vec<&PodProcesses> = pods.iter().collect();
        ordered.sort_by(|a, b| a.pod.cmp(&b.pod));

        let mut map = Self::default();
        for entry in ordered {
            for &pid in &entry.pids {
                map.insert(pid, &entry.pod);
            }
        }
        map
    }

    fn insert(&mut self, pid: Pid, pod: &PodKey) {
        if let Some(previous) = self.owners.insert(pid, pod.clone()) {
            if &previous != pod {
                self.conflicts.push(PidConflict {
                    pid,
                    previous,
                    winner: pod.clone(),
                });
            }
        }
    }

    /// Owner of a PID, compared by PID value
    pub fn owner(&self, pid: Pid) -> Option<&PodKey> {
        self.owners.get(&pid)
    }

    pub fn conflicts(&self) -> &[PidConflict] {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
