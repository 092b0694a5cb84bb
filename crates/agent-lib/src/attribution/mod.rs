//! Attribution engine
//!
//! Joins per-pod process ownership with per-device process telemetry.
//! Everything here is a pure function of its inputs: for the same pods and
//! devices it produces the same records, independent of input order.

mod join;
mod ownership;

#[cfg(test)]
mod tests;

pub use join::{attribute, Attribution};
pub use ownership::{OwnershipMap, PidConflict};

use crate::models::{AttributedUsage, DeviceUsage, PodProcesses};

/// Result of one attribution pass
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionReport {
    /// Matched (pid, device) records
    pub records: Vec<AttributedUsage>,
    /// PIDs claimed by more than one pod, with the tie-break outcome
    pub conflicts: Vec<PidConflict>,
    /// Driver-reported processes no pod owns
    pub unmatched: usize,
    /// Devices that reported zero total memory
    pub zero_capacity_devices: Vec<u32>,
    /// Number of PIDs in the ownership map
    pub owned_pids: usize,
}

/// Build PID ownership from `pods` and attribute the usage in `devices`
pub fn run(pods: &[PodProcesses], devices: &[DeviceUsage]) -> AttributionReport {
    let ownership = OwnershipMap::build(pods);
    let attribution = attribute(&ownership, devices);

    AttributionReport {
        records: attribution.records,
        conflicts: ownership.conflicts().to_vec(),
        unmatched: attribution.unmatched,
        zero_capacity_devices: attribution.zero_capacity_devices,
        owned_pids: ownership.len(),
    }
}
