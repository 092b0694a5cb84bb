//! Join of device process telemetry against PID ownership

use super::OwnershipMap;
use crate::models::{AttributedUsage, DeviceUsage};

/// Output of the join step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribution {
    pub records: Vec<AttributedUsage>,
    pub unmatched: usize,
    pub zero_capacity_devices: Vec<u32>,
}

/// Percentage of the device total, `None` when the total is unknown
fn percent_of(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(used as f64 / total as f64 * 100.0)
    }
}

/// Attribute every driver-reported process to its owning pod
///
/// Records are ordered by device index, then PID.
pub fn attribute(ownership: &OwnershipMap, devices: &[DeviceUsage]) -> Attribution {
    let mut attribution = Attribution::default();

    for device in devices {
        if device.total_memory_bytes == 0 {
            attribution.zero_capacity_devices.push(device.device_index);
        }

        for process in &device.processes {
            match ownership.owner(process.pid) {
                Some(pod) => attribution.records.push(AttributedUsage {
                    pid: process.pid,
                    pod: pod.clone(),
                    device_index: device.device_index,
                    used_memory_bytes: process.used_memory_bytes,
                    device_total_bytes: device.total_memory_bytes,
                    percent_of_device_total: percent_of(
                        process.used_memory_bytes,
                        device.total_memory_bytes,
                    ),
                }),
                None => attribution.unmatched += 1,
            }
        }
    }

    attribution
        .records
        .sort_by(|a, b| (a.device_index, a.pid).cmp(&(b.device_index, b.pid)));
    attribution.zero_capacity_devices.sort_unstable();
    attribution.zero_capacity_devices.dedup();

    attribution
}
