//! Core data models for the GPU attribution agent

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Operating-system process identifier
///
/// Only unique within one PID namespace at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl Pid {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for Pid {
    fn from(value: u32) -> Self {
        Pid(value)
    }
}

impl FromStr for Pid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Pid)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a pod: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Container runtime identifier with the `<runtime>://` prefix stripped
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Normalize a runtime-qualified identifier such as `containerd://abc`
    ///
    /// Returns `None` when nothing is left after stripping.
    pub fn normalize(raw: &str) -> Option<Self> {
        let id = match raw.find("://") {
            Some(pos) => &raw[pos + 3..],
            None => raw,
        };
        let id = id.trim();

        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A running container inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodContainer {
    pub name: String,
    pub id: ContainerId,
}

/// Pod as seen by the inventory lister in the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub key: PodKey,
    pub containers: Vec<PodContainer>,
}

impl Pod {
    pub fn container_ids(&self) -> BTreeSet<&ContainerId> {
        self.containers.iter().map(|c| &c.id).collect()
    }
}

/// Everything a process enumerator may need to locate a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub pod: PodKey,
    pub container_name: String,
    pub container_id: ContainerId,
}

/// PIDs collected for one pod, the union over its containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodProcesses {
    pub pod: PodKey,
    pub pids: BTreeSet<Pid>,
}

/// Memory used by one process on one device, as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: Pid,
    pub used_memory_bytes: u64,
}

/// Snapshot of one GPU device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUsage {
    pub device_index: u32,
    pub total_memory_bytes: u64,
    pub processes: Vec<ProcessUsage>,
}

/// One process matched to its owning pod on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedUsage {
    pub pid: Pid,
    pub pod: PodKey,
    pub device_index: u32,
    pub used_memory_bytes: u64,
    pub device_total_bytes: u64,
    /// `None` when the device reported zero total memory
    pub percent_of_device_total: Option<f64>,
}

impl AttributedUsage {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.pid, &self.pod)
    }
}

/// Label tuple `(pid, pod)` a gauge value is published under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub pid: String,
    pub pod: String,
}

impl SeriesKey {
    pub fn new(pid: Pid, pod: &PodKey) -> Self {
        Self {
            pid: pid.to_string(),
            pod: pod.to_string(),
        }
    }

    pub fn labels(&self) -> [&str; 2] {
        [self.pid.as_str(), self.pod.as_str()]
    }
}
