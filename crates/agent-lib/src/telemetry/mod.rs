//! GPU device telemetry
//!
//! Lists the GPU devices of the local node and reports, per device, total
//! memory and the running compute processes with their memory usage.

mod nvml;

pub use nvml::NvmlTelemetry;

use crate::error::AgentResult;
use crate::models::DeviceUsage;
use async_trait::async_trait;

/// Opaque reference to one device, valid for the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle {
    pub index: u32,
}

/// Trait for device telemetry implementations
///
/// `list_devices` fails only with [`AgentError::DriverUnavailable`].
/// `device_usage` fails with `DriverUnavailable` when the driver as a whole
/// is gone and with [`AgentError::DeviceQuery`] when only that device is.
///
/// [`AgentError::DriverUnavailable`]: crate::error::AgentError::DriverUnavailable
/// [`AgentError::DeviceQuery`]: crate::error::AgentError::DeviceQuery
#[async_trait]
pub trait DeviceTelemetry: Send + Sync {
    /// Enumerate the devices currently installed
    async fn list_devices(&self) -> AgentResult<Vec<DeviceHandle>>;

    /// Query total memory and running compute processes of one device
    async fn device_usage(&self, device: DeviceHandle) -> AgentResult<DeviceUsage>;
}
