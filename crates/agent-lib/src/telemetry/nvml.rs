//! NVML-backed device telemetry
//!
//! NVML calls are blocking, so every query runs on the blocking pool.

use super::{DeviceHandle, DeviceTelemetry};
use crate::error::{AgentError, AgentResult};
use crate::models::{DeviceUsage, Pid, ProcessUsage};
use async_trait::async_trait;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::sync::Arc;
use tracing::{debug, info};

/// Device telemetry reader backed by the NVIDIA management library
pub struct NvmlTelemetry {
    nvml: Arc<Nvml>,
}

impl NvmlTelemetry {
    /// Load and initialize NVML
    pub fn init() -> AgentResult<Self> {
        let nvml = Nvml::init().map_err(|e| AgentError::DriverUnavailable(e.to_string()))?;

        match nvml.sys_driver_version() {
            Ok(version) => info!(driver_version = %version, "NVML initialized"),
            Err(e) => debug!(error = %e, "NVML initialized, driver version unknown"),
        }

        Ok(Self {
            nvml: Arc::new(nvml),
        })
    }

    fn query_device(nvml: &Nvml, index: u32) -> AgentResult<DeviceUsage> {
        let device = nvml
            .device_by_index(index)
            .map_err(|e| classify_device_error(index, e))?;

        let memory = device
            .memory_info()
            .map_err(|e| classify_device_error(index, e))?;

        let running = device
            .running_compute_processes()
            .map_err(|e| classify_device_error(index, e))?;

        let processes = running
            .into_iter()
            .filter_map(|process| match process.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => Some(ProcessUsage {
                    pid: Pid(process.pid),
                    used_memory_bytes: bytes,
                }),
                UsedGpuMemory::Unavailable => {
                    debug!(
                        device_index = index,
                        pid = process.pid,
                        "Driver did not report used memory, skipping process"
                    );
                    None
                }
            })
            .collect();

        Ok(DeviceUsage {
            device_index: index,
            total_memory_bytes: memory.total,
            processes,
        })
    }
}

/// Map an NVML error on a device call to the agent error taxonomy
///
/// Errors that mean the library or driver as a whole is gone are fatal;
/// everything else only affects the one device.
pub(crate) fn classify_device_error(index: u32, error: NvmlError) -> AgentError {
    match error {
        NvmlError::Uninitialized
        | NvmlError::DriverNotLoaded
        | NvmlError::LibraryNotFound
        | NvmlError::LibloadingError(_)
        | NvmlError::FailedToLoadSymbol(_) => AgentError::DriverUnavailable(error.to_string()),
        other => AgentError::DeviceQuery {
            index,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl DeviceTelemetry for NvmlTelemetry {
    async fn list_devices(&self) -> AgentResult<Vec<DeviceHandle>> {
        let nvml = Arc::clone(&self.nvml);

        let count = tokio::task::spawn_blocking(move || nvml.device_count())
            .await
            .map_err(|e| AgentError::DriverUnavailable(format!("device count task failed: {e}")))?
            .map_err(|e| AgentError::DriverUnavailable(e.to_string()))?;

        Ok((0..count).map(|index| DeviceHandle { index }).collect())
    }

    async fn device_usage(&self, device: DeviceHandle) -> AgentResult<DeviceUsage> {
        let nvml = Arc::clone(&self.nvml);
        let index = device.index;

        tokio::task::spawn_blocking(move || Self::query_device(&nvml, index))
            .await
            .map_err(|e| AgentError::DeviceQuery {
                index,
                message: format!("query task failed: {e}"),
            })?
    }
}
