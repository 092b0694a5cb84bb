//! Error taxonomy for the attribution agent
//!
//! Errors are classified by how far they are allowed to propagate:
//! fatal errors end the process, cycle-level errors skip one refresh,
//! item-level errors only drop the affected device or container.

use std::time::Duration;
use thiserror::Error;

/// How far an error is allowed to escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The process cannot do anything useful and must exit
    Fatal,
    /// The current cycle is abandoned without publishing
    CycleSkipped,
    /// One device, pod or container is left out of the current cycle
    ItemDegraded,
}

#[derive(Debug, Error)]
pub enum AgentError {
    /// The GPU driver cannot be initialized or globally queried
    #[error("GPU driver unavailable: {0}")]
    DriverUnavailable(String),

    /// A collaborator client could not be constructed at startup
    #[error("failed to initialize {component}: {message}")]
    ClientInit { component: String, message: String },

    /// The cluster API could not be reached or returned an error
    #[error("cluster API unreachable: {0}")]
    ClusterUnreachable(String),

    /// Listing GPU devices did not finish in time
    #[error("device listing timed out after {0:?}")]
    DeviceListTimeout(Duration),

    /// One device could not be queried on an otherwise healthy driver
    #[error("device {index} query failed: {message}")]
    DeviceQuery { index: u32, message: String },

    /// Process enumeration failed for one container
    #[error("failed to enumerate processes of container {container_id}: {message}")]
    Enumeration {
        container_id: String,
        message: String,
    },

    /// An item-level external call exceeded its deadline
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },
}

impl AgentError {
    pub fn severity(&self) -> Severity {
        match self {
            AgentError::DriverUnavailable(_) | AgentError::ClientInit { .. } => Severity::Fatal,
            AgentError::ClusterUnreachable(_) | AgentError::DeviceListTimeout(_) => {
                Severity::CycleSkipped
            }
            AgentError::DeviceQuery { .. }
            | AgentError::Enumeration { .. }
            | AgentError::Timeout { .. } => Severity::ItemDegraded,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Short label used for the error counter metric
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::DriverUnavailable(_) => "driver_unavailable",
            AgentError::ClientInit { .. } => "client_init",
            AgentError::ClusterUnreachable(_) => "cluster_unreachable",
            AgentError::DeviceListTimeout(_) => "device_list_timeout",
            AgentError::DeviceQuery { .. } => "device_query",
            AgentError::Enumeration { .. } => "enumeration",
            AgentError::Timeout { .. } => "timeout",
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert!(AgentError::DriverUnavailable("not loaded".into()).is_fatal());
        assert_eq!(
            AgentError::ClusterUnreachable("connection refused".into()).severity(),
            Severity::CycleSkipped
        );
        assert_eq!(
            AgentError::DeviceQuery {
                index: 1,
                message: "gpu lost".into()
            }
            .severity(),
            Severity::ItemDegraded
        );
        assert_eq!(
            AgentError::Timeout {
                operation: "enumerate".into(),
                elapsed: Duration::from_secs(10)
            }
            .severity(),
            Severity::ItemDegraded
        );
    }

    #[test]
    fn test_error_display() {
        let err = AgentError::Enumeration {
            container_id: "abc".into(),
            message: "exit status 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to enumerate processes of container abc: exit status 1"
        );
    }
}
