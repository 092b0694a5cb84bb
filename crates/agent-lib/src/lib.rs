//! Agent library for per-pod GPU memory attribution
//!
//! This crate provides the core functionality for:
//! - Listing pods and their running containers from the cluster API
//! - Enumerating the processes of each container
//! - Reading per-process GPU memory usage from the driver
//! - Attributing device processes to pods and publishing Prometheus gauges
//! - Health checks and observability

pub mod attribution;
pub mod enumerator;
pub mod error;
pub mod health;
pub mod inventory;
pub mod models;
pub mod observability;
pub mod publisher;
pub mod refresh;
pub mod telemetry;

pub use error::{AgentError, AgentResult, Severity};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use publisher::MetricsPublisher;
pub use refresh::{RefreshLoop, RefreshLoopBuilder};
