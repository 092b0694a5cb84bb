//! Pod inventory
//!
//! Lists pods from the cluster API and extracts the runtime identifiers of
//! their running containers.

mod kube;

pub use self::kube::{connect, pod_from_k8s, KubePodLister};

use crate::error::AgentResult;
use crate::models::Pod;
use async_trait::async_trait;

/// Trait for pod inventory implementations
#[async_trait]
pub trait PodLister: Send + Sync {
    /// List pods, failing with `ClusterUnreachable` on any API error
    async fn list_pods(&self) -> AgentResult<Vec<Pod>>;
}
