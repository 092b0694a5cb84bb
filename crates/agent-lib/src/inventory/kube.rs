//! Kubernetes API pod lister

use super::PodLister;
use crate::error::{AgentError, AgentResult};
use crate::models::{ContainerId, Pod, PodContainer, PodKey};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::debug;

/// Build a Kubernetes client from an explicit kubeconfig or the default chain
///
/// Without a kubeconfig path the in-cluster service account is tried first,
/// then `~/.kube/config`.
pub async fn connect(kubeconfig: Option<&Path>) -> AgentResult<Client> {
    let init_error = |message: String| AgentError::ClientInit {
        component: "kubernetes client".to_string(),
        message,
    };

    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                init_error(format!("failed to read kubeconfig {}: {e}", path.display()))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| init_error(format!("invalid kubeconfig {}: {e}", path.display())))?;
            Client::try_from(config).map_err(|e| init_error(e.to_string()))
        }
        None => Client::try_default()
            .await
            .map_err(|e| init_error(e.to_string())),
    }
}

/// Pod lister backed by the Kubernetes API
pub struct KubePodLister {
    client: Client,
    /// Restrict the listing to pods scheduled on this node
    node_name: Option<String>,
}

impl KubePodLister {
    /// List pods across all namespaces
    pub fn new(client: Client) -> Self {
        Self {
            client,
            node_name: None,
        }
    }

    /// Only list pods scheduled on the given node
    pub fn with_node(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: Some(node_name.into()),
        }
    }

    fn list_params(&self) -> ListParams {
        match &self.node_name {
            Some(node) => ListParams::default().fields(&format!("spec.nodeName={node}")),
            None => ListParams::default(),
        }
    }
}

/// Convert an API pod into the inventory model
///
/// Containers without a runtime ID (not started yet) are left out.
/// Returns `None` for pods without a name.
pub fn pod_from_k8s(pod: K8sPod) -> Option<Pod> {
    let metadata = pod.metadata;
    let name = metadata.name?;
    let namespace = metadata.namespace.unwrap_or_else(|| "default".to_string());

    let containers = pod
        .status
        .and_then(|status| status.container_statuses)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|status| {
            let id = status
                .container_id
                .as_deref()
                .and_then(ContainerId::normalize)?;
            Some(PodContainer {
                name: status.name,
                id,
            })
        })
        .collect();

    Some(Pod {
        key: PodKey::new(namespace, name),
        containers,
    })
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(&self) -> AgentResult<Vec<Pod>> {
        let api: Api<K8sPod> = Api::all(self.client.clone());

        let list = api
            .list(&self.list_params())
            .await
            .map_err(|e| AgentError::ClusterUnreachable(e.to_string()))?;

        let pods: Vec<Pod> = list.items.into_iter().filter_map(pod_from_k8s).collect();
        debug!(count = pods.len(), node = ?self.node_name, "Listed pods");

        Ok(pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use kube::api::ObjectMeta;

    fn k8s_pod(namespace: &str, name: &str, statuses: Vec<(&str, Option<&str>)>) -> K8sPod {
        K8sPod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(
                    statuses
                        .into_iter()
                        .map(|(container, id)| ContainerStatus {
                            name: container.to_string(),
                            container_id: id.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_from_k8s_normalizes_container_ids() {
        let pod = k8s_pod(
            "ml",
            "trainer-0",
            vec![
                ("main", Some("containerd://aaa111")),
                ("sidecar", Some("docker://bbb222")),
            ],
        );

        let pod = pod_from_k8s(pod).unwrap();
        assert_eq!(pod.key, PodKey::new("ml", "trainer-0"));
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[0].name, "main");
        assert_eq!(pod.containers[0].id.as_str(), "aaa111");
        assert_eq!(pod.containers[1].id.as_str(), "bbb222");
    }

    #[test]
    fn test_pod_from_k8s_skips_unstarted_containers() {
        let pod = k8s_pod(
            "default",
            "pending",
            vec![("main", None), ("init", Some(""))],
        );

        let pod = pod_from_k8s(pod).unwrap();
        assert!(pod.containers.is_empty());
    }

    #[test]
    fn test_pod_from_k8s_without_status() {
        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let pod = pod_from_k8s(pod).unwrap();
        assert_eq!(pod.key, PodKey::new("default", "bare"));
        assert!(pod.containers.is_empty());
    }

    #[test]
    fn test_pod_from_k8s_without_name() {
        assert!(pod_from_k8s(K8sPod::default()).is_none());
    }
}
