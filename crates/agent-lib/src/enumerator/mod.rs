//! Process enumeration for containers
//!
//! Resolves a container to the PIDs currently running inside it. Two
//! mechanisms are provided: exec'ing `ps` through `kubectl`, and reading
//! `cgroup.procs` from the node's cgroup filesystem with automatic
//! cgroup v1/v2 detection.

mod cgroup;
mod kubectl;

pub use cgroup::{detect_cgroup_version, extract_container_id, CgroupEnumerator, CgroupVersion};
pub use kubectl::KubectlEnumerator;

use crate::error::AgentResult;
use crate::models::{ContainerId, ContainerTarget, Pid};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Trait for process enumeration implementations
#[async_trait]
pub trait ProcessEnumerator: Send + Sync {
    /// List the PIDs visible inside one container
    async fn enumerate(&self, target: &ContainerTarget) -> AgentResult<Vec<Pid>>;

    /// Called once before the containers of a refresh cycle are enumerated
    async fn begin_cycle(&self) {}
}

/// Which enumeration mechanism to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnumeratorKind {
    Kubectl,
    Cgroup,
}

impl EnumeratorKind {
    /// Whether the PIDs returned are host PIDs, comparable with the driver's
    pub fn reports_host_pids(self) -> bool {
        match self {
            EnumeratorKind::Kubectl => false,
            EnumeratorKind::Cgroup => true,
        }
    }
}

/// Create the configured enumerator
pub async fn create_enumerator(
    kind: EnumeratorKind,
    kubectl_path: &str,
    cgroup_root: &std::path::Path,
) -> Arc<dyn ProcessEnumerator> {
    if !kind.reports_host_pids() {
        warn!(
            enumerator = ?kind,
            "Enumerator reports container-namespace PIDs, only hostPID pods will match \
             driver PIDs; use enumerator=cgroup with restrict_to_node to attribute the rest"
        );
    }

    match kind {
        EnumeratorKind::Kubectl => {
            tracing::info!(
                kubectl = %kubectl_path,
                "Enumerating container processes via kubectl exec"
            );
            Arc::new(KubectlEnumerator::new(kubectl_path))
        }
        EnumeratorKind::Cgroup => {
            let enumerator = CgroupEnumerator::detect(cgroup_root).await;
            tracing::info!(
                cgroup_root = %cgroup_root.display(),
                version = ?enumerator.version(),
                "Enumerating container processes via cgroup.procs"
            );
            Arc::new(enumerator)
        }
    }
}

/// Parse whitespace-separated PID output into PID values
///
/// Tokens that are not process identifiers are logged and dropped.
pub fn parse_pid_list(container_id: &ContainerId, output: &str) -> Vec<Pid> {
    let mut pids = Vec::new();

    for token in output.split_whitespace() {
        match token.parse::<Pid>() {
            Ok(pid) => pids.push(pid),
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    token = %token,
                    "Ignoring non-numeric PID token"
                );
            }
        }
    }

    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_list() {
        let id = ContainerId::normalize("containerd://abc").unwrap();
        let pids = parse_pid_list(&id, "    1\n   27\n 1234\n");
        assert_eq!(pids, vec![Pid(1), Pid(27), Pid(1234)]);
    }

    #[test]
    fn test_parse_pid_list_keeps_values_not_positions() {
        let id = ContainerId::normalize("abc").unwrap();
        let pids = parse_pid_list(&id, "9999\n1234\n");
        assert_eq!(pids, vec![Pid(9999), Pid(1234)]);
        assert!(pids.contains(&Pid(1234)));
        assert!(!pids.contains(&Pid(1)));
    }

    #[test]
    fn test_parse_pid_list_drops_garbage() {
        let id = ContainerId::normalize("abc").unwrap();
        let pids = parse_pid_list(&id, "PID\n42\nOCI runtime exec failed\n");
        assert_eq!(pids, vec![Pid(42)]);
    }

    #[test]
    fn test_only_cgroup_reports_host_pids() {
        assert!(!EnumeratorKind::Kubectl.reports_host_pids());
        assert!(EnumeratorKind::Cgroup.reports_host_pids());
    }

    #[tokio::test]
    async fn test_create_enumerator_cgroup_rejects_unknown_container() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::write(root.path().join("cgroup.controllers"), "cpu memory\n").unwrap();

        let enumerator = create_enumerator(EnumeratorKind::Cgroup, "kubectl", root.path()).await;
        enumerator.begin_cycle().await;

        let target = ContainerTarget {
            pod: crate::models::PodKey::new("default", "remote"),
            container_name: "main".to_string(),
            container_id: ContainerId::normalize("containerd://abc").unwrap(),
        };
        assert!(enumerator.enumerate(&target).await.is_err());
    }

    #[test]
    fn test_parse_pid_list_empty() {
        let id = ContainerId::normalize("abc").unwrap();
        assert!(parse_pid_list(&id, "").is_empty());
    }
}
