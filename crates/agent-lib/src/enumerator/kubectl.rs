//! Process enumeration by exec'ing `ps` inside the container

use super::{parse_pid_list, ProcessEnumerator};
use crate::error::{AgentError, AgentResult};
use crate::models::{ContainerTarget, Pid};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs `kubectl exec -n <ns> <pod> -c <container> -- ps -e -o pid=`
///
/// The returned PIDs live in the container's PID namespace.
pub struct KubectlEnumerator {
    kubectl: PathBuf,
}

impl KubectlEnumerator {
    pub fn new(kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    fn command(&self, target: &ContainerTarget) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("exec")
            .arg("-n")
            .arg(&target.pod.namespace)
            .arg(&target.pod.name)
            .arg("-c")
            .arg(&target.container_name)
            .args(["--", "ps", "-e", "-o", "pid="])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // a timed-out enumeration drops the child with the future
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessEnumerator for KubectlEnumerator {
    async fn enumerate(&self, target: &ContainerTarget) -> AgentResult<Vec<Pid>> {
        let enumeration_error = |message: String| AgentError::Enumeration {
            container_id: target.container_id.to_string(),
            message,
        };

        let output = self
            .command(target)
            .output()
            .await
            .map_err(|e| {
                enumeration_error(format!("failed to run {}: {e}", self.kubectl.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(enumeration_error(format!(
                "{} exited with {}: {}",
                self.kubectl.display(),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pids = parse_pid_list(&target.container_id, &stdout);

        debug!(
            pod = %target.pod,
            container_id = %target.container_id,
            count = pids.len(),
            "Enumerated container processes"
        );

        Ok(pids)
    }
}
