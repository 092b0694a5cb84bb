//! Agent configuration

use anyhow::{bail, Context, Result};
use gpu_agent_lib::enumerator::EnumeratorKind;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: Option<String>,

    /// List only the pods scheduled on `node_name`
    #[serde(default)]
    pub restrict_to_node: bool,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Time between refresh cycles in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Deadline for each cluster, driver or enumeration call in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Containers enumerated concurrently per cycle
    #[serde(default = "default_enumeration_concurrency")]
    pub enumeration_concurrency: usize,

    /// Process enumeration mechanism
    #[serde(default = "default_enumerator")]
    pub enumerator: EnumeratorKind,

    /// kubectl binary used by the kubectl enumerator
    #[serde(default = "default_kubectl_path")]
    pub kubectl_path: String,

    /// cgroup mount used by the cgroup enumerator
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Explicit kubeconfig, in-cluster or default config otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

fn default_node_name() -> Option<String> {
    std::env::var("NODE_NAME").ok().filter(|n| !n.is_empty())
}

fn default_api_port() -> u16 {
    8000
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_enumeration_concurrency() -> usize {
    8
}

fn default_enumerator() -> EnumeratorKind {
    EnumeratorKind::Kubectl
}

fn default_kubectl_path() -> String {
    "kubectl".to_string()
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be greater than zero");
        }
        if self.enumeration_concurrency == 0 {
            bail!("enumeration_concurrency must be greater than zero");
        }
        if self.restrict_to_node && self.node_name.is_none() {
            bail!("restrict_to_node requires node_name (or NODE_NAME) to be set");
        }
        if self.enumerator == EnumeratorKind::Cgroup && !self.restrict_to_node {
            // Pods on other nodes have no local cgroup
            bail!("enumerator=cgroup requires restrict_to_node=true");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Node name for log lines
    pub fn node_label(&self) -> &str {
        self.node_name.as_deref().unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AgentConfig> {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value)?;
        }
        let config: AgentConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert!(!config.restrict_to_node);
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.enumeration_concurrency, 8);
        assert_eq!(config.enumerator, EnumeratorKind::Kubectl);
        assert_eq!(config.kubectl_path, "kubectl");
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert!(config.kubeconfig.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("node_name", "gpu-node-1"),
            ("restrict_to_node", "true"),
            ("api_port", "9400"),
            ("enumerator", "cgroup"),
            ("kubeconfig", "/etc/kube/config"),
        ])
        .unwrap();

        assert_eq!(config.node_label(), "gpu-node-1");
        assert!(config.restrict_to_node);
        assert_eq!(config.api_port, 9400);
        assert_eq!(config.enumerator, EnumeratorKind::Cgroup);
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/etc/kube/config")));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(from_pairs(&[("refresh_interval_secs", "0")]).is_err());
    }

    #[test]
    fn test_cgroup_enumerator_requires_node_restriction() {
        let err = from_pairs(&[("node_name", "gpu-node-1"), ("enumerator", "cgroup")])
            .unwrap_err();
        assert!(err.to_string().contains("restrict_to_node"));

        let config = from_pairs(&[
            ("node_name", "gpu-node-1"),
            ("enumerator", "cgroup"),
            ("restrict_to_node", "true"),
        ])
        .unwrap();
        assert_eq!(config.enumerator, EnumeratorKind::Cgroup);
    }

    #[test]
    fn test_unknown_enumerator_rejected() {
        assert!(from_pairs(&[("enumerator", "nsenter")]).is_err());
    }
}
