//! Process enumeration from the cgroup filesystem
//!
//! Finds the container's cgroup directory by runtime ID and reads its
//! `cgroup.procs`. PIDs read this way are in the host PID namespace, the
//! same namespace the GPU driver reports in.
//!
//! Supported layouts:
//! - cgroup v2: `kubepods.slice/.../cri-containerd-<id>.scope`, `crio-<id>.scope`,
//!   `docker-<id>.scope`, or cgroupfs-driver `kubepods/.../<id>`
//! - cgroup v1: the same names under the `memory` controller hierarchy

use super::{parse_pid_list, ProcessEnumerator};
use crate::error::{AgentError, AgentResult};
use crate::models::{ContainerTarget, Pid};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

/// Detect which cgroup version is available on the system
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    // cgroup v2 unified hierarchy
    let v2_controllers = cgroup_root.join("cgroup.controllers");
    if fs::metadata(&v2_controllers).await.is_ok() {
        return CgroupVersion::V2;
    }

    // cgroup v1 controllers
    let v1_memory = cgroup_root.join("memory");
    let v1_cpuacct = cgroup_root.join("cpuacct");
    if fs::metadata(&v1_memory).await.is_ok() && fs::metadata(&v1_cpuacct).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

fn is_container_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// Extract a container ID from a cgroup path or directory name
///
/// Handles various container runtime formats:
/// - containerd: `cri-containerd-<id>.scope`
/// - CRI-O: `crio-<id>.scope` or `crio-<id>`
/// - Docker with systemd: `docker-<id>.scope`
/// - cgroupfs driver: plain 64-char hex ID
pub fn extract_container_id(cgroup_path: &str) -> Option<String> {
    for part in cgroup_path.split('/').rev() {
        let name = part.strip_suffix(".scope").unwrap_or(part);

        for prefix in ["cri-containerd-", "crio-", "docker-"] {
            if let Some(id) = name.strip_prefix(prefix) {
                if is_container_id(id) {
                    return Some(id.to_string());
                }
            }
        }

        if is_container_id(name) {
            return Some(name.to_string());
        }
    }

    None
}

/// Enumerates container processes from `cgroup.procs`
///
/// Only containers on the local node have a cgroup here, so pods must be
/// listed for this node alone.
pub struct CgroupEnumerator {
    cgroup_root: PathBuf,
    version: CgroupVersion,
    /// container_id -> cgroup directory
    index: RwLock<HashMap<String, PathBuf>>,
    /// Set at cycle start; the first miss afterwards rebuilds the index
    stale: AtomicBool,
    rebuilds: AtomicU64,
}

impl CgroupEnumerator {
    pub fn new(cgroup_root: impl Into<PathBuf>, version: CgroupVersion) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            version,
            index: RwLock::new(HashMap::new()),
            stale: AtomicBool::new(true),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Create an enumerator for the cgroup version found under `cgroup_root`
    pub async fn detect(cgroup_root: &Path) -> Self {
        let version = detect_cgroup_version(cgroup_root).await;
        if version == CgroupVersion::Unknown {
            tracing::warn!(
                cgroup_root = %cgroup_root.display(),
                "Could not detect cgroup version, defaulting to v2 layout"
            );
        }
        Self::new(cgroup_root, version)
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Number of full cgroup tree scans so far
    pub fn index_rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Look `id` up after a cache miss
    ///
    /// The tree is rescanned only if no scan happened since the cycle began.
    /// Concurrent misses wait on the write lock and reuse that one scan.
    async fn lookup_after_miss(&self, id: &str) -> Option<PathBuf> {
        let mut index = self.index.write().await;

        if self.stale.swap(false, Ordering::AcqRel) {
            *index = self.build_index().await;
            self.rebuilds.fetch_add(1, Ordering::Relaxed);
        }

        index.get(id).cloned()
    }

    /// Directories that may contain pod cgroups
    fn search_roots(&self) -> Vec<PathBuf> {
        let base = match self.version {
            CgroupVersion::V1 => self.cgroup_root.join("memory"),
            CgroupVersion::V2 | CgroupVersion::Unknown => self.cgroup_root.clone(),
        };

        ["kubepods.slice", "kubepods", "system.slice", "docker"]
            .iter()
            .map(|dir| base.join(dir))
            .collect()
    }

    /// Scan every search root and map container IDs to cgroup directories
    async fn build_index(&self) -> HashMap<String, PathBuf> {
        let mut index = HashMap::new();

        for root in self.search_roots() {
            if fs::metadata(&root).await.is_err() {
                continue;
            }
            if let Err(e) = Self::scan_cgroup_dir(&root, &mut index).await {
                debug!(path = %root.display(), error = %e, "Failed to scan cgroup directory");
            }
        }

        debug!(containers = index.len(), "Rebuilt container cgroup index");
        index
    }

    /// Walk a cgroup directory tree looking for container cgroups
    async fn scan_cgroup_dir(root: &Path, index: &mut HashMap<String, PathBuf>) -> Result<()> {
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // the root must be readable, subtrees may vanish mid-scan
                Err(e) if dir == root => return Err(e.into()),
                Err(_) => continue,
            };

            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let entry_path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();

                if let Some(container_id) = extract_container_id(&name) {
                    if fs::metadata(entry_path.join("cgroup.procs")).await.is_ok() {
                        index.insert(container_id, entry_path.clone());
                    }
                }

                pending.push(entry_path);
            }
        }

        Ok(())
    }

    async fn read_procs(cgroup_dir: &Path) -> Result<String> {
        let procs = cgroup_dir.join("cgroup.procs");
        fs::read_to_string(&procs)
            .await
            .with_context(|| format!("Failed to read {}", procs.display()))
    }
}

#[async_trait]
impl ProcessEnumerator for CgroupEnumerator {
    async fn enumerate(&self, target: &ContainerTarget) -> AgentResult<Vec<Pid>> {
        let id = target.container_id.as_str();

        let cached = self.index.read().await.get(id).cloned();
        if let Some(dir) = &cached {
            if let Ok(content) = Self::read_procs(dir).await {
                return Ok(parse_pid_list(&target.container_id, &content));
            }
            debug!(container_id = %id, "Cached cgroup path is gone");
        }

        let dir = self
            .lookup_after_miss(id)
            .await
            .ok_or_else(|| AgentError::Enumeration {
                container_id: id.to_string(),
                message: format!("no cgroup found under {}", self.cgroup_root.display()),
            })?;

        let content = Self::read_procs(&dir)
            .await
            .map_err(|e| AgentError::Enumeration {
                container_id: id.to_string(),
                message: format!("{e:#}"),
            })?;

        Ok(parse_pid_list(&target.container_id, &content))
    }

    async fn begin_cycle(&self) {
        self.stale.store(true, Ordering::Release);
    }
}
