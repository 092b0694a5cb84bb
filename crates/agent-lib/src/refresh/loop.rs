//! Refresh loop
//!
//! Runs one list-enumerate-query-join-publish cycle per tick. Cycles never
//! overlap: a cycle that overruns the interval delays the next tick.

use crate::attribution;
use crate::enumerator::ProcessEnumerator;
use crate::error::{AgentError, AgentResult};
use crate::health::{components, HealthRegistry};
use crate::inventory::PodLister;
use crate::models::{ContainerTarget, DeviceUsage, Pid, Pod, PodKey, PodProcesses};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::publisher::MetricsPublisher;
use crate::telemetry::{DeviceHandle, DeviceTelemetry};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use prometheus::Registry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the refresh loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between cycle starts (default: 30 seconds)
    pub interval: Duration,
    /// Deadline for each external call (default: 10 seconds)
    pub call_timeout: Duration,
    /// Containers enumerated concurrently within one cycle
    pub enumeration_concurrency: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            enumeration_concurrency: 8,
        }
    }
}

/// Whether a cycle is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefreshState {
    Idle = 0,
    Running = 1,
}

/// Read side of the loop state, usable while `run` owns the loop
#[derive(Debug, Clone)]
pub struct RefreshStateHandle(Arc<AtomicU8>);

impl RefreshStateHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RefreshState::Idle as u8)))
    }

    pub fn get(&self) -> RefreshState {
        match self.0.load(Ordering::Acquire) {
            1 => RefreshState::Running,
            _ => RefreshState::Idle,
        }
    }

    fn set(&self, state: RefreshState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Counts from one published cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pods: usize,
    pub containers: usize,
    pub failed_containers: usize,
    pub devices: usize,
    pub failed_devices: usize,
    pub records: usize,
    pub unmatched: usize,
    pub conflicts: usize,
    pub removed_series: usize,
}

impl CycleReport {
    /// Items left out of this cycle because their query failed
    pub fn degraded_items(&self) -> usize {
        self.failed_containers + self.failed_devices
    }
}

/// How a non-fatal cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Metrics were published, possibly from partial data
    Published(CycleReport),
    /// Nothing was published, the cycle is retried on the next tick
    Skipped { reason: String },
}

/// Periodic attribution of GPU memory to pods
pub struct RefreshLoop {
    pods: Arc<dyn PodLister>,
    enumerator: Arc<dyn ProcessEnumerator>,
    telemetry: Arc<dyn DeviceTelemetry>,
    publisher: MetricsPublisher,
    metrics: AgentMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: RefreshConfig,
    state: RefreshStateHandle,
    cycle: u64,
    /// Zero-capacity devices already reported
    warned_zero_capacity: HashSet<u32>,
}

impl RefreshLoop {
    /// Run cycles until shutdown or a fatal error
    ///
    /// Returns the fatal error, if any; the caller decides how to exit.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> AgentResult<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            call_timeout_secs = self.config.call_timeout.as_secs(),
            "Starting refresh loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down refresh loop");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(
                            error = %e,
                            cycle = self.cycle,
                            "Fatal error, stopping refresh loop"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state.get()
    }

    /// Handle that keeps reporting the state after the loop moves into `run`
    pub fn state_handle(&self) -> RefreshStateHandle {
        self.state.clone()
    }

    /// Number of cycles started so far
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Run one cycle
    ///
    /// Only fatal errors are returned; every other failure is logged and
    /// reflected in the outcome.
    pub async fn run_cycle(&mut self) -> AgentResult<CycleOutcome> {
        self.state.set(RefreshState::Running);
        self.cycle += 1;
        let start = Instant::now();

        let result = self.execute_cycle().await;

        self.state.set(RefreshState::Idle);
        let elapsed = start.elapsed();
        self.metrics.observe_cycle_duration(elapsed.as_secs_f64());

        match &result {
            Ok(CycleOutcome::Published(report)) => {
                self.logger.log_cycle_completed(
                    self.cycle,
                    report.records,
                    report.unmatched,
                    report.degraded_items(),
                    elapsed.as_millis(),
                );
                self.health.mark_cycle_completed().await;
            }
            Ok(CycleOutcome::Skipped { reason }) => {
                self.metrics.inc_cycles_skipped();
                self.logger.log_cycle_skipped(self.cycle, reason);
            }
            Err(e) => {
                self.metrics.inc_error(e.kind());
                self.health
                    .set_unhealthy(components::DRIVER, e.to_string())
                    .await;
            }
        }

        result
    }

    async fn execute_cycle(&mut self) -> AgentResult<CycleOutcome> {
        let pods = match self.list_pods().await {
            Ok(pods) => pods,
            Err(e) => return self.skip(components::CLUSTER, e).await,
        };
        self.health.set_healthy(components::CLUSTER).await;
        self.metrics.set_pods_listed(pods.len());
        self.logger.log_pods_listed(self.cycle, pods.len());

        let (pod_processes, containers, failed_containers) = self.enumerate_pods(&pods).await;

        let devices = match self.list_devices().await {
            Ok(devices) => devices,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.skip(components::DRIVER, e).await,
        };
        let device_count = devices.len();
        let (usages, failed_devices) = self.query_devices(devices).await?;

        let report = attribution::run(&pod_processes, &usages);

        for conflict in &report.conflicts {
            self.logger.log_pid_conflict(conflict);
        }
        self.metrics.inc_pid_conflicts(report.conflicts.len());

        for &index in &report.zero_capacity_devices {
            if self.warned_zero_capacity.insert(index) {
                self.logger.log_zero_capacity_device(index);
            }
        }

        if report.unmatched > 0 {
            debug!(
                unmatched = report.unmatched,
                owned_pids = report.owned_pids,
                "GPU processes without an owning pod"
            );
        }

        let summary = self.publisher.publish(&report.records);
        self.health.set_healthy(components::PUBLISHER).await;
        self.metrics
            .set_attribution(report.records.len(), report.unmatched);

        Ok(CycleOutcome::Published(CycleReport {
            pods: pods.len(),
            containers,
            failed_containers,
            devices: device_count,
            failed_devices,
            records: report.records.len(),
            unmatched: report.unmatched,
            conflicts: report.conflicts.len(),
            removed_series: summary.removed,
        }))
    }

    /// Abandon the cycle without publishing
    async fn skip(&self, component: &str, e: AgentError) -> AgentResult<CycleOutcome> {
        self.metrics.inc_error(e.kind());
        self.health.set_degraded(component, e.to_string()).await;
        Ok(CycleOutcome::Skipped {
            reason: e.to_string(),
        })
    }

    async fn list_pods(&self) -> AgentResult<Vec<Pod>> {
        let deadline = self.config.call_timeout;
        match timeout(deadline, self.pods.list_pods()).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::ClusterUnreachable(format!(
                "pod listing timed out after {deadline:?}"
            ))),
        }
    }

    async fn list_devices(&self) -> AgentResult<Vec<DeviceHandle>> {
        let deadline = self.config.call_timeout;
        match timeout(deadline, self.telemetry.list_devices()).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::DeviceListTimeout(deadline)),
        }
    }

    /// Enumerate every container of every pod, failures are per container
    ///
    /// Returns the per-pod PID sets, the container count and the number of
    /// containers whose enumeration failed.
    async fn enumerate_pods(&self, pods: &[Pod]) -> (Vec<PodProcesses>, usize, usize) {
        let targets: Vec<ContainerTarget> = pods
            .iter()
            .flat_map(|pod| {
                pod.containers.iter().map(|container| ContainerTarget {
                    pod: pod.key.clone(),
                    container_name: container.name.clone(),
                    container_id: container.id.clone(),
                })
            })
            .collect();
        let container_count = targets.len();

        self.enumerator.begin_cycle().await;

        let enumerator = Arc::clone(&self.enumerator);
        let deadline = self.config.call_timeout;
        let results: Vec<(ContainerTarget, AgentResult<Vec<Pid>>)> = stream::iter(targets)
            .map(|target| {
                let enumerator = Arc::clone(&enumerator);
                async move {
                    let operation = format!("process enumeration of {}", target.container_id);
                    let result = bounded(deadline, operation, enumerator.enumerate(&target)).await;
                    (target, result)
                }
            })
            .buffer_unordered(self.config.enumeration_concurrency.max(1))
            .collect()
            .await;

        let mut by_pod: BTreeMap<PodKey, BTreeSet<Pid>> = pods
            .iter()
            .map(|pod| (pod.key.clone(), BTreeSet::new()))
            .collect();
        let mut failed = 0;

        for (target, result) in results {
            match result {
                Ok(pids) => {
                    by_pod.entry(target.pod).or_default().extend(pids);
                }
                Err(e) => {
                    failed += 1;
                    self.metrics.inc_error(e.kind());
                    warn!(
                        pod = %target.pod,
                        container = %target.container_name,
                        container_id = %target.container_id,
                        error = %e,
                        "Failed to get PIDs for container"
                    );
                }
            }
        }

        if failed > 0 {
            self.health
                .set_degraded(
                    components::ENUMERATOR,
                    format!("{failed} of {container_count} containers failed"),
                )
                .await;
        } else {
            self.health.set_healthy(components::ENUMERATOR).await;
        }

        let pod_processes = by_pod
            .into_iter()
            .map(|(pod, pids)| PodProcesses { pod, pids })
            .collect();

        (pod_processes, container_count, failed)
    }

    /// Query every device concurrently, failures are per device
    ///
    /// A driver-level failure on any device is fatal.
    async fn query_devices(
        &self,
        devices: Vec<DeviceHandle>,
    ) -> AgentResult<(Vec<DeviceUsage>, usize)> {
        let deadline = self.config.call_timeout;
        let results = futures::future::join_all(devices.into_iter().map(|device| {
            let telemetry = Arc::clone(&self.telemetry);
            async move {
                let operation = format!("usage query of device {}", device.index);
                (
                    device,
                    bounded(deadline, operation, telemetry.device_usage(device)).await,
                )
            }
        }))
        .await;

        let mut usages = Vec::with_capacity(results.len());
        let mut failed = 0;

        for (device, result) in results {
            match result {
                Ok(usage) => usages.push(usage),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failed += 1;
                    self.metrics.inc_error(e.kind());
                    warn!(
                        device_index = device.index,
                        error = %e,
                        "Failed to query device, excluding it from this cycle"
                    );
                }
            }
        }

        if failed > 0 {
            self.health
                .set_degraded(components::DRIVER, format!("{failed} devices failed"))
                .await;
        } else {
            self.health.set_healthy(components::DRIVER).await;
        }

        Ok((usages, failed))
    }
}

/// Bound an item-level call by `deadline`
async fn bounded<T>(
    deadline: Duration,
    operation: String,
    call: impl Future<Output = AgentResult<T>>,
) -> AgentResult<T> {
    match timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout {
            operation,
            elapsed: deadline,
        }),
    }
}

/// Builder for creating the refresh loop
pub struct RefreshLoopBuilder {
    pods: Option<Arc<dyn PodLister>>,
    enumerator: Option<Arc<dyn ProcessEnumerator>>,
    telemetry: Option<Arc<dyn DeviceTelemetry>>,
    registry: Option<Registry>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    config: RefreshConfig,
}

impl RefreshLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            pods: None,
            enumerator: None,
            telemetry: None,
            registry: None,
            health: None,
            logger: None,
            config: RefreshConfig::default(),
        }
    }

    /// Set the pod inventory lister
    pub fn pod_lister(mut self, pods: Arc<dyn PodLister>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Set the process enumerator
    pub fn enumerator(mut self, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    /// Set the device telemetry reader
    pub fn telemetry(mut self, telemetry: Arc<dyn DeviceTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Set the registry the gauges are published into
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the structured logger
    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set the refresh interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the per-call timeout
    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.config.call_timeout = call_timeout;
        self
    }

    /// Set how many containers are enumerated concurrently
    pub fn enumeration_concurrency(mut self, concurrency: usize) -> Self {
        self.config.enumeration_concurrency = concurrency;
        self
    }

    /// Build the refresh loop, registering its metrics
    pub fn build(self) -> Result<RefreshLoop> {
        let pods = self
            .pods
            .ok_or_else(|| anyhow::anyhow!("Pod lister is required"))?;
        let enumerator = self
            .enumerator
            .ok_or_else(|| anyhow::anyhow!("Process enumerator is required"))?;
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow::anyhow!("Device telemetry is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;

        let publisher = MetricsPublisher::new(&registry)?;
        let metrics = AgentMetrics::new(&registry)?;

        Ok(RefreshLoop {
            pods,
            enumerator,
            telemetry,
            publisher,
            metrics,
            health: self.health.unwrap_or_default(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            config: self.config,
            state: RefreshStateHandle::new(),
            cycle: 0,
            warned_zero_capacity: HashSet::new(),
        })
    }
}

impl Default for RefreshLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_config_default() {
        let config = RefreshConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.enumeration_concurrency, 8);
    }

    #[test]
    fn test_cycle_report_degraded_items() {
        let report = CycleReport {
            failed_containers: 2,
            failed_devices: 1,
            ..Default::default()
        };
        assert_eq!(report.degraded_items(), 3);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: AgentResult<()> = bounded(
            Duration::from_millis(10),
            "slow call".to_string(),
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        )
        .await;

        match result {
            Err(AgentError::Timeout { operation, .. }) => assert_eq!(operation, "slow call"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_state_handle_shares_state() {
        let handle = RefreshStateHandle::new();
        let observer = handle.clone();
        assert_eq!(observer.get(), RefreshState::Idle);

        handle.set(RefreshState::Running);
        assert_eq!(observer.get(), RefreshState::Running);

        handle.set(RefreshState::Idle);
        assert_eq!(observer.get(), RefreshState::Idle);
    }

    #[test]
    fn test_builder_missing_collaborators() {
        let result = RefreshLoopBuilder::new().registry(Registry::new()).build();
        assert!(result.is_err());
    }
}
