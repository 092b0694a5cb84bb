//! Observability infrastructure for the GPU attribution agent
//!
//! Provides:
//! - Prometheus self-metrics (cycle latency, pods listed, attribution counts, errors)
//! - Structured JSON logging with tracing

use crate::attribution::PidConflict;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::{info, warn};

/// Histogram buckets for refresh cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Agent self-metrics, registered in the same registry as the pod gauges
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    cycle_duration_seconds: Histogram,
    pods_listed: IntGauge,
    attributed_records: IntGauge,
    unmatched_processes: IntGauge,
    pid_conflicts: IntCounter,
    cycles_skipped: IntCounter,
    errors: IntCounterVec,
}

impl AgentMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            cycle_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "pod_gpu_agent_cycle_duration_seconds",
                    "Time spent in one list-enumerate-query-join-publish cycle",
                )
                .buckets(CYCLE_BUCKETS.to_vec()),
            )?,
            pods_listed: IntGauge::new(
                "pod_gpu_agent_pods_listed",
                "Number of pods returned by the cluster API in the last cycle",
            )?,
            attributed_records: IntGauge::new(
                "pod_gpu_agent_attributed_records",
                "Number of (pid, device) records attributed to a pod in the last cycle",
            )?,
            unmatched_processes: IntGauge::new(
                "pod_gpu_agent_unmatched_processes",
                "Number of GPU processes without an owning pod in the last cycle",
            )?,
            pid_conflicts: IntCounter::new(
                "pod_gpu_agent_pid_conflicts_total",
                "Total number of PIDs claimed by more than one pod",
            )?,
            cycles_skipped: IntCounter::new(
                "pod_gpu_agent_cycles_skipped_total",
                "Total number of refresh cycles skipped without publishing",
            )?,
            errors: IntCounterVec::new(
                Opts::new(
                    "pod_gpu_agent_errors_total",
                    "Total number of collaborator errors by kind",
                ),
                &["kind"],
            )?,
        };

        registry.register(Box::new(metrics.cycle_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.pods_listed.clone()))?;
        registry.register(Box::new(metrics.attributed_records.clone()))?;
        registry.register(Box::new(metrics.unmatched_processes.clone()))?;
        registry.register(Box::new(metrics.pid_conflicts.clone()))?;
        registry.register(Box::new(metrics.cycles_skipped.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;

        Ok(metrics)
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.cycle_duration_seconds.observe(duration_secs);
    }

    pub fn set_pods_listed(&self, count: usize) {
        self.pods_listed.set(count as i64);
    }

    pub fn set_attribution(&self, records: usize, unmatched: usize) {
        self.attributed_records.set(records as i64);
        self.unmatched_processes.set(unmatched as i64);
    }

    pub fn inc_pid_conflicts(&self, count: usize) {
        self.pid_conflicts.inc_by(count as u64);
    }

    pub fn inc_cycles_skipped(&self) {
        self.cycles_skipped.inc();
    }

    pub fn inc_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for cycle outcomes, tie-breaks
/// and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, refresh_interval_secs: u64) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            refresh_interval_secs = refresh_interval_secs,
            "Pod GPU agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Pod GPU agent shutting down"
        );
    }

    /// Log the pod count of a cycle
    pub fn log_pods_listed(&self, cycle: u64, pods: usize) {
        info!(
            event = "pods_listed",
            node = %self.node_name,
            cycle = cycle,
            pods = pods,
            "There are {} pods in the cluster",
            pods
        );
    }

    /// Log a tie-break between two pods claiming the same PID
    pub fn log_pid_conflict(&self, conflict: &PidConflict) {
        warn!(
            event = "pid_conflict",
            node = %self.node_name,
            pid = %conflict.pid,
            previous_pod = %conflict.previous,
            winner_pod = %conflict.winner,
            "PID claimed by two pods, last pod in key order wins"
        );
    }

    /// Log a device that reported zero total memory
    pub fn log_zero_capacity_device(&self, device_index: u32) {
        warn!(
            event = "zero_capacity_device",
            node = %self.node_name,
            device_index = device_index,
            "Device reports zero total memory, percentage metric skipped"
        );
    }

    /// Log a completed cycle
    pub fn log_cycle_completed(
        &self,
        cycle: u64,
        records: usize,
        unmatched: usize,
        degraded_items: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "cycle_completed",
            node = %self.node_name,
            cycle = cycle,
            records = records,
            unmatched = unmatched,
            degraded_items = degraded_items,
            elapsed_ms = elapsed_ms,
            "Refresh cycle complete"
        );
    }

    /// Log a skipped cycle
    pub fn log_cycle_skipped(&self, cycle: u64, reason: &str) {
        warn!(
            event = "cycle_skipped",
            node = %self.node_name,
            cycle = cycle,
            reason = %reason,
            "Refresh cycle skipped, retrying on next tick"
        );
    }
}
