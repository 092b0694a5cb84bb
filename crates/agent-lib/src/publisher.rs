//! Per-pod GPU memory gauges
//!
//! Publishes attributed usage as two gauge families labeled `(pid, pod)`
//! and removes every series that was not refreshed in the current cycle.

use crate::models::{AttributedUsage, SeriesKey};
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Used GPU memory in bytes
pub const MEMORY_USED_METRIC: &str = "pod_gpu_memory_usage";
/// GPU memory used as a percentage of the device total
pub const MEMORY_PERCENT_METRIC: &str = "pod_gpu_memory_perc_usage";

const SERIES_LABELS: &[&str] = &["pid", "pod"];

/// Value published under one series key
#[derive(Debug, Clone, Copy, PartialEq)]
struct SeriesValue {
    used_bytes: u64,
    percent: Option<f64>,
}

/// Counts from one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Series set in this cycle
    pub published: usize,
    /// Series removed because they were not refreshed
    pub removed: usize,
}

/// Collapse records into one value per series key
///
/// A process using several devices gets its bytes summed; its percentage is
/// taken over the combined total of the devices that reported one.
fn aggregate(records: &[AttributedUsage]) -> BTreeMap<SeriesKey, SeriesValue> {
    // key -> (used, used on devices with a known total, known total)
    let mut sums: BTreeMap<SeriesKey, (u64, u64, u64)> = BTreeMap::new();

    for record in records {
        let entry = sums.entry(record.series_key()).or_default();
        entry.0 = entry.0.saturating_add(record.used_memory_bytes);
        if record.device_total_bytes > 0 {
            entry.1 = entry.1.saturating_add(record.used_memory_bytes);
            entry.2 = entry.2.saturating_add(record.device_total_bytes);
        }
    }

    sums.into_iter()
        .map(|(key, (used, used_known, total_known))| {
            let percent = (total_known > 0).then(|| used_known as f64 / total_known as f64 * 100.0);
            (
                key,
                SeriesValue {
                    used_bytes: used,
                    percent,
                },
            )
        })
        .collect()
}

/// Publishes attributed usage into a Prometheus registry
pub struct MetricsPublisher {
    used_bytes: GaugeVec,
    percent_used: GaugeVec,
    /// Series live in `used_bytes` after the last publish
    published_used: HashSet<SeriesKey>,
    /// Series live in `percent_used` after the last publish
    published_percent: HashSet<SeriesKey>,
}

impl MetricsPublisher {
    /// Register both gauge families in `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let used_bytes = GaugeVec::new(
            Opts::new(MEMORY_USED_METRIC, "GPU memory used by Kubernetes Pod"),
            SERIES_LABELS,
        )?;
        let percent_used = GaugeVec::new(
            Opts::new(
                MEMORY_PERCENT_METRIC,
                "GPU memory in percentage used by Kubernetes Pod",
            ),
            SERIES_LABELS,
        )?;

        registry.register(Box::new(used_bytes.clone()))?;
        registry.register(Box::new(percent_used.clone()))?;

        Ok(Self {
            used_bytes,
            percent_used,
            published_used: HashSet::new(),
            published_percent: HashSet::new(),
        })
    }

    /// Replace the published series with `records`
    ///
    /// Series published by the previous call and absent from `records` are
    /// removed from both gauges. An empty slice clears everything.
    pub fn publish(&mut self, records: &[AttributedUsage]) -> PublishSummary {
        let values = aggregate(records);

        let mut live_used = HashSet::with_capacity(values.len());
        let mut live_percent = HashSet::with_capacity(values.len());

        for (key, value) in &values {
            self.used_bytes
                .with_label_values(&key.labels())
                .set(value.used_bytes as f64);
            live_used.insert(key.clone());

            if let Some(percent) = value.percent {
                self.percent_used
                    .with_label_values(&key.labels())
                    .set(percent);
                live_percent.insert(key.clone());
            }
        }

        let removed_used = Self::remove_stale(&self.used_bytes, &self.published_used, &live_used);
        Self::remove_stale(&self.percent_used, &self.published_percent, &live_percent);

        self.published_used = live_used;
        self.published_percent = live_percent;

        PublishSummary {
            published: values.len(),
            removed: removed_used,
        }
    }

    fn remove_stale(
        gauge: &GaugeVec,
        previous: &HashSet<SeriesKey>,
        live: &HashSet<SeriesKey>,
    ) -> usize {
        let mut removed = 0;
        for key in previous.difference(live) {
            match gauge.remove_label_values(&key.labels()) {
                Ok(()) => removed += 1,
                Err(e) => debug!(pid = %key.pid, pod = %key.pod, error = %e, "Series already gone"),
            }
        }
        removed
    }

    /// Number of series currently live in the used-bytes gauge
    pub fn published_series(&self) -> usize {
        self.published_used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Pid, PodKey};
    use prometheus::proto::MetricFamily;

    fn record(pid: u32, pod: &str, device: u32, used: u64, total: u64) -> AttributedUsage {
        AttributedUsage {
            pid: Pid(pid),
            pod: PodKey::new("default", pod),
            device_index: device,
            used_memory_bytes: used,
            device_total_bytes: total,
            percent_of_device_total: (total > 0).then(|| used as f64 / total as f64 * 100.0),
        }
    }

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
        families.iter().find(|f| f.get_name() == name)
    }

    /// (pid, pod) -> value for one gauge family
    fn series(registry: &Registry, name: &str) -> BTreeMap<(String, String), f64> {
        let families = registry.gather();
        let Some(family) = family(&families, name) else {
            return BTreeMap::new();
        };

        family
            .get_metric()
            .iter()
            .map(|metric| {
                let label = |wanted: &str| {
                    metric
                        .get_label()
                        .iter()
                        .find(|l| l.get_name() == wanted)
                        .map(|l| l.get_value().to_string())
                        .unwrap_or_default()
                };
                ((label("pid"), label("pod")), metric.get_gauge().get_value())
            })
            .collect()
    }

    fn key(pid: &str, pod: &str) -> (String, String) {
        (pid.to_string(), format!("default/{pod}"))
    }

    #[test]
    fn test_publish_sets_both_gauges() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        let summary = publisher.publish(&[
            record(5, "a", 0, 250, 1000),
            record(6, "b", 0, 100, 1000),
        ]);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.removed, 0);

        let used = series(&registry, MEMORY_USED_METRIC);
        assert_eq!(used.get(&key("5", "a")), Some(&250.0));
        assert_eq!(used.get(&key("6", "b")), Some(&100.0));

        let percent = series(&registry, MEMORY_PERCENT_METRIC);
        assert_eq!(percent.get(&key("5", "a")), Some(&25.0));
        assert_eq!(percent.get(&key("6", "b")), Some(&10.0));
    }

    #[test]
    fn test_absent_pod_series_are_removed() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        publisher.publish(&[record(5, "podA", 0, 250, 1000), record(6, "podB", 0, 100, 1000)]);
        let summary = publisher.publish(&[record(6, "podB", 0, 120, 1000)]);

        assert_eq!(summary.removed, 1);
        let used = series(&registry, MEMORY_USED_METRIC);
        assert_eq!(used.len(), 1);
        assert!(!used.contains_key(&key("5", "podA")));
        assert_eq!(used.get(&key("6", "podB")), Some(&120.0));

        let percent = series(&registry, MEMORY_PERCENT_METRIC);
        assert!(!percent.contains_key(&key("5", "podA")));
        assert_eq!(percent.get(&key("6", "podB")), Some(&12.0));
    }

    #[test]
    fn test_empty_publish_clears_everything() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        publisher.publish(&[record(5, "a", 0, 250, 1000)]);
        let summary = publisher.publish(&[]);

        assert_eq!(summary, PublishSummary { published: 0, removed: 1 });
        assert!(series(&registry, MEMORY_USED_METRIC).is_empty());
        assert!(series(&registry, MEMORY_PERCENT_METRIC).is_empty());
        assert_eq!(publisher.published_series(), 0);
    }

    #[test]
    fn test_empty_publish_on_fresh_publisher() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        assert_eq!(publisher.publish(&[]), PublishSummary::default());
    }

    #[test]
    fn test_pid_moving_between_pods_replaces_series() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        publisher.publish(&[record(42, "old", 0, 10, 100)]);
        publisher.publish(&[record(42, "new", 0, 20, 100)]);

        let used = series(&registry, MEMORY_USED_METRIC);
        assert_eq!(used.len(), 1);
        assert_eq!(used.get(&key("42", "new")), Some(&20.0));
    }

    #[test]
    fn test_zero_capacity_drops_percent_series_only() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        publisher.publish(&[record(1, "a", 0, 50, 100)]);
        publisher.publish(&[record(1, "a", 0, 60, 0)]);

        assert_eq!(
            series(&registry, MEMORY_USED_METRIC).get(&key("1", "a")),
            Some(&60.0)
        );
        assert!(series(&registry, MEMORY_PERCENT_METRIC).is_empty());
    }

    #[test]
    fn test_multi_device_process_is_aggregated() {
        let registry = Registry::new();
        let mut publisher = MetricsPublisher::new(&registry).unwrap();

        let summary = publisher.publish(&[
            record(1, "a", 0, 100, 1000),
            record(1, "a", 1, 400, 1000),
        ]);
        assert_eq!(summary.published, 1);

        assert_eq!(
            series(&registry, MEMORY_USED_METRIC).get(&key("1", "a")),
            Some(&500.0)
        );
        assert_eq!(
            series(&registry, MEMORY_PERCENT_METRIC).get(&key("1", "a")),
            Some(&25.0)
        );
    }

    #[test]
    fn test_registering_twice_fails() {
        let registry = Registry::new();
        let _first = MetricsPublisher::new(&registry).unwrap();
        assert!(MetricsPublisher::new(&registry).is_err());
    }
}
