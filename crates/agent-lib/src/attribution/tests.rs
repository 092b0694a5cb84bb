//! Attribution engine tests

use super::*;
use crate::enumerator::parse_pid_list;
use crate::models::{ContainerId, Pid, PodKey, ProcessUsage};
use std::collections::BTreeSet;

fn pod(name: &str, pids: &[u32]) -> PodProcesses {
    PodProcesses {
        pod: PodKey::new("default", name),
        pids: pids.iter().copied().map(Pid).collect(),
    }
}

fn device(index: u32, total: u64, processes: &[(u32, u64)]) -> DeviceUsage {
    DeviceUsage {
        device_index: index,
        total_memory_bytes: total,
        processes: processes
            .iter()
            .map(|&(pid, used)| ProcessUsage {
                pid: Pid(pid),
                used_memory_bytes: used,
            })
            .collect(),
    }
}

/// Order-independent view of the records
fn as_set(records: &[AttributedUsage]) -> BTreeSet<(u32, Pid, String, u64)> {
    records
        .iter()
        .map(|r| (r.device_index, r.pid, r.pod.to_string(), r.used_memory_bytes))
        .collect()
}

#[test]
fn test_end_to_end_single_device() {
    let pods = vec![pod("a", &[5]), pod("b", &[6])];
    let devices = vec![device(0, 1000, &[(5, 250), (6, 100), (7, 50)])];

    let report = run(&pods, &devices);

    assert_eq!(report.records.len(), 2);
    assert_eq!(report.unmatched, 1);

    let a = &report.records[0];
    assert_eq!(a.pid, Pid(5));
    assert_eq!(a.pod, PodKey::new("default", "a"));
    assert_eq!(a.used_memory_bytes, 250);
    assert_eq!(a.percent_of_device_total, Some(25.0));

    let b = &report.records[1];
    assert_eq!(b.pid, Pid(6));
    assert_eq!(b.pod, PodKey::new("default", "b"));
    assert_eq!(b.used_memory_bytes, 100);
    assert_eq!(b.percent_of_device_total, Some(10.0));

    assert!(report.records.iter().all(|r| r.pid != Pid(7)));
}

#[test]
fn test_percent_matches_used_over_total() {
    let pods = vec![pod("a", &[1, 2, 3])];
    let devices = vec![device(
        0,
        17_179_869_184,
        &[(1, 1_073_741_824), (2, 3_000_000_001), (3, 1)],
    )];

    let report = run(&pods, &devices);

    for record in &report.records {
        let expected = record.used_memory_bytes as f64 / 17_179_869_184f64 * 100.0;
        let percent = record.percent_of_device_total.unwrap();
        assert!((percent - expected).abs() < 1e-9);
    }
}

#[test]
fn test_unowned_process_is_dropped_silently() {
    let pods = vec![pod("a", &[100])];
    let devices = vec![device(0, 1000, &[(200, 500)])];

    let report = run(&pods, &devices);

    assert!(report.records.is_empty());
    assert_eq!(report.unmatched, 1);
    assert!(report.conflicts.is_empty());
}

#[test]
fn test_matching_uses_pid_value_not_position() {
    // PID 1234 sits at index 1 of the enumerated output
    let container = ContainerId::normalize("containerd://c0ffee").unwrap();
    let pids = parse_pid_list(&container, "9999\n1234\n");
    let pods = vec![PodProcesses {
        pod: PodKey::new("default", "podA"),
        pids: pids.into_iter().collect(),
    }];

    let report = run(&pods, &[device(0, 10_000, &[(1234, 2048)])]);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].pid, Pid(1234));
    assert_eq!(report.records[0].pod, PodKey::new("default", "podA"));

    // A process whose PID equals a position must not match
    let report = run(&pods, &[device(0, 10_000, &[(1, 2048), (0, 64)])]);
    assert!(report.records.is_empty());
    assert_eq!(report.unmatched, 2);
}

#[test]
fn test_idempotent_on_identical_snapshots() {
    let pods = vec![pod("a", &[1, 2]), pod("b", &[3]), pod("c", &[4, 5])];
    let devices = vec![
        device(0, 4096, &[(1, 100), (3, 200), (9, 50)]),
        device(1, 8192, &[(2, 300), (5, 400)]),
    ];

    let first = run(&pods, &devices);
    let second = run(&pods, &devices);

    assert_eq!(as_set(&first.records), as_set(&second.records));
    assert_eq!(first, second);
}

#[test]
fn test_output_independent_of_input_order() {
    let pods = vec![pod("a", &[1, 2]), pod("b", &[3]), pod("c", &[4])];
    let devices = vec![
        device(0, 4096, &[(1, 100), (3, 200)]),
        device(1, 8192, &[(4, 300), (2, 400)]),
    ];

    let mut reversed_pods = pods.clone();
    reversed_pods.reverse();
    let mut reversed_devices = devices.clone();
    reversed_devices.reverse();

    let forward = run(&pods, &devices);
    let backward = run(&reversed_pods, &reversed_devices);

    assert_eq!(forward.records, backward.records);
}

#[test]
fn test_tie_break_is_deterministic() {
    let pods = vec![pod("podA", &[42]), pod("podB", &[42])];
    let devices = vec![device(0, 1000, &[(42, 10)])];

    let winners: BTreeSet<PodKey> = (0..20)
        .map(|_| run(&pods, &devices).records[0].pod.clone())
        .collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(
        winners.into_iter().next().unwrap(),
        PodKey::new("default", "podB")
    );
}

#[test]
fn test_tie_break_ignores_listing_order() {
    let listed = vec![pod("podB", &[42]), pod("podA", &[42])];
    let report = run(&listed, &[device(0, 1000, &[(42, 10)])]);

    assert_eq!(report.records[0].pod, PodKey::new("default", "podB"));
    assert_eq!(
        report.conflicts,
        vec![PidConflict {
            pid: Pid(42),
            previous: PodKey::new("default", "podA"),
            winner: PodKey::new("default", "podB"),
        }]
    );
}

#[test]
fn test_tie_break_orders_namespace_before_name() {
    let pods = vec![
        PodProcesses {
            pod: PodKey::new("zeta", "a"),
            pids: [Pid(7)].into_iter().collect(),
        },
        PodProcesses {
            pod: PodKey::new("alpha", "z"),
            pids: [Pid(7)].into_iter().collect(),
        },
    ];

    let ownership = OwnershipMap::build(&pods);
    assert_eq!(ownership.owner(Pid(7)), Some(&PodKey::new("zeta", "a")));
    assert_eq!(ownership.conflicts().len(), 1);
}

#[test]
fn test_same_pod_listed_twice_is_not_a_conflict() {
    let pods = vec![pod("a", &[1, 2]), pod("a", &[2, 3])];
    let ownership = OwnershipMap::build(&pods);

    assert_eq!(ownership.len(), 3);
    assert!(ownership.conflicts().is_empty());
}

#[test]
fn test_zero_capacity_device_has_no_percent() {
    let pods = vec![pod("a", &[1])];
    let devices = vec![device(3, 0, &[(1, 128)]), device(4, 0, &[])];

    let report = run(&pods, &devices);

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].used_memory_bytes, 128);
    assert_eq!(report.records[0].percent_of_device_total, None);
    assert_eq!(report.zero_capacity_devices, vec![3, 4]);
}

#[test]
fn test_process_on_multiple_devices_yields_one_record_per_device() {
    let pods = vec![pod("a", &[1])];
    let devices = vec![device(0, 1000, &[(1, 100)]), device(1, 2000, &[(1, 500)])];

    let report = run(&pods, &devices);

    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].device_index, 0);
    assert_eq!(report.records[0].percent_of_device_total, Some(10.0));
    assert_eq!(report.records[1].device_index, 1);
    assert_eq!(report.records[1].percent_of_device_total, Some(25.0));
}

#[test]
fn test_empty_inputs() {
    let report = run(&[], &[]);
    assert!(report.records.is_empty());
    assert_eq!(report.unmatched, 0);
    assert_eq!(report.owned_pids, 0);

    let report = run(&[], &[device(0, 1000, &[(1, 1)])]);
    assert!(report.records.is_empty());
    assert_eq!(report.unmatched, 1);
}
