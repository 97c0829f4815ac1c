//! Loop-level tests: the supervision cycle drives a cluster with a failed
//! server to a stable state while the Current simulator plays the servers.

use std::collections::{BTreeMap, BTreeSet};

use supervision::core::invariants::validate_invariants;
use supervision::core::jobs::all_jobs;
use supervision::core::snapshot::Snapshot;
use supervision::core::transaction::Precondition;
use supervision::core::types::{JobStatus, JobType};
use supervision::io::config::SupervisionConfig;
use supervision::io::memory_agency::InMemoryAgency;
use supervision::looping::{LoopOptions, LoopStop, run_loop};
use supervision::simulate::sync_current;
use supervision::supervision::run_cycle;
use supervision::test_support::{ClusterBuilder, now, plan_of, rng};

/// A FAILED, leading s1 and following s2; three healthy spares.
fn failover_cluster() -> InMemoryAgency {
    ClusterBuilder::new()
        .server("A", "FAILED")
        .servers(&["B", "C", "D"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B"])
        .shard("db", "c", "s2", &["B", "A"])
        .agency()
}

fn options(max_cycles: u32) -> LoopOptions {
    LoopOptions {
        max_cycles,
        simulate_current: true,
        pause: false,
    }
}

/// Plan-touching transactions per job id, read from the store's log.
fn plan_writes_by_job(agency: &InMemoryAgency) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entry in agency.log().expect("log") {
        let touches_plan = entry
            .transaction
            .operations()
            .any(|(path, _)| path.starts_with("/Plan/Collections/"));
        if !touches_plan {
            continue;
        }
        // The job a transaction belongs to is the one it requires to still
        // be in ToDo or Pending.
        let owners: BTreeSet<&str> = entry
            .transaction
            .preconditions()
            .filter(|(path, pre)| {
                **pre == Precondition::OldEmpty(false)
                    && (path.starts_with("/Target/ToDo/") || path.starts_with("/Target/Pending/"))
            })
            .filter_map(|(path, _)| path.rsplit('/').next())
            .collect();
        for owner in owners {
            *counts.entry(owner.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Failover, re-replication and cleanup converge to a quiescent cluster
/// while every job keeps exactly one home.
#[test]
fn failover_converges_and_keeps_invariants() {
    let agency = failover_cluster();
    let mut violations = Vec::new();

    let outcome = run_loop(
        &agency,
        &SupervisionConfig::default(),
        options(40),
        &mut rng(21),
        now,
        |cycle, _| {
            let root = agency.root().expect("root");
            for error in validate_invariants(&Snapshot::new(root)) {
                violations.push(format!("cycle {cycle}: {error}"));
            }
        },
    )
    .expect("loop");

    assert!(violations.is_empty(), "{violations:?}");
    assert_eq!(outcome.stop, LoopStop::Quiescent);
    assert_eq!(outcome.outstanding, 0);

    let root = agency.root().expect("root");
    for shard in ["s1", "s2"] {
        let plan = plan_of(&root, "db", "c", shard);
        assert_eq!(plan.len(), 2, "{shard}: {plan:?}");
        assert!(!plan.iter().any(|s| s.trim_start_matches('_') == "A"));
        assert_ne!(plan[0], "A");
    }
    let jobs = all_jobs(&Snapshot::new(root.clone()));
    assert!(
        jobs.iter()
            .any(|(status, doc)| doc.job_type == JobType::FailedLeader
                && *status == JobStatus::Finished)
    );
    assert!(jobs.iter().all(|(status, _)| status.is_terminal()));
    // A is still FAILED, so its bookkeeping entry stays.
    assert!(root["Target"]["FailedServers"].get("A").is_some());
}

/// No job writes Plan more often than its kind has phases.
#[test]
fn jobs_never_double_apply_plan_changes() {
    let agency = failover_cluster();
    run_loop(
        &agency,
        &SupervisionConfig::default(),
        options(40),
        &mut rng(21),
        now,
        |_, _| {},
    )
    .expect("loop");

    let root = agency.root().expect("root");
    let snapshot = Snapshot::new(root);
    for (job_id, writes) in plan_writes_by_job(&agency) {
        let Some((_, doc)) = supervision::core::jobs::find_job(&snapshot, &job_id) else {
            continue;
        };
        let bound = match doc.job_type {
            JobType::AddFollower | JobType::RemoveFollower | JobType::FailedLeader => 1,
            JobType::FailedServer => 1,
            JobType::MoveShard => 4,
            JobType::CleanOutServer => 0,
        };
        assert!(
            writes <= bound,
            "job {job_id} ({}) wrote Plan {writes} times",
            doc.job_type
        );
    }
}

/// Cycles against an unavailable store fail without writing; once the
/// store is back the next cycles pick up the work.
#[test]
fn unavailable_store_defers_work() {
    let agency = failover_cluster();
    let config = SupervisionConfig::default();
    let mut rng = rng(21);

    agency.set_available(false).expect("toggle");
    assert!(run_cycle(&agency, &config, now(), &mut rng).is_err());
    assert!(agency.log().expect("log").is_empty());

    agency.set_available(true).expect("toggle");
    let report = run_cycle(&agency, &config, now(), &mut rng).expect("cycle");
    assert_eq!(report.created, vec!["1".to_string()]);
    let root = agency.root().expect("root");
    assert_eq!(root["Target"]["ToDo"]["1"]["type"], "failedServer");
}

/// Repeated cycles never create a second failover job for the same server.
#[test]
fn failover_job_is_created_once() {
    let agency = failover_cluster();
    let config = SupervisionConfig::default();
    let mut rng = rng(1);

    run_cycle(&agency, &config, now(), &mut rng).expect("first");
    run_cycle(&agency, &config, now(), &mut rng).expect("second");

    let root = agency.root().expect("root");
    let failovers = all_jobs(&Snapshot::new(root.clone()))
        .into_iter()
        .filter(|(_, doc)| doc.job_type == JobType::FailedServer)
        .count();
    assert_eq!(failovers, 1);
    assert_eq!(root["Target"]["LatestJobId"], serde_json::json!(2));
}

/// The simulator alone never changes Plan.
#[test]
fn simulator_only_touches_current() {
    let agency = failover_cluster();
    let plan_before = plan_of(&agency.root().expect("root"), "db", "c", "s2");
    sync_current(&agency).expect("sync");
    let root = agency.root().expect("root");
    assert_eq!(plan_of(&root, "db", "c", "s2"), plan_before);
    assert_eq!(
        root["Current"]["Collections"]["db"]["c"]["s2"]["servers"],
        serde_json::json!(["B"])
    );
}

/// A recovered server's FailedServers entry is removed by the cycle's
/// cleanup, exactly once.
#[test]
fn recovered_server_is_dropped_from_failed_servers() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B"])
        .collection("db", "c", 1)
        .shard("db", "c", "s1", &["B"])
        .set("/Target/FailedServers/A", serde_json::json!([]))
        .agency();
    let config = SupervisionConfig::default();
    let mut rng = rng(4);

    let report = run_cycle(&agency, &config, now(), &mut rng).expect("cycle");

    assert_eq!(report.cleanups, 1);
    let root = agency.root().expect("root");
    assert!(root["Target"]["FailedServers"].get("A").is_none());
    let again = run_cycle(&agency, &config, now(), &mut rng).expect("second cycle");
    assert_eq!(again.cleanups, 0);
}
