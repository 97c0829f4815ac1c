//! AddFollower and RemoveFollower tests: single-transaction replica count
//! repairs, driven directly and through the supervision cycle.

use std::collections::BTreeSet;

use supervision::core::snapshot::Snapshot;
use supervision::core::types::{JobStatus, JobType, StepOutcome};
use supervision::io::agent::AgentInterface;
use supervision::io::config::SupervisionConfig;
use supervision::io::memory_agency::InMemoryAgency;
use supervision::job::Job;
use supervision::supervision::run_cycle;
use supervision::test_support::{ClusterBuilder, now, plan_of, rng, shard_job_doc, status_of};

fn snapshot(agency: &InMemoryAgency) -> Snapshot {
    agency.snapshot().expect("snapshot")
}

fn start(agency: &InMemoryAgency, id: &str) -> StepOutcome {
    let mut job = Job::load(agency, &snapshot(agency), id).expect("job");
    job.start(&snapshot(agency), now(), &mut rng(7)).expect("start")
}

/// Two distinct healthy servers join a single-replica shard in one write.
#[test]
fn add_follower_fills_replication_factor_in_one_transaction() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B", "C", "D"])
        .collection("db", "c", 3)
        .shard("db", "c", "s1", &["A"])
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::AddFollower, "db", "c", "s1"),
        )
        .agency();

    let outcome = start(&agency, "1");

    assert_eq!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Finished,
            reason: None
        }
    );
    let root = agency.root().expect("root");
    let plan = plan_of(&root, "db", "c", "s1");
    assert_eq!(plan.len(), 3);
    assert_eq!(plan[0], "A");
    let distinct: BTreeSet<&String> = plan.iter().collect();
    assert_eq!(distinct.len(), 3);
    assert_eq!(agency.log().expect("log").len(), 1);
}

/// Replicas already matching the factor finish the job without a change.
#[test]
fn add_follower_on_satisfied_shard_is_a_noop() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B"])
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::AddFollower, "db", "c", "s1"),
        )
        .agency();

    let outcome = start(&agency, "1");

    assert_eq!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Finished,
            reason: Some("replication factor already satisfied".to_string())
        }
    );
    assert_eq!(
        plan_of(&agency.root().expect("root"), "db", "c", "s1"),
        vec!["A", "B"]
    );
}

/// Without a free healthy server the job waits in ToDo.
#[test]
fn add_follower_waits_for_a_free_server() {
    let agency = ClusterBuilder::new()
        .servers(&["A"])
        .server("B", "BAD")
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A"])
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::AddFollower, "db", "c", "s1"),
        )
        .agency();

    assert!(start(&agency, "1").is_retry());
    assert_eq!(status_of(&agency.root().expect("root"), "1"), JobStatus::ToDo);
}

/// With exactly the factor in sync after removal, the last follower goes.
#[test]
fn remove_follower_drops_lowest_priority_replica() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B", "C"])
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::RemoveFollower, "db", "c", "s1"),
        )
        .agency();

    let outcome = start(&agency, "1");

    assert!(matches!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Finished,
            ..
        }
    ));
    assert_eq!(
        plan_of(&agency.root().expect("root"), "db", "c", "s1"),
        vec!["A", "B"]
    );
    assert_eq!(agency.log().expect("log").len(), 1);
}

/// An out-of-sync follower is removed before in-sync ones.
#[test]
fn remove_follower_prefers_out_of_sync_replica() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B", "C"])
        .current("db", "c", "s1", &["A", "C"])
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::RemoveFollower, "db", "c", "s1"),
        )
        .agency();

    start(&agency, "1");

    assert_eq!(
        plan_of(&agency.root().expect("root"), "db", "c", "s1"),
        vec!["A", "C"]
    );
}

/// Too few in-sync replicas: no job is created, and an existing one waits.
#[test]
fn remove_follower_waits_for_in_sync_replicas() {
    let builder = ClusterBuilder::new()
        .servers(&["A", "B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B", "C"])
        .current("db", "c", "s1", &["A"]);

    let agency = builder.clone().agency();
    let report = run_cycle(&agency, &SupervisionConfig::default(), now(), &mut rng(7))
        .expect("cycle");
    assert!(report.created.is_empty());

    let agency = builder
        .job(
            JobStatus::ToDo,
            &shard_job_doc("1", JobType::RemoveFollower, "db", "c", "s1"),
        )
        .agency();
    assert!(start(&agency, "1").is_retry());
    let root = agency.root().expect("root");
    assert_eq!(status_of(&root, "1"), JobStatus::ToDo);
    assert_eq!(plan_of(&root, "db", "c", "s1"), vec!["A", "B", "C"]);
}

/// The cycle schedules and then runs a RemoveFollower for an over-replicated
/// shard.
#[test]
fn cycle_repairs_over_replicated_shard() {
    let agency = ClusterBuilder::new()
        .servers(&["A", "B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B", "C"])
        .agency();
    let config = SupervisionConfig::default();
    let mut rng = rng(7);

    let first = run_cycle(&agency, &config, now(), &mut rng).expect("cycle");
    assert_eq!(first.created, vec!["1".to_string()]);
    let second = run_cycle(&agency, &config, now(), &mut rng).expect("cycle");
    assert_eq!(second.steps.len(), 1);
    assert_eq!(second.steps[0].job_type, JobType::RemoveFollower);

    let root = agency.root().expect("root");
    assert_eq!(status_of(&root, "1"), JobStatus::Finished);
    assert_eq!(plan_of(&root, "db", "c", "s1").len(), 2);
}
