//! FailedServer and FailedLeader tests: failover fan-out, leader promotion
//! and the recovery race.

use serde_json::json;
use supervision::core::jobs::HEALTH_RECOVERED;
use supervision::core::snapshot::Snapshot;
use supervision::core::types::{JobStatus, JobType, StepOutcome};
use supervision::io::agent::AgentInterface;
use supervision::io::memory_agency::InMemoryAgency;
use supervision::job::Job;
use supervision::simulate::sync_current;
use supervision::test_support::{
    ClusterBuilder, job_in, now, plan_of, rng, server_job_doc, shard_job_doc, status_of,
};

fn snapshot(agency: &InMemoryAgency) -> Snapshot {
    agency.snapshot().expect("snapshot")
}

/// A FAILED, leading in s1 and following in s2.
fn failed_a() -> ClusterBuilder {
    ClusterBuilder::new()
        .server("A", "FAILED")
        .servers(&["B", "C"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B"])
        .shard("db", "c", "s2", &["B", "A"])
}

/// Led shards get a FailedLeader sub-job; followed shards drop the server.
#[test]
fn failed_server_fans_out_and_drops_followers() {
    let agency = failed_a()
        .job(
            JobStatus::ToDo,
            &server_job_doc("1", JobType::FailedServer, "A"),
        )
        .agency();
    let mut job = Job::load(&agency, &snapshot(&agency), "1").expect("job");

    let outcome = job.start(&snapshot(&agency), now(), &mut rng(5)).expect("start");

    assert_eq!(outcome, StepOutcome::Progress { status: JobStatus::Pending });
    let root = agency.root().expect("root");
    assert_eq!(plan_of(&root, "db", "c", "s1"), vec!["A", "B"]);
    assert_eq!(plan_of(&root, "db", "c", "s2"), vec!["B"]);
    assert_eq!(root["Target"]["FailedServers"]["A"], json!([]));
    assert_eq!(root["Supervision"]["DBServers"]["A"], json!("1"));
    let (status, child) = job_in(&root, "1-1").expect("child");
    assert_eq!(status, JobStatus::ToDo);
    assert_eq!(child.job_type, JobType::FailedLeader);
    assert_eq!(child.from_server.as_deref(), Some("A"));
    assert_eq!(child.shard.as_deref(), Some("s1"));
}

/// Health flipping back to GOOD before the commit fails the job, Plan intact.
#[test]
fn recovery_before_commit_fails_job() {
    let agency = failed_a()
        .job(
            JobStatus::ToDo,
            &server_job_doc("1", JobType::FailedServer, "A"),
        )
        .agency();
    let stale = snapshot(&agency);
    let mut job = Job::load(&agency, &stale, "1").expect("job");

    agency
        .seed("/Supervision/Health/A/Status", json!("GOOD"))
        .expect("recover");
    let outcome = job.start(&stale, now(), &mut rng(5)).expect("start");

    assert_eq!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Failed,
            reason: Some(HEALTH_RECOVERED.to_string())
        }
    );
    let root = agency.root().expect("root");
    assert_eq!(status_of(&root, "1"), JobStatus::Failed);
    assert_eq!(plan_of(&root, "db", "c", "s1"), vec!["A", "B"]);
    assert_eq!(plan_of(&root, "db", "c", "s2"), vec!["B", "A"]);
    assert!(root["Target"].get("FailedServers").is_none());
}

/// A server that is not FAILED at start fails the job straight away.
#[test]
fn healthy_server_fails_on_start() {
    let agency = failed_a()
        .server("A", "GOOD")
        .job(
            JobStatus::ToDo,
            &server_job_doc("1", JobType::FailedServer, "A"),
        )
        .agency();
    let mut job = Job::load(&agency, &snapshot(&agency), "1").expect("job");
    let outcome = job.start(&snapshot(&agency), now(), &mut rng(5)).expect("start");
    assert_eq!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Failed,
            reason: Some(HEALTH_RECOVERED.to_string())
        }
    );
}

/// The in-sync follower takes over and the failed leader goes last.
#[test]
fn failed_leader_promotes_in_sync_follower() {
    let mut doc = shard_job_doc("1", JobType::FailedLeader, "db", "c", "s1");
    doc.from_server = Some("A".to_string());
    let agency = ClusterBuilder::new()
        .server("A", "FAILED")
        .servers(&["B", "C"])
        .collection("db", "c", 3)
        .shard("db", "c", "s1", &["A", "B", "C"])
        .current("db", "c", "s1", &["A", "C"])
        .job(JobStatus::ToDo, &doc)
        .agency();
    let mut job = Job::load(&agency, &snapshot(&agency), "1").expect("job");

    job.start(&snapshot(&agency), now(), &mut rng(5)).expect("start");
    assert_eq!(
        plan_of(&agency.root().expect("root"), "db", "c", "s1"),
        vec!["C", "B", "A"]
    );
    assert_eq!(job.doc().to_server.as_deref(), Some("C"));

    // Not finished until Current shows the new leader.
    assert!(job.run(&snapshot(&agency), now()).expect("run").is_retry());
    sync_current(&agency).expect("sync");
    let outcome = job.run(&snapshot(&agency), now()).expect("run");

    assert!(matches!(
        outcome,
        StepOutcome::Terminal {
            status: JobStatus::Finished,
            ..
        }
    ));
    let root = agency.root().expect("root");
    assert!(root["Supervision"]["Shards"].get("s1").is_none());
}

/// Without an in-sync healthy follower the job waits in ToDo.
#[test]
fn failed_leader_waits_for_in_sync_follower() {
    let mut doc = shard_job_doc("1", JobType::FailedLeader, "db", "c", "s1");
    doc.from_server = Some("A".to_string());
    let agency = ClusterBuilder::new()
        .server("A", "FAILED")
        .servers(&["B"])
        .collection("db", "c", 2)
        .shard("db", "c", "s1", &["A", "B"])
        .current("db", "c", "s1", &["A"])
        .job(JobStatus::ToDo, &doc)
        .agency();
    let mut job = Job::load(&agency, &snapshot(&agency), "1").expect("job");

    let outcome = job.start(&snapshot(&agency), now(), &mut rng(5)).expect("start");

    assert!(outcome.is_retry());
    assert_eq!(job.state(), JobStatus::ToDo);
}

/// A follower that is being cleaned out is never promoted.
#[test]
fn failed_leader_skips_draining_follower() {
    let mut doc = shard_job_doc("1", JobType::FailedLeader, "db", "c", "s1");
    doc.from_server = Some("A".to_string());
    for seed in 0..8 {
        let agency = ClusterBuilder::new()
            .server("A", "FAILED")
            .servers(&["B", "C"])
            .collection("db", "c", 3)
            .shard("db", "c", "s1", &["A", "B", "C"])
            .set("/Supervision/DBServers/B", json!("9"))
            .job(JobStatus::ToDo, &doc)
            .agency();
        let mut job = Job::load(&agency, &snapshot(&agency), "1").expect("job");

        job.start(&snapshot(&agency), now(), &mut rng(seed)).expect("start");

        assert_eq!(job.doc().to_server.as_deref(), Some("C"), "seed {seed}");
        assert_eq!(
            plan_of(&agency.root().expect("root"), "db", "c", "s1"),
            vec!["C", "B", "A"]
        );
    }
}
