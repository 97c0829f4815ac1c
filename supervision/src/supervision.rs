//! One supervision cycle.
//!
//! A cycle advances every Pending job, then every ToDo job, in job id order.
//! After that it creates the jobs the scheduling policy asks for (failover
//! first, then replication factor repairs) in a single envelope transaction
//! guarded by `/Target/LatestJobId`. Last, it releases leftovers: locks whose
//! holders are no longer running and FailedServers entries of recovered
//! servers. A job that errors or is rejected is reported and retried next
//! cycle; it never stops the cycle.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::checks;
use crate::core::jobs;
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{JobStatus, JobType, StepOutcome};
use crate::io::agent::{AgentInterface, WaitResult, WriteMode};
use crate::io::config::SupervisionConfig;
use crate::job::Job;

/// What happened to one existing job during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
    pub job_id: String,
    pub job_type: JobType,
    pub outcome: StepOutcome,
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub steps: Vec<JobStep>,
    /// Ids of jobs created by this cycle.
    pub created: Vec<String>,
    /// Cleanup transactions the store accepted.
    pub cleanups: usize,
}

impl CycleReport {
    /// Whether any job changed status.
    pub fn progressed(&self) -> bool {
        self.steps.iter().any(|step| !step.outcome.is_retry())
    }

    /// Whether the cycle changed nothing at all.
    pub fn is_idle(&self) -> bool {
        !self.progressed() && self.created.is_empty() && self.cleanups == 0
    }
}

/// Run one cycle against `agent`.
///
/// Errors only when the store cannot be read; rejected writes and job
/// errors are part of the report.
#[instrument(skip_all, fields(creator = %config.creator))]
pub fn run_cycle<A: AgentInterface + ?Sized>(
    agent: &A,
    config: &SupervisionConfig,
    now: DateTime<Utc>,
    rng: &mut dyn RngCore,
) -> Result<CycleReport> {
    let mut snapshot = agent.snapshot().context("read agency snapshot")?;
    let mut report = CycleReport::default();

    let mut queue = Vec::new();
    for wanted in [JobStatus::Pending, JobStatus::ToDo] {
        queue.extend(
            jobs::all_jobs(&snapshot)
                .into_iter()
                .filter(|(status, _)| *status == wanted)
                .map(|(_, doc)| doc.job_id),
        );
    }

    for job_id in queue {
        let Some(job) = Job::load(agent, &snapshot, &job_id) else {
            debug!(%job_id, "job disappeared during cycle");
            continue;
        };
        let mut job = job.with_timeouts(config.jobs);
        let job_type = job.doc().job_type;
        let outcome = match job.state() {
            JobStatus::Pending => job.run(&snapshot, now),
            JobStatus::ToDo => job.start(&snapshot, now, rng),
            _ => continue,
        };
        let outcome = outcome.unwrap_or_else(|err| {
            warn!(%job_id, error = %format!("{err:#}"), "job step failed");
            StepOutcome::retry(format!("{err:#}"))
        });
        if !outcome.is_retry() {
            snapshot = agent.snapshot().context("refresh agency snapshot")?;
        }
        report.steps.push(JobStep {
            job_id,
            job_type,
            outcome,
        });
    }

    if let Some(created) = create_jobs(agent, config, &snapshot, now)? {
        report.created = created;
        snapshot = agent.snapshot().context("refresh agency snapshot")?;
    }

    report.cleanups = cleanup(agent, &snapshot)?;
    info!(
        steps = report.steps.len(),
        created = report.created.len(),
        cleanups = report.cleanups,
        "cycle complete"
    );
    Ok(report)
}

/// Create this cycle's new jobs in one envelope.
///
/// Returns the created ids when the envelope was applied.
fn create_jobs<A: AgentInterface + ?Sized>(
    agent: &A,
    config: &SupervisionConfig,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<Option<Vec<String>>> {
    let mut docs = checks::failed_server_jobs(snapshot, &config.creator, now);
    if config.enforce_replication_factor {
        docs.extend(checks::replication_jobs(snapshot, &config.creator, now));
    }
    if docs.is_empty() {
        return Ok(None);
    }
    docs.truncate(config.max_new_jobs_per_cycle);

    let latest = snapshot.uint(paths::LATEST_JOB_ID);
    // Ids of jobs written by other tools may be ahead of the counter.
    let highest = jobs::all_jobs(snapshot)
        .iter()
        .filter_map(|(_, doc)| doc.job_id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let first = latest.unwrap_or(0).max(highest) + 1;
    checks::assign_ids(&mut docs, first);

    let mut envelope = Transaction::new();
    match latest {
        Some(value) => envelope.old(paths::LATEST_JOB_ID, json!(value)),
        None => envelope.old_empty(paths::LATEST_JOB_ID, true),
    };
    envelope.set(paths::LATEST_JOB_ID, json!(first + docs.len() as u64 - 1));

    let mut ids = Vec::with_capacity(docs.len());
    for doc in docs {
        ids.push(doc.job_id.clone());
        Job::new(agent, doc).create(Some(&mut envelope), now)?;
    }

    let result = agent
        .write(std::slice::from_ref(&envelope), WriteMode::Normal)
        .context("write job creation envelope")?;
    let Some(index) = result.indices.first().copied().filter(|index| *index > 0) else {
        debug!(count = ids.len(), "job creation envelope rejected");
        return Ok(None);
    };
    match agent
        .wait_for(index, config.wait_for_commit())
        .context("wait for job creation commit")?
    {
        WaitResult::Ok => {}
        other => warn!(index, ?other, "job creation not confirmed"),
    }
    info!(ids = ?ids, "jobs created");
    Ok(Some(ids))
}

/// Release stale locks and FailedServers entries of recovered servers.
fn cleanup<A: AgentInterface + ?Sized>(agent: &A, snapshot: &Snapshot) -> Result<usize> {
    let mut batch = checks::stale_lock_cleanup(snapshot);
    batch.extend(checks::failed_servers_cleanup(snapshot));
    if batch.is_empty() {
        return Ok(0);
    }
    let result = agent
        .write(&batch, WriteMode::Normal)
        .context("write cleanup transactions")?;
    let applied = (0..batch.len()).filter(|i| result.applied(*i)).count();
    if applied < batch.len() {
        debug!(rejected = batch.len() - applied, "cleanup transactions rejected");
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory_agency::InMemoryAgency;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn under_replicated() -> InMemoryAgency {
        InMemoryAgency::new(json!({
            "Plan": {"Version": 1, "Collections": {"db": {"c": {
                "replicationFactor": 2,
                "shards": {"s1": ["A"]}
            }}}},
            "Current": {"Collections": {"db": {"c": {"s1": {"servers": ["A"]}}}}},
            "Supervision": {"Health": {
                "A": {"Status": "GOOD"},
                "B": {"Status": "GOOD"}
            }}
        }))
    }

    /// New jobs take ids after LatestJobId and bump the counter.
    #[test]
    fn creates_jobs_after_latest_id() {
        let agency = under_replicated();
        agency
            .seed(paths::LATEST_JOB_ID, json!(41))
            .expect("seed");
        let mut rng = StdRng::seed_from_u64(1);
        let report = run_cycle(&agency, &SupervisionConfig::default(), now(), &mut rng)
            .expect("cycle");
        assert_eq!(report.created, vec!["42".to_string()]);
        let root = agency.root().expect("root");
        assert_eq!(root["Target"]["LatestJobId"], json!(42));
        assert_eq!(root["Target"]["ToDo"]["42"]["type"], json!("addFollower"));
    }

    /// A created job is started by the next cycle and finishes there.
    #[test]
    fn next_cycle_starts_created_job() {
        let agency = under_replicated();
        let mut rng = StdRng::seed_from_u64(1);
        let config = SupervisionConfig::default();
        run_cycle(&agency, &config, now(), &mut rng).expect("first cycle");
        let report = run_cycle(&agency, &config, now(), &mut rng).expect("second cycle");
        assert!(report.progressed());
        let root = agency.root().expect("root");
        assert_eq!(
            root["Plan"]["Collections"]["db"]["c"]["shards"]["s1"],
            json!(["A", "B"])
        );
        assert!(root["Target"]["Finished"]["1"].is_object());
    }

    /// With replication enforcement off nothing is scheduled.
    #[test]
    fn replication_enforcement_can_be_disabled() {
        let agency = under_replicated();
        let config = SupervisionConfig {
            enforce_replication_factor: false,
            ..SupervisionConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let report = run_cycle(&agency, &config, now(), &mut rng).expect("cycle");
        assert!(report.is_idle());
        assert!(agency.log().expect("log").is_empty());
    }

    /// An unreadable store fails the cycle before any write.
    #[test]
    fn unavailable_store_fails_cycle() {
        let agency = under_replicated();
        agency.set_available(false).expect("toggle");
        let mut rng = StdRng::seed_from_u64(1);
        assert!(run_cycle(&agency, &SupervisionConfig::default(), now(), &mut rng).is_err());
        assert!(agency.log().expect("log").is_empty());
    }
}
