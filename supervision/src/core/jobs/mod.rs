//! Per-kind job transition logic.
//!
//! Every function here is pure: it reads one [`Snapshot`] and returns a
//! [`Decision`] describing the single conditional transaction (if any) the
//! driver should submit. Dispatch over job kinds is an exhaustive `match`.

mod add_follower;
mod clean_out_server;
mod failed_leader;
mod failed_server;
mod move_shard;
mod remove_follower;

pub use failed_server::HEALTH_RECOVERED;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::{Value, json};

use crate::core::cluster::{self, ShardRef};
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{JobDocument, JobStatus, JobTimeouts, JobType};

/// Inputs shared by every transition: one snapshot and one clock reading.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub snapshot: &'a Snapshot,
    pub now: DateTime<Utc>,
    pub timeouts: JobTimeouts,
}

impl<'a> JobContext<'a> {
    pub fn new(snapshot: &'a Snapshot, now: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            now,
            timeouts: JobTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: JobTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Read-only follow-up issued when a commit is rejected, to tell a lost race
/// apart from a trigger condition that no longer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recheck {
    pub path: String,
    pub expected: Value,
    /// Abort reason used when the value no longer matches.
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub transaction: Transaction,
    pub next: JobStatus,
    pub reason: Option<String>,
    pub recheck: Option<Recheck>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do until the snapshot changes.
    Wait(String),
    Commit(Commit),
    /// The job cannot complete; the driver runs the abort path.
    Abort(String),
}

impl Decision {
    fn commit(transaction: Transaction, next: JobStatus) -> Self {
        Decision::Commit(Commit {
            transaction,
            next,
            reason: None,
            recheck: None,
        })
    }

    fn finish(transaction: Transaction, reason: Option<String>) -> Self {
        Decision::Commit(Commit {
            transaction,
            next: JobStatus::Finished,
            reason,
            recheck: None,
        })
    }

    fn with_recheck(self, recheck: Recheck) -> Self {
        match self {
            Decision::Commit(commit) => Decision::Commit(Commit {
                recheck: Some(recheck),
                ..commit
            }),
            other => other,
        }
    }
}

/// Transactions that take a job to Failed.
///
/// `transaction` carries the job's own move; `followups` are independent
/// aborts of its sub-jobs submitted in the same write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortPlan {
    pub transaction: Transaction,
    pub followups: Vec<Transaction>,
}

/// Transaction that creates `doc` and the status it lands in.
///
/// The document may only be written while the id is unused in every status
/// directory, which makes a repeated create harmless. A MoveShard whose
/// source and destination coincide is written straight to Failed.
pub fn create(
    doc: &JobDocument,
    now: DateTime<Utc>,
) -> serde_json::Result<(Transaction, JobStatus)> {
    let mut doc = doc.clone();
    if doc.time_created.is_none() {
        doc.time_created = Some(now);
    }
    let useless = doc.job_type == JobType::MoveShard
        && doc.from_server.is_some()
        && doc.from_server == doc.to_server;
    let status = if useless {
        doc.time_finished = Some(now);
        doc.reason = Some("fromServer and toServer are the same server".to_string());
        JobStatus::Failed
    } else {
        JobStatus::ToDo
    };

    let mut tx = Transaction::new();
    for home in JobStatus::PERSISTED {
        if let Some(path) = paths::job(home, &doc.job_id) {
            tx.old_empty(path, true);
        }
    }
    if let Some(path) = paths::job(status, &doc.job_id) {
        tx.set(path, doc.to_json()?);
    }
    Ok((tx, status))
}

/// ToDo step.
///
/// Errors only when a job document cannot be serialized.
pub fn start(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    rng: &mut dyn RngCore,
) -> serde_json::Result<Decision> {
    if let Some(reason) = infeasible(ctx, doc) {
        return Ok(Decision::Abort(reason));
    }
    let decision = match doc.job_type {
        JobType::AddFollower => add_follower::start(ctx, doc, rng),
        JobType::RemoveFollower => remove_follower::start(ctx, doc),
        JobType::MoveShard => move_shard::start(ctx, doc),
        JobType::CleanOutServer => clean_out_server::start(ctx, doc, rng),
        JobType::FailedServer => failed_server::start(ctx, doc),
        JobType::FailedLeader => failed_leader::start(ctx, doc, rng),
    }?;
    Ok(fence(doc, decision))
}

/// Pending step.
pub fn run(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    if let Some(reason) = infeasible(ctx, doc) {
        return Ok(Decision::Abort(reason));
    }
    let decision = match doc.job_type {
        JobType::MoveShard => move_shard::run(ctx, doc),
        JobType::CleanOutServer => clean_out_server::run(ctx, doc),
        JobType::FailedServer => failed_server::run(ctx, doc),
        JobType::FailedLeader => failed_leader::run(ctx, doc),
        JobType::AddFollower | JobType::RemoveFollower => {
            // Single-phase kinds never stay Pending; finish without effects.
            let mut tx = Transaction::new();
            move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
            Ok(Decision::finish(tx, None))
        }
    }?;
    Ok(fence(doc, decision))
}

/// Compensation that takes a ToDo or Pending job to Failed.
///
/// Errors when the job is in any other state.
pub fn abort(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    status: JobStatus,
    reason: &str,
) -> Result<AbortPlan, String> {
    let plan = match status {
        JobStatus::ToDo => plain_abort(ctx, doc, JobStatus::ToDo, reason),
        JobStatus::Pending => match doc.job_type {
            JobType::MoveShard => move_shard::abort(ctx, doc, reason),
            JobType::CleanOutServer | JobType::FailedServer => {
                return abort_with_children(ctx, doc, reason);
            }
            JobType::FailedLeader => failed_leader::abort(ctx, doc, reason),
            JobType::AddFollower | JobType::RemoveFollower => {
                plain_abort(ctx, doc, JobStatus::Pending, reason)
            }
        },
        JobStatus::Finished | JobStatus::Failed | JobStatus::NotFound => {
            return Err(format!("job {} is {status} and cannot be aborted", doc.job_id));
        }
    };
    plan.map_err(|err| format!("serialize job {}: {err}", doc.job_id))
}

fn plain_abort(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    from: JobStatus,
    reason: &str,
) -> serde_json::Result<AbortPlan> {
    let mut tx = Transaction::new();
    move_job(&mut tx, doc, from, JobStatus::Failed, ctx.now, Some(reason))?;
    Ok(AbortPlan {
        transaction: tx,
        followups: Vec::new(),
    })
}

/// Checks every kind shares: job age and the target version fence.
fn infeasible(ctx: &JobContext<'_>, doc: &JobDocument) -> Option<String> {
    if let (Some(bound), Some(created)) = (ctx.timeouts.for_type(doc.job_type), doc.time_created)
    {
        let age = ctx.now.signed_duration_since(created);
        if age.to_std().is_ok_and(|age| age > bound) {
            return Some("job timed out".to_string());
        }
    }
    if let Some(expected) = doc.expected_target_version {
        if ctx.snapshot.uint(paths::TARGET_VERSION) != Some(expected) {
            return Some(format!("target version is no longer {expected}"));
        }
    }
    None
}

fn fence(doc: &JobDocument, decision: Decision) -> Decision {
    match (doc.expected_target_version, decision) {
        (Some(expected), Decision::Commit(mut commit)) => {
            commit.transaction.old(paths::TARGET_VERSION, json!(expected));
            Decision::Commit(commit)
        }
        (_, decision) => decision,
    }
}

/// Delete the document from `from` and write it to `to`, stamping the time
/// of the transition. The old home must still exist.
pub(crate) fn move_job(
    tx: &mut Transaction,
    doc: &JobDocument,
    from: JobStatus,
    to: JobStatus,
    now: DateTime<Utc>,
    reason: Option<&str>,
) -> serde_json::Result<()> {
    let mut next = doc.clone();
    match to {
        JobStatus::Pending => next.time_started = Some(now),
        JobStatus::Finished | JobStatus::Failed => {
            next.time_finished = Some(now);
            next.reason = reason.map(str::to_string);
        }
        JobStatus::ToDo | JobStatus::NotFound => {}
    }
    if let Some(old) = paths::job(from, &doc.job_id) {
        tx.delete(old.clone()).old_empty(old, false);
    }
    if let Some(new) = paths::job(to, &doc.job_id) {
        tx.set(new, next.to_json()?);
    }
    Ok(())
}

/// Look up a job by id in every status directory.
pub fn find_job(snap: &Snapshot, job_id: &str) -> Option<(JobStatus, JobDocument)> {
    JobStatus::PERSISTED.into_iter().find_map(|status| {
        let path = paths::job(status, job_id)?;
        let doc = JobDocument::from_json(snap.get(&path)?)?;
        Some((status, doc))
    })
}

/// Every parseable job in the snapshot, grouped by status.
pub fn all_jobs(snap: &Snapshot) -> Vec<(JobStatus, JobDocument)> {
    let mut out = Vec::new();
    for status in JobStatus::PERSISTED {
        let Some(dir) = paths::job_dir(status) else {
            continue;
        };
        let mut ids: Vec<&str> = snap.children(dir);
        sort_job_ids(&mut ids);
        for id in ids {
            if let Some(doc) = snap
                .get(&format!("{dir}/{id}"))
                .and_then(JobDocument::from_json)
            {
                out.push((status, doc));
            }
        }
    }
    out
}

/// Order ids numerically where possible (`2` before `10`, `3-1` after `3`).
pub fn sort_job_ids(ids: &mut [&str]) {
    ids.sort_by_key(|id| {
        let parts: Vec<u64> = id
            .split('-')
            .map(|part| part.parse().unwrap_or(u64::MAX))
            .collect();
        (parts, id.to_string())
    });
}

/// Sub-jobs of `parent_id` in every status.
pub fn children(snap: &Snapshot, parent_id: &str) -> Vec<(JobStatus, JobDocument)> {
    all_jobs(snap)
        .into_iter()
        .filter(|(_, doc)| doc.parent_job_id.as_deref() == Some(parent_id))
        .collect()
}

/// Whether the job that spawned `doc` has already failed.
fn parent_failed(snap: &Snapshot, doc: &JobDocument) -> bool {
    doc.parent_job_id
        .as_deref()
        .and_then(|parent| find_job(snap, parent))
        .is_some_and(|(status, _)| status == JobStatus::Failed)
}

/// Assert that every shard of the group still has the plan just read.
fn guard_plans(tx: &mut Transaction, snap: &Snapshot, group: &[ShardRef]) {
    for shard in group {
        match cluster::planned(snap, shard) {
            Some(plan) => tx.old(shard.plan_path(), json!(plan)),
            None => tx.old_empty(shard.plan_path(), true),
        };
    }
}

/// Assert that a whole value is unchanged, or still absent.
fn guard_value(tx: &mut Transaction, snap: &Snapshot, path: &str) {
    match snap.get(path) {
        Some(value) => tx.old(path, value.clone()),
        None => tx.old_empty(path, true),
    };
}

/// Rewrite the plan of every shard in the group with `rewrite`, guarding
/// each on its current value and bumping the plan version once.
fn rewrite_plans<F>(tx: &mut Transaction, snap: &Snapshot, group: &[ShardRef], rewrite: F)
where
    F: Fn(&[String]) -> Vec<String>,
{
    let mut changed = false;
    for shard in group {
        let Some(plan) = cluster::planned(snap, shard) else {
            continue;
        };
        let next = rewrite(&plan);
        tx.old(shard.plan_path(), json!(plan));
        if next != plan {
            tx.set(shard.plan_path(), json!(next));
            changed = true;
        }
    }
    if changed {
        tx.increment(paths::PLAN_VERSION);
    }
}

/// Shard target of a shard-level job, or the abort reason.
fn shard_of(doc: &JobDocument) -> Result<ShardRef, String> {
    doc.shard_target()
        .map(|(db, coll, shard)| ShardRef::new(db, coll, shard))
        .ok_or_else(|| "job is missing database, collection or shard".to_string())
}

/// Failure reason when the target collection is gone or follows another.
fn collection_problem(snap: &Snapshot, shard: &ShardRef) -> Option<String> {
    if !cluster::collection_exists(snap, &shard.database, &shard.collection) {
        return Some("collection was dropped".to_string());
    }
    if cluster::distribute_shards_like(snap, &shard.database, &shard.collection).is_some() {
        return Some("collection must not have distributeShardsLike attribute".to_string());
    }
    None
}

/// Terminal move for a pending shard job whose collection vanished.
fn finish_dropped(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    shard: &ShardRef,
    unlock: impl FnOnce(&mut Transaction),
) -> serde_json::Result<Decision> {
    let reason = "collection was dropped";
    let mut tx = Transaction::new();
    tx.old_empty(paths::collection(&shard.database, &shard.collection), true);
    unlock(&mut tx);
    move_job(
        &mut tx,
        doc,
        JobStatus::Pending,
        JobStatus::Finished,
        ctx.now,
        Some(reason),
    )?;
    Ok(Decision::finish(tx, Some(reason.to_string())))
}

/// Child document for a parent's fan-out; ids are `{parent}-{n}`.
fn sub_job(parent: &JobDocument, n: usize, job_type: JobType, now: DateTime<Utc>) -> JobDocument {
    JobDocument::new(
        format!("{}-{n}", parent.job_id),
        job_type,
        parent.job_id.clone(),
    )
    .with_parent(parent.job_id.clone())
    .created_at(now)
}

/// Fan-in shared by the parents: state of the children as one value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChildrenState {
    Failed(String),
    Outstanding(usize),
    Finished,
}

fn fold_children(snap: &Snapshot, parent_id: &str) -> ChildrenState {
    let mut outstanding = 0;
    for (status, child) in children(snap, parent_id) {
        match status {
            JobStatus::Failed => return ChildrenState::Failed(child.job_id),
            JobStatus::ToDo | JobStatus::Pending => outstanding += 1,
            JobStatus::Finished | JobStatus::NotFound => {}
        }
    }
    if outstanding > 0 {
        ChildrenState::Outstanding(outstanding)
    } else {
        ChildrenState::Finished
    }
}

/// Abort a parent: fail it, release its server lock, fail its ToDo
/// children in the same transaction and abort its Pending ones alongside.
fn abort_with_children(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    reason: &str,
) -> Result<AbortPlan, String> {
    let serialize = |err: serde_json::Error| format!("serialize job {}: {err}", doc.job_id);
    let mut tx = Transaction::new();
    if let Some(server) = doc.server.as_deref() {
        tx.write_unlock(paths::server_lock(server), &doc.job_id);
    }
    move_job(
        &mut tx,
        doc,
        JobStatus::Pending,
        JobStatus::Failed,
        ctx.now,
        Some(reason),
    )
    .map_err(serialize)?;
    let mut followups = Vec::new();
    for (status, child) in children(ctx.snapshot, &doc.job_id) {
        match status {
            JobStatus::ToDo => move_job(
                &mut tx,
                &child,
                JobStatus::ToDo,
                JobStatus::Failed,
                ctx.now,
                Some(PARENT_ABORTED),
            )
            .map_err(serialize)?,
            JobStatus::Pending => {
                let plan = abort(ctx, &child, JobStatus::Pending, PARENT_ABORTED)?;
                followups.push(plan.transaction);
                followups.extend(plan.followups);
            }
            JobStatus::Finished | JobStatus::Failed | JobStatus::NotFound => {}
        }
    }
    Ok(AbortPlan {
        transaction: tx,
        followups,
    })
}

pub const PARENT_ABORTED: &str = "parent job aborted";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Precondition;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn create_guards_every_status_directory() {
        let doc = JobDocument::new("4", JobType::AddFollower, "supervision")
            .with_shard("db", "c", "s1");
        let (tx, status) = create(&doc, now()).expect("create");
        assert_eq!(status, JobStatus::ToDo);
        assert_eq!(tx.preconditions().count(), 4);
        assert!(tx.operation("/Target/ToDo/4").is_some());
    }

    #[test]
    fn useless_move_is_created_failed() {
        let doc = JobDocument::new("4", JobType::MoveShard, "supervision")
            .with_shard("db", "c", "s1")
            .with_move("A", "A");
        let (tx, status) = create(&doc, now()).expect("create");
        assert_eq!(status, JobStatus::Failed);
        assert!(tx.operation("/Target/Failed/4").is_some());
        assert!(tx.operation("/Target/ToDo/4").is_none());
    }

    #[test]
    fn aborting_terminal_job_is_an_error() {
        let snap = Snapshot::default();
        let ctx = JobContext::new(&snap, now());
        let doc = JobDocument::new("4", JobType::MoveShard, "supervision");
        assert!(abort(&ctx, &doc, JobStatus::Finished, "because").is_err());
        assert!(abort(&ctx, &doc, JobStatus::NotFound, "because").is_err());
    }

    #[test]
    fn job_ids_sort_numerically() {
        let mut ids = vec!["10", "2", "3-1", "3"];
        sort_job_ids(&mut ids);
        assert_eq!(ids, vec!["2", "3", "3-1", "10"]);
    }

    #[test]
    fn old_jobs_time_out() {
        let snap = Snapshot::default();
        let ctx = JobContext::new(&snap, now());
        let doc = JobDocument::new("4", JobType::MoveShard, "supervision")
            .created_at(now() - chrono::Duration::hours(3));
        assert_eq!(infeasible(&ctx, &doc).as_deref(), Some("job timed out"));
        let fresh = doc.created_at(now() - chrono::Duration::minutes(5));
        assert_eq!(infeasible(&ctx, &fresh), None);
    }

    fn versioned_cluster(version: u64) -> serde_json::Value {
        json!({
            "Plan": {"Version": 1, "Collections": {"db": {"c": {
                "replicationFactor": 1,
                "shards": {"s1": ["A"]}
            }}}},
            "Current": {"Collections": {"db": {"c": {"s1": {"servers": ["A"]}}}}},
            "Supervision": {"Health": {
                "A": {"Status": "GOOD"},
                "B": {"Status": "GOOD"}
            }},
            "Target": {"Version": version}
        })
    }

    fn fenced_move(expected: u64) -> JobDocument {
        let mut doc = JobDocument::new("4", JobType::MoveShard, "supervision")
            .with_shard("db", "c", "s1")
            .with_move("A", "B")
            .created_at(now());
        doc.expected_target_version = Some(expected);
        doc
    }

    #[test]
    fn start_fails_when_target_version_moved_on() {
        let snap = Snapshot::new(versioned_cluster(5));
        let ctx = JobContext::new(&snap, now());
        let mut rng = StdRng::seed_from_u64(1);

        let decision = start(&ctx, &fenced_move(4), &mut rng).expect("start");

        assert_eq!(
            decision,
            Decision::Abort("target version is no longer 4".to_string())
        );
    }

    #[test]
    fn run_fails_when_target_version_moved_on() {
        let snap = Snapshot::new(versioned_cluster(6));
        let ctx = JobContext::new(&snap, now());
        let mut doc = fenced_move(5);
        doc.is_leader = Some(true);

        let decision = run(&ctx, &doc).expect("run");

        assert_eq!(
            decision,
            Decision::Abort("target version is no longer 5".to_string())
        );
    }

    #[test]
    fn matching_target_version_fences_the_commit() {
        let doc = fenced_move(5);
        let mut root = versioned_cluster(5);
        root["Target"]["ToDo"] = json!({"4": doc.to_json().expect("doc")});
        let snap = Snapshot::new(root.clone());
        let ctx = JobContext::new(&snap, now());
        let mut rng = StdRng::seed_from_u64(1);

        let Decision::Commit(commit) = start(&ctx, &doc, &mut rng).expect("start")
        else {
            panic!("expected a commit");
        };

        assert_eq!(
            commit.transaction.precondition(paths::TARGET_VERSION),
            Some(&Precondition::Old(json!(5)))
        );
        assert_eq!(commit.transaction.check(&root), Ok(()));
        let mut bumped = root;
        bumped["Target"]["Version"] = json!(6);
        assert!(commit.transaction.check(&bumped).is_err());
    }
}
