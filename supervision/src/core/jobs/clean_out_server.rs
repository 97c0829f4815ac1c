//! CleanOutServer: move every replica off a server through MoveShard
//! sub-jobs, then record the server as cleaned.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::seq::SliceRandom;
use serde_json::json;

use super::{
    ChildrenState, Decision, JobContext, children, fold_children, guard_value, move_job, sub_job,
};
use crate::core::cluster::{self, ShardRef};
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{Health, JobDocument, JobStatus, JobType};

pub(super) fn start(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    rng: &mut dyn RngCore,
) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let Some(server) = doc.server.as_deref() else {
        return Ok(Decision::Abort("job is missing server".to_string()));
    };
    if !cluster::is_registered(snap, server) {
        return Ok(Decision::Abort(format!("server {server} is not registered")));
    }
    if cluster::cleaned_servers(snap).iter().any(|s| s == server) {
        return Ok(Decision::Abort(format!("server {server} has already been cleaned out")));
    }
    if cluster::failed_servers(snap).iter().any(|s| s == server)
        || cluster::health(snap, server) == Some(Health::Failed)
    {
        return Ok(Decision::Abort(format!("server {server} has failed")));
    }

    let remaining: Vec<String> = cluster::placement_candidates(snap)
        .into_iter()
        .filter(|s| s != server)
        .collect();
    let needed = cluster::all_shards(snap)
        .iter()
        .filter_map(|shard| cluster::replication_factor(snap, &shard.database, &shard.collection))
        .max()
        .unwrap_or(0);
    if (remaining.len() as u64) < needed {
        return Ok(Decision::Abort(format!(
            "not enough healthy servers left to keep replication factor {needed}"
        )));
    }

    let server_lock = paths::server_lock(server);
    if !cluster::can_write_lock(snap, &server_lock) {
        return Ok(Decision::Wait(format!("server {server} is locked")));
    }

    let mut tx = Transaction::new();
    let mut spawned = 0;
    for (shard, plan) in planned_on(snap, server) {
        let targets = targets_for(snap, &shard, &remaining);
        let Some(to) = targets.choose(rng) else {
            return Ok(Decision::Abort(format!("no server can take over shard {}", shard.shard)));
        };
        let child = move_child(doc, spawned + 1, &shard, &plan, server, to, ctx.now);
        let (create, _) = super::create(&child, ctx.now)?;
        if let Err(conflict) = tx.merge(create) {
            return Ok(Decision::Wait(conflict));
        }
        tx.old(shard.plan_path(), json!(plan));
        spawned += 1;
    }

    guard_value(&mut tx, snap, paths::CLEANED_SERVERS);
    guard_value(&mut tx, snap, paths::PLAN_VERSION);
    guard_value(&mut tx, snap, &paths::health_status(server));
    if spawned == 0 {
        tx.push(paths::CLEANED_SERVERS, json!(server));
        move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Finished, ctx.now, None)?;
        return Ok(Decision::finish(tx, None));
    }
    tx.can_write_lock(server_lock.clone())
        .write_lock(server_lock, &doc.job_id);
    move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Pending, ctx.now, None)?;
    Ok(Decision::commit(tx, JobStatus::Pending))
}

/// The server is recorded as cleaned only once no plan lists it any more.
/// Replicas placed on it after fan-out get another round of moves.
pub(super) fn run(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let Some(server) = doc.server.as_deref() else {
        return Ok(Decision::Abort("job is missing server".to_string()));
    };
    match fold_children(snap, &doc.job_id) {
        ChildrenState::Failed(child) => Ok(Decision::Abort(format!("sub job {child} failed"))),
        ChildrenState::Outstanding(count) => {
            Ok(Decision::Wait(format!("waiting for {count} sub jobs")))
        }
        ChildrenState::Finished if cluster::is_planned_anywhere(snap, server) => {
            redrain(ctx, doc, server)
        }
        ChildrenState::Finished => {
            let mut tx = Transaction::new();
            guard_value(&mut tx, snap, paths::CLEANED_SERVERS);
            guard_value(&mut tx, snap, paths::PLAN_VERSION);
            if !cluster::cleaned_servers(snap).iter().any(|s| s == server) {
                tx.push(paths::CLEANED_SERVERS, json!(server));
            }
            tx.write_unlock(paths::server_lock(server), &doc.job_id);
            move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
            Ok(Decision::finish(tx, None))
        }
    }
}

/// Spawn MoveShard children for shards that still list the server.
fn redrain(ctx: &JobContext<'_>, doc: &JobDocument, server: &str) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let remaining: Vec<String> = cluster::placement_candidates(snap)
        .into_iter()
        .filter(|s| s != server)
        .collect();
    let mut next_index = children(snap, &doc.job_id)
        .iter()
        .filter_map(|(_, child)| {
            child
                .job_id
                .strip_prefix(doc.job_id.as_str())
                .and_then(|rest| rest.strip_prefix('-'))
                .and_then(|n| n.parse::<usize>().ok())
        })
        .max()
        .unwrap_or(0);

    let mut tx = Transaction::new();
    let mut spawned = 0;
    for (shard, plan) in planned_on(snap, server) {
        if !cluster::can_write_lock(snap, &shard.lock_path()) {
            continue;
        }
        let Some(to) = targets_for(snap, &shard, &remaining).into_iter().next() else {
            continue;
        };
        next_index += 1;
        let child = move_child(doc, next_index, &shard, &plan, server, to, ctx.now);
        let (create, _) = super::create(&child, ctx.now)?;
        if let Err(conflict) = tx.merge(create) {
            return Ok(Decision::Wait(conflict));
        }
        tx.old(shard.plan_path(), json!(plan));
        spawned += 1;
    }
    if spawned == 0 {
        return Ok(Decision::Wait(format!(
            "server {server} is still planned and no replica can move yet"
        )));
    }
    tx.is_write_locked(paths::server_lock(server), &doc.job_id);
    if let Some(pending) = paths::job(JobStatus::Pending, &doc.job_id) {
        tx.old_empty(pending, false);
    }
    Ok(Decision::commit(tx, JobStatus::Pending))
}

/// Prototype shards whose plan lists `server`, resigned or not.
fn planned_on(snap: &Snapshot, server: &str) -> Vec<(ShardRef, Vec<String>)> {
    cluster::prototype_shards(snap)
        .into_iter()
        .filter_map(|shard| {
            let plan = cluster::planned(snap, &shard)?;
            plan.iter()
                .any(|s| cluster::strip_resigned(s) == server)
                .then_some((shard, plan))
        })
        .collect()
}

/// Sorted servers that can receive a replica of the shard's clone group.
fn targets_for<'a>(snap: &Snapshot, shard: &ShardRef, remaining: &'a [String]) -> Vec<&'a String> {
    let group = cluster::clone_group(snap, shard);
    let mut targets: Vec<&String> = remaining
        .iter()
        .filter(|candidate| {
            cluster::can_read_lock(snap, &paths::server_lock(candidate))
                && !group.iter().any(|member| {
                    cluster::planned(snap, member)
                        .unwrap_or_default()
                        .iter()
                        .any(|s| cluster::strip_resigned(s) == candidate.as_str())
                })
        })
        .collect();
    targets.sort();
    targets
}

fn move_child(
    parent: &JobDocument,
    n: usize,
    shard: &ShardRef,
    plan: &[String],
    server: &str,
    to: &str,
    now: DateTime<Utc>,
) -> JobDocument {
    let mut child = sub_job(parent, n, JobType::MoveShard, now)
        .with_shard(&shard.database, &shard.collection, &shard.shard)
        .with_move(server, to);
    // A resigned entry belongs to a move in flight; the child decides at start.
    child.is_leader = match plan.first() {
        Some(first) if first.starts_with('_') => None,
        first => Some(first.map(String::as_str) == Some(server)),
    };
    child.remains_follower = Some(false);
    child
}
