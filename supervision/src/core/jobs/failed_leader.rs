//! FailedLeader: promote an in-sync follower of a shard whose leader failed.
//!
//! The failed leader cannot resign, so the plan is rewritten in one step to
//! `[to, remaining followers..., from]` and the job waits for Current to
//! report the new leader.

use rand::RngCore;
use rand::seq::SliceRandom;
use serde_json::json;

use super::{
    AbortPlan, Decision, JobContext, Recheck, collection_problem, finish_dropped, guard_plans,
    move_job, rewrite_plans, shard_of,
};
use super::failed_server::HEALTH_RECOVERED;
use crate::core::cluster;
use crate::core::paths;
use crate::core::transaction::Transaction;
use crate::core::types::{Health, JobDocument, JobStatus};

pub(super) fn start(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    rng: &mut dyn RngCore,
) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let shard = match shard_of(doc) {
        Ok(shard) => shard,
        Err(reason) => return Ok(Decision::Abort(reason)),
    };
    if let Some(reason) = collection_problem(snap, &shard) {
        return Ok(Decision::Abort(reason));
    }
    let Some(from) = doc.from_server.as_deref() else {
        return Ok(Decision::Abort("job is missing fromServer".to_string()));
    };
    let Some(plan) = cluster::planned(snap, &shard) else {
        return Ok(Decision::Abort(format!("shard {} is not planned", shard.shard)));
    };
    if plan.first().map(|s| cluster::strip_resigned(s)) != Some(from) {
        return Ok(Decision::Abort(format!(
            "{from} is no longer the leader of shard {}",
            shard.shard
        )));
    }
    if cluster::health(snap, from) != Some(Health::Failed) {
        return Ok(Decision::Abort(HEALTH_RECOVERED.to_string()));
    }
    if !cluster::can_write_lock(snap, &shard.lock_path()) {
        return Ok(Decision::Wait(format!("shard {} is locked", shard.shard)));
    }

    let group = cluster::clone_group(snap, &shard);
    let cleaned = cluster::cleaned_servers(snap);
    let failed = cluster::failed_servers(snap);
    let draining = cluster::draining_servers(snap);
    let candidates: Vec<&String> = plan
        .iter()
        .skip(1)
        .filter(|s| cluster::is_good(snap, s))
        .filter(|s| !cleaned.contains(*s) && !failed.contains(*s) && !draining.contains(*s))
        .filter(|s| cluster::in_sync_everywhere(snap, &group, s))
        .collect();
    let preferred = doc
        .to_server
        .as_ref()
        .filter(|to| candidates.contains(to));
    let Some(to) = preferred.or_else(|| candidates.choose(rng).copied()) else {
        return Ok(Decision::Wait(format!("no healthy in-sync follower for shard {}", shard.shard)));
    };
    let to = to.clone();

    let mut started = doc.clone();
    started.to_server = Some(to.clone());

    let mut tx = Transaction::new();
    rewrite_plans(&mut tx, snap, &group, |plan| {
        let mut next = vec![to.clone()];
        next.extend(
            plan.iter()
                .skip(1)
                .filter(|s| **s != to && cluster::strip_resigned(s) != from)
                .cloned(),
        );
        next.push(from.to_string());
        next
    });
    tx.old(paths::health_status(from), json!(Health::Failed.as_str()))
        .old(paths::health_status(&to), json!(Health::Good.as_str()))
        .can_write_lock(shard.lock_path())
        .write_lock(shard.lock_path(), &doc.job_id);
    move_job(&mut tx, &started, JobStatus::ToDo, JobStatus::Pending, ctx.now, None)?;
    Ok(Decision::commit(tx, JobStatus::Pending).with_recheck(Recheck {
        path: paths::health_status(from),
        expected: json!(Health::Failed.as_str()),
        reason: HEALTH_RECOVERED.to_string(),
    }))
}

pub(super) fn run(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let shard = match shard_of(doc) {
        Ok(shard) => shard,
        Err(reason) => return Ok(Decision::Abort(reason)),
    };
    let lock = shard.lock_path();
    if !cluster::collection_exists(snap, &shard.database, &shard.collection) {
        return finish_dropped(ctx, doc, &shard, |tx| {
            tx.write_unlock(lock.clone(), &doc.job_id);
        });
    }
    let Some(to) = doc.to_server.as_deref() else {
        return Ok(Decision::Abort("job is missing toServer".to_string()));
    };
    let group = cluster::clone_group(snap, &shard);
    if !cluster::leads_everywhere(snap, &group, to) {
        return Ok(Decision::Wait(format!("waiting for {to} to take over")));
    }
    let mut tx = Transaction::new();
    guard_plans(&mut tx, snap, &group);
    tx.write_unlock(lock, &doc.job_id);
    move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
    Ok(Decision::finish(tx, None))
}

/// The new leader was already written to Plan; failing leaves it there.
pub(super) fn abort(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    reason: &str,
) -> serde_json::Result<AbortPlan> {
    let mut tx = Transaction::new();
    if let Ok(shard) = shard_of(doc) {
        tx.write_unlock(shard.lock_path(), &doc.job_id);
    }
    move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Failed, ctx.now, Some(reason))?;
    Ok(AbortPlan {
        transaction: tx,
        followups: Vec::new(),
    })
}
