//! FailedServer: react to a server reported FAILED. Shards it leads get a
//! FailedLeader sub-job; shards it follows drop it from Plan directly.

use serde_json::json;

use super::{
    ChildrenState, Decision, JobContext, Recheck, fold_children, guard_plans, move_job, sub_job,
};
use crate::core::cluster;
use crate::core::paths;
use crate::core::transaction::Transaction;
use crate::core::types::{Health, JobDocument, JobStatus, JobType};

pub const HEALTH_RECOVERED: &str = "server health is no longer FAILED";

pub(super) fn start(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let Some(server) = doc.server.as_deref() else {
        return Ok(Decision::Abort("job is missing server".to_string()));
    };
    if cluster::health(snap, server) != Some(Health::Failed) {
        return Ok(Decision::Abort(HEALTH_RECOVERED.to_string()));
    }
    let server_lock = paths::server_lock(server);
    if !cluster::can_write_lock(snap, &server_lock) {
        return Ok(Decision::Wait(format!("server {server} is locked")));
    }

    let mut tx = Transaction::new();
    let mut spawned = 0;
    let mut dropped = false;
    for shard in cluster::prototype_shards(snap) {
        let Some(plan) = cluster::planned(snap, &shard) else {
            continue;
        };
        let Some(position) = plan
            .iter()
            .position(|s| cluster::strip_resigned(s) == server)
        else {
            continue;
        };
        let group = cluster::clone_group(snap, &shard);
        if position == 0 {
            let child = sub_job(doc, spawned + 1, JobType::FailedLeader, ctx.now)
                .with_shard(&shard.database, &shard.collection, &shard.shard);
            let child = JobDocument {
                from_server: Some(server.to_string()),
                ..child
            };
            let (create, _) = super::create(&child, ctx.now)?;
            if let Err(conflict) = tx.merge(create) {
                return Ok(Decision::Wait(conflict));
            }
            spawned += 1;
            continue;
        }
        if !cluster::can_write_lock(snap, &shard.lock_path()) {
            return Ok(Decision::Wait(format!("shard {} is locked", shard.shard)));
        }
        guard_plans(&mut tx, snap, &group);
        tx.can_write_lock(shard.lock_path());
        for member in &group {
            let Some(current) = cluster::planned(snap, member) else {
                continue;
            };
            let next: Vec<String> = current
                .into_iter()
                .filter(|s| cluster::strip_resigned(s) != server)
                .collect();
            tx.set(member.plan_path(), json!(next));
        }
        dropped = true;
    }
    if dropped {
        tx.increment(paths::PLAN_VERSION);
    }

    let failed_entry = paths::failed_server(server);
    if !snap.has(&failed_entry) {
        tx.set(failed_entry.clone(), json!([])).old_empty(failed_entry, true);
    }
    tx.old(paths::health_status(server), json!(Health::Failed.as_str()));

    let decision = if spawned == 0 {
        move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Finished, ctx.now, None)?;
        Decision::finish(tx, None)
    } else {
        tx.can_write_lock(server_lock.clone())
            .write_lock(server_lock, &doc.job_id);
        move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Pending, ctx.now, None)?;
        Decision::commit(tx, JobStatus::Pending)
    };
    Ok(decision.with_recheck(Recheck {
        path: paths::health_status(server),
        expected: json!(Health::Failed.as_str()),
        reason: HEALTH_RECOVERED.to_string(),
    }))
}

pub(super) fn run(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let Some(server) = doc.server.as_deref() else {
        return Ok(Decision::Abort("job is missing server".to_string()));
    };
    match fold_children(ctx.snapshot, &doc.job_id) {
        ChildrenState::Failed(child) => Ok(Decision::Abort(format!("sub job {child} failed"))),
        ChildrenState::Outstanding(count) => {
            Ok(Decision::Wait(format!("waiting for {count} sub jobs")))
        }
        ChildrenState::Finished => {
            let mut tx = Transaction::new();
            tx.write_unlock(paths::server_lock(server), &doc.job_id);
            move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
            Ok(Decision::finish(tx, None))
        }
    }
}
