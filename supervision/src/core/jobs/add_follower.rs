//! AddFollower: close the gap between a shard's replication factor and its
//! planned replica count in a single transaction.

use rand::RngCore;
use rand::seq::SliceRandom;
use serde_json::json;

use super::{Decision, JobContext, collection_problem, guard_plans, move_job, shard_of};
use crate::core::cluster;
use crate::core::paths;
use crate::core::transaction::Transaction;
use crate::core::types::{JobDocument, JobStatus};

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
    let Some(plan) = cluster::planned(snap, &shard) else {
        return Ok(Decision::Abort(format!("shard {} is not planned", shard.shard)));
    };
    let desired = cluster::replication_factor(snap, &shard.database, &shard.collection)
        .unwrap_or(1) as usize;

    if plan.len() >= desired {
        let reason = "replication factor already satisfied";
        let mut tx = Transaction::new();
        tx.old(shard.plan_path(), json!(plan));
        move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Finished, ctx.now, Some(reason))?;
        return Ok(Decision::finish(tx, Some(reason.to_string())));
    }
    if !cluster::can_write_lock(snap, &shard.lock_path()) {
        return Ok(Decision::Wait(format!("shard {} is locked", shard.shard)));
    }

    let group = cluster::clone_group(snap, &shard);
    let mut candidates: Vec<String> = cluster::placement_candidates(snap)
        .into_iter()
        .filter(|server| {
            !group.iter().any(|member| {
                cluster::planned(snap, member)
                    .unwrap_or_default()
                    .iter()
                    .any(|planned| cluster::strip_resigned(planned) == server)
            })
        })
        .collect();
    if candidates.is_empty() {
        return Ok(Decision::Wait("no healthy server is free to take a replica".to_string()));
    }
    candidates.sort();
    let needed = desired - plan.len();
    let chosen: Vec<String> = candidates
        .choose_multiple(rng, needed.min(candidates.len()))
        .cloned()
        .collect();

    let mut tx = Transaction::new();
    guard_plans(&mut tx, snap, &group);
    for member in &group {
        let Some(mut next) = cluster::planned(snap, member) else {
            continue;
        };
        next.extend(chosen.iter().cloned());
        tx.set(member.plan_path(), json!(next));
    }
    tx.increment(paths::PLAN_VERSION);
    for server in &chosen {
        // A write-locked marker means a CleanOutServer is draining the server.
        tx.old(paths::health_status(server), json!("GOOD"))
            .can_read_lock(paths::server_lock(server));
    }
    tx.can_write_lock(shard.lock_path());
    move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Finished, ctx.now, None)?;
    Ok(Decision::finish(tx, None))
}
