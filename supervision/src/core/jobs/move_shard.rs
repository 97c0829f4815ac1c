//! MoveShard: relocate one replica of a shard (and of every clone shard)
//! from `fromServer` to `toServer`.
//!
//! A follower move adds `toServer` to Plan, waits until Current reports it
//! and then drops `fromServer`. A leader move additionally hands over
//! leadership in three steps, each keyed off the Plan value observed before
//! it:
//!
//! 1. retire: `[from, ..., to]` becomes `[_from, ..., to]` once `to` is in sync
//! 2. promote: `[_from, ..., to]` becomes `[to, ..., from]` once Current shows
//!    the old leader resigned
//! 3. settle: once Current shows `to` leading, drop `from` unless it remains
//!    a follower, release the locks and finish
//!
//! After promotion the job only moves forward: an abort leaves the new leader
//! in place.

use serde_json::json;

use super::{
    AbortPlan, Decision, JobContext, PARENT_ABORTED, collection_problem, finish_dropped,
    guard_plans, guard_value, move_job, parent_failed, rewrite_plans, shard_of,
};
use crate::core::cluster::{self, ShardRef};
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{Health, JobDocument, JobStatus};

struct Move<'d> {
    shard: ShardRef,
    from: &'d str,
    to: &'d str,
}

fn parse(doc: &JobDocument) -> Result<Move<'_>, String> {
    let shard = shard_of(doc)?;
    let from = doc
        .from_server
        .as_deref()
        .ok_or_else(|| "job is missing fromServer".to_string())?;
    let to = doc
        .to_server
        .as_deref()
        .ok_or_else(|| "job is missing toServer".to_string())?;
    Ok(Move { shard, from, to })
}

fn unlock(tx: &mut Transaction, doc: &JobDocument, mv: &Move<'_>) {
    tx.write_unlock(mv.shard.lock_path(), &doc.job_id)
        .read_unlock(paths::server_lock(mv.to), &doc.job_id);
}

pub(super) fn start(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let mv = match parse(doc) {
        Ok(mv) => mv,
        Err(reason) => return Ok(Decision::Abort(reason)),
    };
    // Plan of a locked shard is mid-move; judge it once the lock is gone.
    let shard_lock = mv.shard.lock_path();
    if !cluster::can_write_lock(snap, &shard_lock) {
        return Ok(Decision::Wait(format!("shard {} is locked", mv.shard.shard)));
    }
    if let Some(reason) = start_problem(snap, doc, &mv) {
        return Ok(Decision::Abort(reason));
    }
    let Some(plan) = cluster::planned(snap, &mv.shard) else {
        return Ok(Decision::Abort(format!("shard {} is not planned", mv.shard.shard)));
    };
    let leads = plan.first().map(String::as_str) == Some(mv.from);
    if doc.is_leader.is_some_and(|flag| flag != leads) {
        return Ok(Decision::Abort(format!(
            "isLeader does not match the plan of shard {}",
            mv.shard.shard
        )));
    }

    let server_lock = paths::server_lock(mv.to);
    if !cluster::can_read_lock(snap, &server_lock) {
        return Ok(Decision::Wait(format!("server {} is locked", mv.to)));
    }

    let group = cluster::clone_group(snap, &mv.shard);
    let mut started = doc.clone();
    started.is_leader = Some(leads);

    let mut tx = Transaction::new();
    rewrite_plans(&mut tx, snap, &group, |plan| {
        let mut next = plan.to_vec();
        if !next.iter().any(|s| s == mv.to) {
            next.push(mv.to.to_string());
        }
        next
    });
    tx.old(paths::health_status(mv.to), json!(Health::Good.as_str()))
        .can_write_lock(shard_lock.clone())
        .can_read_lock(server_lock.clone())
        .write_lock(shard_lock, &doc.job_id)
        .read_lock(server_lock, &doc.job_id);
    guard_value(&mut tx, snap, paths::CLEANED_SERVERS);
    guard_value(&mut tx, snap, paths::FAILED_SERVERS);
    move_job(&mut tx, &started, JobStatus::ToDo, JobStatus::Pending, ctx.now, None)?;
    Ok(Decision::commit(tx, JobStatus::Pending))
}

fn start_problem(snap: &Snapshot, doc: &JobDocument, mv: &Move<'_>) -> Option<String> {
    if let Some(reason) = collection_problem(snap, &mv.shard) {
        return Some(reason);
    }
    if mv.from == mv.to {
        return Some("fromServer and toServer are the same server".to_string());
    }
    for server in [mv.from, mv.to] {
        if !cluster::is_registered(snap, server) {
            return Some(format!("server {server} is not registered"));
        }
    }
    if cluster::cleaned_servers(snap).iter().any(|s| s == mv.to) {
        return Some(format!("toServer {} has been cleaned out", mv.to));
    }
    if cluster::failed_servers(snap).iter().any(|s| s == mv.to) {
        return Some(format!("toServer {} is in FailedServers", mv.to));
    }
    if !cluster::is_good(snap, mv.to) {
        return Some(format!("toServer {} is not healthy", mv.to));
    }
    let plan = cluster::planned(snap, &mv.shard)?;
    if !plan.iter().any(|s| s == mv.from) {
        return Some(format!(
            "fromServer {} is not in the plan of shard {}",
            mv.from, mv.shard.shard
        ));
    }
    if plan.iter().any(|s| s == mv.to) {
        return Some(format!(
            "toServer {} is already in the plan of shard {}",
            mv.to, mv.shard.shard
        ));
    }
    if parent_failed(snap, doc) {
        return Some(PARENT_ABORTED.to_string());
    }
    None
}

pub(super) fn run(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
    let snap = ctx.snapshot;
    let mv = match parse(doc) {
        Ok(mv) => mv,
        Err(reason) => return Ok(Decision::Abort(reason)),
    };
    if !cluster::collection_exists(snap, &mv.shard.database, &mv.shard.collection) {
        return finish_dropped(ctx, doc, &mv.shard, |tx| unlock(tx, doc, &mv));
    }
    if parent_failed(snap, doc) {
        return Ok(Decision::Abort(PARENT_ABORTED.to_string()));
    }
    let Some(plan) = cluster::planned(snap, &mv.shard) else {
        return Ok(Decision::Abort(format!("shard {} is no longer planned", mv.shard.shard)));
    };
    let group = cluster::clone_group(snap, &mv.shard);
    let to_failed = cluster::health(snap, mv.to) == Some(Health::Failed);

    if !doc.is_leader() {
        if to_failed {
            return Ok(Decision::Abort(format!("toServer {} failed", mv.to)));
        }
        if !cluster::in_sync_everywhere(snap, &group, mv.to) {
            return Ok(Decision::Wait(format!("waiting for {} to get in sync", mv.to)));
        }
        let mut tx = Transaction::new();
        rewrite_plans(&mut tx, snap, &group, |plan| {
            plan.iter().filter(|s| *s != mv.from).cloned().collect()
        });
        unlock(&mut tx, doc, &mv);
        move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
        return Ok(Decision::finish(tx, None));
    }

    let resigned = cluster::resigned(mv.from);
    let leader = plan.first().map(String::as_str).unwrap_or_default();
    if leader == mv.from {
        if to_failed {
            return Ok(Decision::Abort(format!("toServer {} failed", mv.to)));
        }
        if !cluster::in_sync_everywhere(snap, &group, mv.to) {
            return Ok(Decision::Wait(format!("waiting for {} to get in sync", mv.to)));
        }
        let mut tx = Transaction::new();
        rewrite_plans(&mut tx, snap, &group, |plan| {
            plan.iter()
                .map(|s| if s == mv.from { resigned.clone() } else { s.clone() })
                .collect()
        });
        guard_lock(&mut tx, doc, &mv);
        return Ok(Decision::commit(tx, JobStatus::Pending));
    }
    if leader == resigned {
        if to_failed {
            return Ok(Decision::Abort(format!("toServer {} failed", mv.to)));
        }
        if !cluster::leads_everywhere(snap, &group, &resigned) {
            return Ok(Decision::Wait(format!("waiting for {} to resign", mv.from)));
        }
        let mut tx = Transaction::new();
        rewrite_plans(&mut tx, snap, &group, |plan| promote(plan, mv.to, mv.from));
        guard_lock(&mut tx, doc, &mv);
        return Ok(Decision::commit(tx, JobStatus::Pending));
    }
    if leader == mv.to {
        if !cluster::leads_everywhere(snap, &group, mv.to) {
            return Ok(Decision::Wait(format!("waiting for {} to take over", mv.to)));
        }
        let mut tx = Transaction::new();
        if doc.remains_follower() {
            guard_plans(&mut tx, snap, &group);
        } else {
            rewrite_plans(&mut tx, snap, &group, |plan| {
                plan.iter().filter(|s| *s != mv.from).cloned().collect()
            });
        }
        if doc.try_undo() && doc.remains_follower() {
            tx.set(
                paths::return_leadership(&mv.shard.shard),
                json!({
                    "jobId": doc.job_id,
                    "database": mv.shard.database,
                    "collection": mv.shard.collection,
                    "fromServer": mv.to,
                    "toServer": mv.from,
                    "timeStamp": ctx.now.to_rfc3339(),
                }),
            );
        }
        unlock(&mut tx, doc, &mv);
        move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Finished, ctx.now, None)?;
        return Ok(Decision::finish(tx, None));
    }
    Ok(Decision::Abort(format!(
        "unexpected leader {leader} in the plan of shard {}",
        mv.shard.shard
    )))
}

/// `[to, remaining followers..., from]`.
fn promote(plan: &[String], to: &str, from: &str) -> Vec<String> {
    let resigned = cluster::resigned(from);
    let mut next = vec![to.to_string()];
    next.extend(
        plan.iter()
            .filter(|s| *s != to && *s != from && **s != resigned)
            .cloned(),
    );
    next.push(from.to_string());
    next
}

/// Intermediate steps require the job to still own the shard.
fn guard_lock(tx: &mut Transaction, doc: &JobDocument, mv: &Move<'_>) {
    tx.is_write_locked(mv.shard.lock_path(), &doc.job_id);
    if let Some(pending) = paths::job(JobStatus::Pending, &doc.job_id) {
        tx.old_empty(pending, false);
    }
}

/// Take a pending move to Failed.
///
/// Before `toServer` leads anywhere the plan is reverted: the old leader is
/// restored at index 0 and `toServer` removed. Once `toServer` leads in Plan
/// or Current the plan is left as it is.
pub(super) fn abort(
    ctx: &JobContext<'_>,
    doc: &JobDocument,
    reason: &str,
) -> serde_json::Result<AbortPlan> {
    let snap = ctx.snapshot;
    let mut tx = Transaction::new();
    if let Ok(mv) = parse(doc) {
        let group = cluster::clone_group(snap, &mv.shard);
        let to_leads = group.iter().any(|shard| {
            cluster::planned(snap, shard)
                .and_then(|plan| plan.first().cloned())
                .as_deref()
                == Some(mv.to)
                || cluster::current(snap, shard).first().map(String::as_str) == Some(mv.to)
        });
        if doc.is_leader() && to_leads {
            guard_plans(&mut tx, snap, &group);
        } else {
            rewrite_plans(&mut tx, snap, &group, |plan| revert(plan, mv.from, mv.to));
        }
        unlock(&mut tx, doc, &mv);
    }
    move_job(&mut tx, doc, JobStatus::Pending, JobStatus::Failed, ctx.now, Some(reason))?;
    Ok(AbortPlan {
        transaction: tx,
        followups: Vec::new(),
    })
}

fn revert(plan: &[String], from: &str, to: &str) -> Vec<String> {
    let resigned = cluster::resigned(from);
    let mut next: Vec<String> = plan
        .iter()
        .filter(|s| *s != to)
        .map(|s| if *s == resigned { from.to_string() } else { s.clone() })
        .collect();
    if !next.iter().any(|s| s == from) {
        next.push(from.to_string());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(servers: &[&str]) -> Vec<String> {
        servers.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn promote_puts_new_leader_first_and_old_leader_last() {
        assert_eq!(
            promote(&plan(&["_A", "B", "C"]), "C", "A"),
            plan(&["C", "B", "A"])
        );
    }

    #[test]
    fn revert_restores_resigned_leader() {
        assert_eq!(revert(&plan(&["_A", "B", "C"]), "A", "C"), plan(&["A", "B"]));
        assert_eq!(revert(&plan(&["A", "B", "C"]), "B", "C"), plan(&["A", "B"]));
    }
}
