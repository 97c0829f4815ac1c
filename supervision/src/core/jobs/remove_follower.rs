//! RemoveFollower: shed planned followers beyond the replication factor.

use serde_json::json;

use super::{Decision, JobContext, collection_problem, guard_plans, move_job, shard_of};
use crate::core::cluster::{self, ShardRef};
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{JobDocument, JobStatus};

pub(super) fn start(ctx: &JobContext<'_>, doc: &JobDocument) -> serde_json::Result<Decision> {
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
        .unwrap_or(1)
        .max(1) as usize;

    if plan.len() <= desired {
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
    let doomed = removal_order(snap, &group, &plan)
        .into_iter()
        .take(plan.len() - desired)
        .collect::<Vec<_>>();
    let kept: Vec<&String> = plan.iter().filter(|s| !doomed.contains(*s)).collect();
    if !kept
        .iter()
        .all(|server| cluster::in_sync_everywhere(snap, &group, server))
    {
        return Ok(Decision::Wait("remaining replicas are not all in sync".to_string()));
    }

    let mut tx = Transaction::new();
    guard_plans(&mut tx, snap, &group);
    for member in &group {
        let Some(current) = cluster::planned(snap, member) else {
            continue;
        };
        let next: Vec<String> = current
            .into_iter()
            .filter(|server| !doomed.contains(server))
            .collect();
        tx.set(member.plan_path(), json!(next));
    }
    tx.increment(paths::PLAN_VERSION);
    tx.can_write_lock(shard.lock_path());
    move_job(&mut tx, doc, JobStatus::ToDo, JobStatus::Finished, ctx.now, None)?;
    Ok(Decision::finish(tx, None))
}

/// Followers from least to most needed: out of sync first, then unhealthy,
/// then by descending plan position. The leader is never a candidate.
fn removal_order(snap: &Snapshot, group: &[ShardRef], plan: &[String]) -> Vec<String> {
    let mut followers: Vec<(usize, &String)> = plan.iter().enumerate().skip(1).collect();
    followers.sort_by_key(|(index, server)| {
        (
            cluster::in_sync_everywhere(snap, group, server),
            cluster::is_good(snap, server),
            std::cmp::Reverse(*index),
        )
    });
    followers
        .into_iter()
        .map(|(_, server)| server.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Operation;
    use crate::core::types::JobType;
    use chrono::{TimeZone, Utc};

    fn snapshot(current: serde_json::Value) -> Snapshot {
        Snapshot::new(json!({
            "Plan": {"Version": 4, "Collections": {"db": {"c": {
                "replicationFactor": 2,
                "shards": {"s1": ["A", "B", "C"]}
            }}}},
            "Current": {"Collections": {"db": {"c": {"s1": {"servers": current}}}}},
            "Supervision": {"Health": {
                "A": {"Status": "GOOD"},
                "B": {"Status": "GOOD"},
                "C": {"Status": "GOOD"}
            }}
        }))
    }

    fn decide(snap: &Snapshot) -> Decision {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time");
        let ctx = JobContext::new(snap, now);
        let doc = JobDocument::new("1", JobType::RemoveFollower, "supervision")
            .with_shard("db", "c", "s1");
        start(&ctx, &doc).expect("decide")
    }

    #[test]
    fn drops_the_out_of_sync_follower_first() {
        let Decision::Commit(commit) = decide(&snapshot(json!(["A", "C"]))) else {
            panic!("expected a commit");
        };
        assert_eq!(
            commit.transaction.operation("/Plan/Collections/db/c/shards/s1"),
            Some(&Operation::Set(json!(["A", "C"])))
        );
    }

    #[test]
    fn drops_the_last_follower_when_all_are_in_sync() {
        let Decision::Commit(commit) = decide(&snapshot(json!(["A", "B", "C"]))) else {
            panic!("expected a commit");
        };
        assert_eq!(
            commit.transaction.operation("/Plan/Collections/db/c/shards/s1"),
            Some(&Operation::Set(json!(["A", "B"])))
        );
    }

    #[test]
    fn waits_while_kept_replicas_lag() {
        assert!(matches!(decide(&snapshot(json!(["A"]))), Decision::Wait(_)));
    }
}
