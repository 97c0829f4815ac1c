//! Supervision scheduling policy.
//!
//! Given one snapshot, decide which jobs should exist but do not (failover
//! for FAILED servers, replication factor enforcement) and which tree entries
//! are leftovers of jobs that are no longer running. Job ids are assigned by
//! the caller.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::core::cluster::{self, LockState, ShardRef};
use crate::core::jobs;
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::{Health, JobDocument, JobStatus, JobType};

/// Placeholder id for documents whose id is assigned later.
const UNASSIGNED: &str = "";

/// FailedServer jobs for FAILED servers that still appear in some plan and
/// have no FailedServer job in ToDo or Pending.
pub fn failed_server_jobs(snap: &Snapshot, creator: &str, now: DateTime<Utc>) -> Vec<JobDocument> {
    let active = active_jobs(snap);
    let shards = cluster::all_shards(snap);
    cluster::registered_servers(snap)
        .into_iter()
        .filter(|server| cluster::health(snap, server) == Some(Health::Failed))
        .filter(|server| {
            !active.iter().any(|doc| {
                doc.job_type == JobType::FailedServer
                    && doc.server.as_deref() == Some(server.as_str())
            })
        })
        .filter(|server| {
            shards.iter().any(|shard| {
                cluster::planned(snap, shard)
                    .unwrap_or_default()
                    .iter()
                    .any(|s| cluster::strip_resigned(s) == server.as_str())
            })
        })
        .map(|server| {
            JobDocument::new(UNASSIGNED, JobType::FailedServer, creator)
                .with_server(server)
                .created_at(now)
        })
        .collect()
}

/// AddFollower/RemoveFollower jobs for prototype shards whose planned replica
/// count differs from the replication factor.
///
/// Shards are skipped while locked, while any active job targets them, while
/// their leader is resigning or unhealthy, and when the job could not make
/// progress anyway (no free server, too few in-sync replicas).
pub fn replication_jobs(snap: &Snapshot, creator: &str, now: DateTime<Utc>) -> Vec<JobDocument> {
    let active = active_jobs(snap);
    let available = cluster::placement_candidates(snap);
    let mut out = Vec::new();
    for shard in cluster::prototype_shards(snap) {
        let Some(plan) = cluster::planned(snap, &shard) else {
            continue;
        };
        let Some(desired) =
            cluster::replication_factor(snap, &shard.database, &shard.collection)
        else {
            continue;
        };
        let desired = desired as usize;
        let Some(leader) = plan.first() else {
            continue;
        };
        if leader.starts_with('_') || !cluster::is_good(snap, leader) {
            continue;
        }
        if !cluster::can_write_lock(snap, &shard.lock_path()) || targeted(&active, &shard) {
            continue;
        }
        let group = cluster::clone_group(snap, &shard);
        let job_type = if plan.len() < desired {
            let has_candidate = available.iter().any(|server| !plan.contains(server));
            if !has_candidate {
                continue;
            }
            JobType::AddFollower
        } else if plan.len() > desired {
            let in_sync = plan
                .iter()
                .filter(|server| cluster::in_sync_everywhere(snap, &group, server))
                .count();
            if in_sync < desired || !cluster::in_sync_everywhere(snap, &group, leader) {
                continue;
            }
            JobType::RemoveFollower
        } else {
            continue;
        };
        out.push(
            JobDocument::new(UNASSIGNED, job_type, creator)
                .with_shard(shard.database, shard.collection, shard.shard)
                .created_at(now),
        );
    }
    out
}

fn active_jobs(snap: &Snapshot) -> Vec<JobDocument> {
    jobs::all_jobs(snap)
        .into_iter()
        .filter(|(status, _)| status.is_active())
        .map(|(_, doc)| doc)
        .collect()
}

fn targeted(active: &[JobDocument], shard: &ShardRef) -> bool {
    active.iter().any(|doc| {
        doc.shard_target()
            .is_some_and(|(db, _, name)| db == shard.database && name == shard.shard)
    })
}

/// Give every document an id, counting up from `first`.
pub fn assign_ids(docs: &mut [JobDocument], first: u64) {
    for (offset, doc) in docs.iter_mut().enumerate() {
        doc.job_id = (first + offset as u64).to_string();
    }
}

/// Release lock holders that are not Pending jobs.
///
/// One transaction per holder, each conditional on the marker still naming
/// the holder and the holder still not being Pending.
pub fn stale_lock_cleanup(snap: &Snapshot) -> Vec<Transaction> {
    let mut out = Vec::new();
    for dir in [paths::SHARD_LOCKS, paths::SERVER_LOCKS] {
        for key in snap.children(dir) {
            let path = format!("{dir}/{key}");
            let state = cluster::lock_state(snap, &path);
            for holder in state.holders() {
                let pending = jobs::find_job(snap, &holder)
                    .is_some_and(|(status, _)| status == JobStatus::Pending);
                if pending {
                    continue;
                }
                let mut tx = Transaction::new();
                match &state {
                    LockState::Write(_) => {
                        tx.is_write_locked(path.clone(), &holder)
                            .write_unlock(path.clone(), &holder);
                    }
                    LockState::Read(_) => {
                        tx.is_read_locked(path.clone(), &holder)
                            .read_unlock(path.clone(), &holder);
                    }
                    LockState::Free | LockState::Unknown => continue,
                }
                if let Some(pending_path) = paths::job(JobStatus::Pending, &holder) {
                    tx.old_empty(pending_path, true);
                }
                out.push(tx);
            }
        }
    }
    out
}

/// Drop `/Target/FailedServers/{server}` once the server is GOOD again and
/// no FailedServer job for it is still active.
pub fn failed_servers_cleanup(snap: &Snapshot) -> Vec<Transaction> {
    let active = active_jobs(snap);
    cluster::failed_servers(snap)
        .into_iter()
        .filter(|server| cluster::is_good(snap, server))
        .filter(|server| {
            !active.iter().any(|doc| {
                doc.job_type == JobType::FailedServer
                    && doc.server.as_deref() == Some(server.as_str())
            })
        })
        .map(|server| {
            let mut tx = Transaction::new();
            tx.old(paths::health_status(&server), json!(Health::Good.as_str()))
                .delete(paths::failed_server(&server));
            tx
        })
        .collect()
}
