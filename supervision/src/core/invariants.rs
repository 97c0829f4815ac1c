//! Semantic invariants of an agency tree not expressible via JSON Schema.

use std::collections::{BTreeMap, HashSet};

use crate::core::cluster;
use crate::core::jobs;
use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::types::{JobDocument, JobStatus};

/// Check invariants every consistent tree satisfies:
/// - every job id lives under exactly one status directory
/// - every job document parses and carries its own id
/// - planned server lists have no duplicates (ignoring resignation markers)
pub fn validate_invariants(snap: &Snapshot) -> Vec<String> {
    let mut errors = Vec::new();
    let mut homes: BTreeMap<&str, Vec<JobStatus>> = BTreeMap::new();

    for status in JobStatus::PERSISTED {
        let Some(dir) = paths::job_dir(status) else {
            continue;
        };
        for id in snap.children(dir) {
            homes.entry(id).or_default().push(status);
            let path = format!("{dir}/{id}");
            match snap.get(&path).and_then(JobDocument::from_json) {
                None => errors.push(format!("{path}: not a valid job document")),
                Some(doc) if doc.job_id != id => {
                    errors.push(format!("{path}: jobId is '{}'", doc.job_id));
                }
                Some(_) => {}
            }
        }
    }
    for (id, statuses) in &homes {
        if statuses.len() > 1 {
            let names: Vec<String> = statuses.iter().map(ToString::to_string).collect();
            errors.push(format!("job {id} is in {}", names.join(" and ")));
        }
    }

    for shard in cluster::all_shards(snap) {
        let Some(plan) = cluster::planned(snap, &shard) else {
            errors.push(format!("{}: plan is not a list of servers", shard.plan_path()));
            continue;
        };
        let mut seen = HashSet::new();
        for server in &plan {
            if !seen.insert(cluster::strip_resigned(server)) {
                errors.push(format!(
                    "{}: server {server} is planned twice",
                    shard.plan_path()
                ));
            }
        }
    }
    errors
}

/// Lock markers naming a holder that is not a Pending job.
///
/// Reported separately: the supervision loop repairs these, so they must
/// not prevent a tree from loading.
pub fn orphaned_locks(snap: &Snapshot) -> Vec<String> {
    let mut out = Vec::new();
    for dir in [paths::SHARD_LOCKS, paths::SERVER_LOCKS] {
        for key in snap.children(dir) {
            let path = format!("{dir}/{key}");
            for holder in cluster::lock_state(snap, &path).holders() {
                let pending = jobs::find_job(snap, &holder)
                    .is_some_and(|(status, _)| status == JobStatus::Pending);
                if !pending {
                    out.push(format!("{path}: held by {holder}, which is not pending"));
                }
            }
        }
    }
    out
}
