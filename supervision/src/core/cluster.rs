//! Read helpers over a snapshot: health, server sets, collections, plans and
//! advisory locks.

use crate::core::paths;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::read_lock_ids;
use crate::core::types::{Health, JobDocument, JobStatus, JobType};

/// One shard of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardRef {
    pub database: String,
    pub collection: String,
    pub shard: String,
}

impl ShardRef {
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            shard: shard.into(),
        }
    }

    pub fn plan_path(&self) -> String {
        paths::planned_servers(&self.database, &self.collection, &self.shard)
    }

    pub fn current_path(&self) -> String {
        paths::current_servers(&self.database, &self.collection, &self.shard)
    }

    pub fn lock_path(&self) -> String {
        paths::shard_lock(&self.shard)
    }
}

/// Contents of an advisory lock marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Write(String),
    Read(Vec<String>),
    /// A marker this process cannot interpret; treated as held.
    Unknown,
}

impl LockState {
    pub fn holders(&self) -> Vec<String> {
        match self {
            LockState::Write(holder) => vec![holder.clone()],
            LockState::Read(holders) => holders.clone(),
            LockState::Free | LockState::Unknown => Vec::new(),
        }
    }
}

/// Server id without the resignation marker.
pub fn strip_resigned(server: &str) -> &str {
    server.strip_prefix('_').unwrap_or(server)
}

pub fn resigned(server: &str) -> String {
    format!("_{server}")
}

pub fn health(snap: &Snapshot, server: &str) -> Option<Health> {
    snap.string(&paths::health_status(strip_resigned(server)))
        .and_then(Health::parse)
}

pub fn is_good(snap: &Snapshot, server: &str) -> bool {
    health(snap, server) == Some(Health::Good)
}

/// Every server that reports health.
pub fn registered_servers(snap: &Snapshot) -> Vec<String> {
    snap.children(paths::HEALTH)
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn is_registered(snap: &Snapshot, server: &str) -> bool {
    snap.has(&format!("{}/{}", paths::HEALTH, strip_resigned(server)))
}

pub fn cleaned_servers(snap: &Snapshot) -> Vec<String> {
    snap.string_array(paths::CLEANED_SERVERS).unwrap_or_default()
}

pub fn failed_servers(snap: &Snapshot) -> Vec<String> {
    snap.children(paths::FAILED_SERVERS)
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// GOOD servers that are neither cleaned out nor listed as failed.
pub fn available_servers(snap: &Snapshot) -> Vec<String> {
    let cleaned = cleaned_servers(snap);
    let failed = failed_servers(snap);
    registered_servers(snap)
        .into_iter()
        .filter(|server| is_good(snap, server))
        .filter(|server| !cleaned.contains(server) && !failed.contains(server))
        .collect()
}

/// Servers a CleanOutServer job is emptying: those whose DBServers marker is
/// write-locked and those named by a ToDo or Pending CleanOutServer.
pub fn draining_servers(snap: &Snapshot) -> Vec<String> {
    let mut out: Vec<String> = snap
        .children(paths::SERVER_LOCKS)
        .into_iter()
        .filter(|server| {
            matches!(
                lock_state(snap, &paths::server_lock(server)),
                LockState::Write(_)
            )
        })
        .map(str::to_string)
        .collect();
    for status in [JobStatus::ToDo, JobStatus::Pending] {
        let Some(dir) = paths::job_dir(status) else {
            continue;
        };
        for id in snap.children(dir) {
            let Some(doc) = snap
                .get(&format!("{dir}/{id}"))
                .and_then(JobDocument::from_json)
            else {
                continue;
            };
            if doc.job_type != JobType::CleanOutServer {
                continue;
            }
            if let Some(server) = doc.server {
                if !out.contains(&server) {
                    out.push(server);
                }
            }
        }
    }
    out
}

/// Servers that may receive a new replica: available and not being drained.
pub fn placement_candidates(snap: &Snapshot) -> Vec<String> {
    let draining = draining_servers(snap);
    available_servers(snap)
        .into_iter()
        .filter(|server| !draining.contains(server))
        .collect()
}

/// Whether any planned shard lists `server`, resigned or not.
pub fn is_planned_anywhere(snap: &Snapshot, server: &str) -> bool {
    all_shards(snap).iter().any(|shard| {
        planned(snap, shard)
            .unwrap_or_default()
            .iter()
            .any(|s| strip_resigned(s) == server)
    })
}

pub fn collection_exists(snap: &Snapshot, database: &str, collection: &str) -> bool {
    snap.has(&paths::collection(database, collection))
}

pub fn replication_factor(snap: &Snapshot, database: &str, collection: &str) -> Option<u64> {
    snap.uint(&format!(
        "{}/replicationFactor",
        paths::collection(database, collection)
    ))
}

/// Prototype collection named by `distributeShardsLike`, if any.
pub fn distribute_shards_like<'a>(
    snap: &'a Snapshot,
    database: &str,
    collection: &str,
) -> Option<&'a str> {
    snap.string(&format!(
        "{}/distributeShardsLike",
        paths::collection(database, collection)
    ))
    .filter(|proto| !proto.is_empty())
}

/// Shards of a collection ordered by their numeric suffix (`s2` before `s10`).
pub fn sorted_shards(snap: &Snapshot, database: &str, collection: &str) -> Vec<String> {
    let mut shards: Vec<String> = snap
        .children(&format!("{}/shards", paths::collection(database, collection)))
        .into_iter()
        .map(str::to_string)
        .collect();
    shards.sort_by(|a, b| {
        numeric_suffix(a)
            .cmp(&numeric_suffix(b))
            .then_with(|| a.cmp(b))
    });
    shards
}

fn numeric_suffix(shard: &str) -> u64 {
    let digits = shard.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits.parse().unwrap_or(u64::MAX)
}

pub fn databases(snap: &Snapshot) -> Vec<String> {
    snap.children(paths::PLAN_COLLECTIONS)
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn collections(snap: &Snapshot, database: &str) -> Vec<String> {
    snap.children(&format!("{}/{database}", paths::PLAN_COLLECTIONS))
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Every planned shard in database/collection/shard order.
pub fn all_shards(snap: &Snapshot) -> Vec<ShardRef> {
    let mut out = Vec::new();
    for database in databases(snap) {
        for collection in collections(snap, &database) {
            for shard in sorted_shards(snap, &database, &collection) {
                out.push(ShardRef::new(database.clone(), collection.clone(), shard));
            }
        }
    }
    out
}

/// Shards of collections that do not follow another collection.
pub fn prototype_shards(snap: &Snapshot) -> Vec<ShardRef> {
    all_shards(snap)
        .into_iter()
        .filter(|shard| distribute_shards_like(snap, &shard.database, &shard.collection).is_none())
        .collect()
}

/// The prototype shard followed by the shard at the same position of every
/// collection that distributes its shards like the prototype's collection.
pub fn clone_group(snap: &Snapshot, prototype: &ShardRef) -> Vec<ShardRef> {
    let mut group = vec![prototype.clone()];
    let proto_shards = sorted_shards(snap, &prototype.database, &prototype.collection);
    let Some(position) = proto_shards.iter().position(|s| *s == prototype.shard) else {
        return group;
    };
    for collection in collections(snap, &prototype.database) {
        if distribute_shards_like(snap, &prototype.database, &collection)
            != Some(prototype.collection.as_str())
        {
            continue;
        }
        let shards = sorted_shards(snap, &prototype.database, &collection);
        if let Some(shard) = shards.get(position) {
            group.push(ShardRef::new(
                prototype.database.clone(),
                collection,
                shard.clone(),
            ));
        }
    }
    group
}

pub fn planned(snap: &Snapshot, shard: &ShardRef) -> Option<Vec<String>> {
    snap.string_array(&shard.plan_path())
}

/// Servers Current reports for a shard; empty when Current has no entry.
pub fn current(snap: &Snapshot, shard: &ShardRef) -> Vec<String> {
    snap.string_array(&shard.current_path()).unwrap_or_default()
}

/// Whether `server` is reported in Current for every shard of the group.
pub fn in_sync_everywhere(snap: &Snapshot, group: &[ShardRef], server: &str) -> bool {
    group
        .iter()
        .all(|shard| current(snap, shard).iter().any(|s| s == server))
}

/// Whether Current reports `server` as leader for every shard of the group.
pub fn leads_everywhere(snap: &Snapshot, group: &[ShardRef], server: &str) -> bool {
    group
        .iter()
        .all(|shard| current(snap, shard).first().map(String::as_str) == Some(server))
}

pub fn lock_state(snap: &Snapshot, path: &str) -> LockState {
    match snap.get(path) {
        None => LockState::Free,
        Some(node) => {
            if let Some(holder) = node.as_str() {
                LockState::Write(holder.to_string())
            } else if let Some(holders) = read_lock_ids(node) {
                if holders.is_empty() {
                    LockState::Free
                } else {
                    LockState::Read(holders)
                }
            } else {
                LockState::Unknown
            }
        }
    }
}

pub fn can_write_lock(snap: &Snapshot, path: &str) -> bool {
    lock_state(snap, path) == LockState::Free
}

pub fn can_read_lock(snap: &Snapshot, path: &str) -> bool {
    matches!(lock_state(snap, path), LockState::Free | LockState::Read(_))
}
