//! Test-only helpers for building agency trees and reading them back.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};

use crate::core::jobs;
use crate::core::paths;
use crate::core::snapshot::{self, Snapshot};
use crate::core::types::{JobDocument, JobStatus, JobType};
use crate::io::agency_store::write_agency;
use crate::io::memory_agency::InMemoryAgency;

/// Fixed clock value used by fixtures.
pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

/// `now()` moved forward by `secs`.
pub fn later(secs: i64) -> DateTime<Utc> {
    now() + chrono::Duration::seconds(secs)
}

/// Deterministic RNG for server selection.
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Builder for agency trees.
///
/// Shards are created in sync: Current mirrors the given Plan unless
/// overridden with [`ClusterBuilder::current`].
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    root: Value,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            root: json!({"Plan": {"Version": 1, "Collections": {}}}),
        }
    }

    pub fn server(self, name: &str, health: &str) -> Self {
        self.set(&format!("{}/{name}", paths::HEALTH), json!({"Status": health}))
    }

    /// GOOD servers.
    pub fn servers(mut self, names: &[&str]) -> Self {
        for name in names {
            self = self.server(name, "GOOD");
        }
        self
    }

    pub fn collection(self, database: &str, collection: &str, replication_factor: u64) -> Self {
        self.set(
            &format!("{}/replicationFactor", paths::collection(database, collection)),
            json!(replication_factor),
        )
    }

    /// A collection that distributes its shards like `prototype`.
    pub fn clone_of(
        self,
        database: &str,
        collection: &str,
        prototype: &str,
        replication_factor: u64,
    ) -> Self {
        self.collection(database, collection, replication_factor).set(
            &format!("{}/distributeShardsLike", paths::collection(database, collection)),
            json!(prototype),
        )
    }

    pub fn shard(self, database: &str, collection: &str, shard: &str, plan: &[&str]) -> Self {
        self.set(
            &paths::planned_servers(database, collection, shard),
            json!(plan),
        )
        .current(database, collection, shard, plan)
    }

    pub fn current(self, database: &str, collection: &str, shard: &str, servers: &[&str]) -> Self {
        self.set(
            &paths::current_servers(database, collection, shard),
            json!(servers),
        )
    }

    pub fn job(self, status: JobStatus, doc: &JobDocument) -> Self {
        match (paths::job(status, &doc.job_id), doc.to_json()) {
            (Some(path), Ok(stored)) => self.set(&path, stored),
            _ => self,
        }
    }

    pub fn set(mut self, path: &str, value: Value) -> Self {
        snapshot::store(&mut self.root, path, value);
        self
    }

    pub fn build(self) -> Value {
        self.root
    }

    pub fn agency(self) -> InMemoryAgency {
        InMemoryAgency::new(self.root)
    }
}

/// MoveShard document created at `now()`.
pub fn move_shard_doc(
    id: &str,
    database: &str,
    collection: &str,
    shard: &str,
    from: &str,
    to: &str,
) -> JobDocument {
    JobDocument::new(id, JobType::MoveShard, "test")
        .with_shard(database, collection, shard)
        .with_move(from, to)
        .created_at(now())
}

/// Shard-level job document (AddFollower, RemoveFollower) created at `now()`.
pub fn shard_job_doc(
    id: &str,
    job_type: JobType,
    database: &str,
    collection: &str,
    shard: &str,
) -> JobDocument {
    JobDocument::new(id, job_type, "test")
        .with_shard(database, collection, shard)
        .created_at(now())
}

/// Server-level job document (CleanOutServer, FailedServer) created at `now()`.
pub fn server_job_doc(id: &str, job_type: JobType, server: &str) -> JobDocument {
    JobDocument::new(id, job_type, "test")
        .with_server(server)
        .created_at(now())
}

/// Planned servers of a shard, empty when absent.
pub fn plan_of(root: &Value, database: &str, collection: &str, shard: &str) -> Vec<String> {
    Snapshot::new(root.clone())
        .string_array(&paths::planned_servers(database, collection, shard))
        .unwrap_or_default()
}

/// Where a job currently lives, with its stored document.
pub fn job_in(root: &Value, job_id: &str) -> Option<(JobStatus, JobDocument)> {
    jobs::find_job(&Snapshot::new(root.clone()), job_id)
}

/// Status of a job, `NotFound` when it is in no status directory.
pub fn status_of(root: &Value, job_id: &str) -> JobStatus {
    job_in(root, job_id)
        .map(|(status, _)| status)
        .unwrap_or(JobStatus::NotFound)
}

/// Writes `root` to `agency.json` inside a fresh temp directory.
pub fn agency_file(root: &Value) -> Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir().context("create temp dir")?;
    let path = dir.path().join("agency.json");
    write_agency(&path, root)?;
    Ok((dir, path))
}
