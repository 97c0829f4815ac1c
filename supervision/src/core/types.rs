//! Shared deterministic types for supervision core logic.
//!
//! These types define the persisted job document and the stable contracts
//! between the pure job logic and the driver that talks to the store.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a job document currently lives.
///
/// `NotFound` is never persisted: it is the state of a job that has not been
/// created yet (or was garbage-collected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobStatus {
    NotFound,
    ToDo,
    Pending,
    Finished,
    Failed,
}

impl JobStatus {
    /// The four persisted homes, in lifecycle order.
    pub const PERSISTED: [JobStatus; 4] = [
        JobStatus::ToDo,
        JobStatus::Pending,
        JobStatus::Finished,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// ToDo or Pending.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::ToDo | JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::NotFound => "NotFound",
            JobStatus::ToDo => "ToDo",
            JobStatus::Pending => "Pending",
            JobStatus::Finished => "Finished",
            JobStatus::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// Job kind; determines the transition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    AddFollower,
    MoveShard,
    CleanOutServer,
    FailedServer,
    FailedLeader,
    RemoveFollower,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobType::AddFollower => "addFollower",
            JobType::MoveShard => "moveShard",
            JobType::CleanOutServer => "cleanOutServer",
            JobType::FailedServer => "failedServer",
            JobType::FailedLeader => "failedLeader",
            JobType::RemoveFollower => "removeFollower",
        };
        f.write_str(label)
    }
}

/// Server health as reported under `/Supervision/Health/{server}/Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Good,
    Bad,
    Failed,
}

impl Health {
    pub fn parse(raw: &str) -> Option<Health> {
        match raw {
            "GOOD" => Some(Health::Good),
            "BAD" => Some(Health::Bad),
            "FAILED" => Some(Health::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Health::Good => "GOOD",
            Health::Bad => "BAD",
            Health::Failed => "FAILED",
        }
    }
}

/// Persisted job document (`/Target/{Status}/{jobId}`).
///
/// Optional fields are omitted from the serialized form when unset so that
/// documents written by other processes round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub creator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<String>,
    /// Target server of node-level jobs (CleanOutServer, FailedServer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_leader: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remains_follower: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub try_undo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_target_version: Option<u64>,
    /// Human-readable outcome, set when the job reaches a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JobDocument {
    /// Bare document with only the mandatory fields set.
    pub fn new(job_id: impl Into<String>, job_type: JobType, creator: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            creator: creator.into(),
            database: None,
            collection: None,
            shard: None,
            server: None,
            from_server: None,
            to_server: None,
            is_leader: None,
            remains_follower: None,
            try_undo: None,
            parent_job_id: None,
            time_created: None,
            time_started: None,
            time_finished: None,
            expected_target_version: None,
            reason: None,
        }
    }

    /// Set `database`/`collection`/`shard`.
    pub fn with_shard(
        mut self,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        self.database = Some(database.into());
        self.collection = Some(collection.into());
        self.shard = Some(shard.into());
        self
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_move(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_server = Some(from.into());
        self.to_server = Some(to.into());
        self
    }

    pub fn with_parent(mut self, parent_job_id: impl Into<String>) -> Self {
        self.parent_job_id = Some(parent_job_id.into());
        self
    }

    pub fn created_at(mut self, now: DateTime<Utc>) -> Self {
        self.time_created = Some(now);
        self
    }

    /// Parse a stored document; `None` when it is not a job.
    pub fn from_json(value: &Value) -> Option<JobDocument> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Stored form.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// `(database, collection, shard)` when all three are set.
    pub fn shard_target(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.database.as_deref()?,
            self.collection.as_deref()?,
            self.shard.as_deref()?,
        ))
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.unwrap_or(false)
    }

    pub fn remains_follower(&self) -> bool {
        self.remains_follower.unwrap_or(false)
    }

    pub fn try_undo(&self) -> bool {
        self.try_undo.unwrap_or(false)
    }
}

/// Age bounds after which a job is treated as infeasible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTimeouts {
    pub move_shard_timeout_secs: u64,
    pub clean_out_server_timeout_secs: u64,
    pub failed_leader_timeout_secs: u64,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            move_shard_timeout_secs: 2 * 60 * 60,
            clean_out_server_timeout_secs: 24 * 60 * 60,
            failed_leader_timeout_secs: 60 * 60,
        }
    }
}

impl JobTimeouts {
    /// Bound for `job_type`; `None` for single-phase jobs.
    pub fn for_type(&self, job_type: JobType) -> Option<Duration> {
        let secs = match job_type {
            JobType::MoveShard => self.move_shard_timeout_secs,
            JobType::CleanOutServer => self.clean_out_server_timeout_secs,
            JobType::FailedLeader => self.failed_leader_timeout_secs,
            JobType::AddFollower | JobType::RemoveFollower | JobType::FailedServer => {
                return None;
            }
        };
        Some(Duration::from_secs(secs))
    }
}

/// Result of driving a job by one step.
///
/// Waiting is never blocking: a job that cannot make progress returns
/// `Retry` and is re-evaluated against a fresh snapshot next cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was committed (waiting on Current, lock held, or the write
    /// was rejected).
    Retry { reason: String },
    /// A transaction was committed; the job is still active in `status`.
    Progress { status: JobStatus },
    /// The job reached Finished or Failed.
    Terminal {
        status: JobStatus,
        reason: Option<String>,
    },
}

impl StepOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        StepOutcome::Retry {
            reason: reason.into(),
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, StepOutcome::Retry { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Retry { reason } => write!(f, "retry ({reason})"),
            StepOutcome::Progress { status } => write!(f, "{status}"),
            StepOutcome::Terminal {
                status,
                reason: Some(reason),
            } => write!(f, "{status} ({reason})"),
            StepOutcome::Terminal { status, reason: None } => write!(f, "{status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_document_serializes_protocol_field_names() {
        let doc = JobDocument::new("5", JobType::MoveShard, "supervision")
            .with_shard("db", "coll", "s1")
            .with_move("A", "B");
        let value = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(
            value,
            json!({
                "jobId": "5",
                "type": "moveShard",
                "creator": "supervision",
                "database": "db",
                "collection": "coll",
                "shard": "s1",
                "fromServer": "A",
                "toServer": "B"
            })
        );
    }

    #[test]
    fn job_document_parses_timestamps() {
        let doc: JobDocument = serde_json::from_value(json!({
            "jobId": "1",
            "type": "cleanOutServer",
            "creator": "op",
            "server": "A",
            "timeCreated": "2015-01-03T20:00:00Z"
        }))
        .expect("parse");
        assert_eq!(doc.job_type, JobType::CleanOutServer);
        assert_eq!(
            doc.time_created.map(|t| t.to_rfc3339()),
            Some("2015-01-03T20:00:00+00:00".to_string())
        );
    }

    #[test]
    fn health_parses_known_states_only() {
        assert_eq!(Health::parse("FAILED"), Some(Health::Failed));
        assert_eq!(Health::parse("failed"), None);
    }
}
