//! Builders for the persisted agency paths.
//!
//! These strings are the wire protocol shared with every other process that
//! reads or writes the tree; they must not change.

use crate::core::types::JobStatus;

pub const PLAN_VERSION: &str = "/Plan/Version";
pub const PLAN_COLLECTIONS: &str = "/Plan/Collections";
pub const CURRENT_COLLECTIONS: &str = "/Current/Collections";
pub const HEALTH: &str = "/Supervision/Health";
pub const SHARD_LOCKS: &str = "/Supervision/Shards";
pub const SERVER_LOCKS: &str = "/Supervision/DBServers";
pub const CLEANED_SERVERS: &str = "/Target/CleanedServers";
pub const FAILED_SERVERS: &str = "/Target/FailedServers";
pub const RETURN_LEADERSHIP: &str = "/Target/ReturnLeadership";
pub const LATEST_JOB_ID: &str = "/Target/LatestJobId";
pub const TARGET_VERSION: &str = "/Target/Version";

/// `/Target/{ToDo,Pending,Finished,Failed}`; `None` for `NotFound`.
pub fn job_dir(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::ToDo => Some("/Target/ToDo"),
        JobStatus::Pending => Some("/Target/Pending"),
        JobStatus::Finished => Some("/Target/Finished"),
        JobStatus::Failed => Some("/Target/Failed"),
        JobStatus::NotFound => None,
    }
}

/// `/Target/{Status}/{jobId}`; `None` for `NotFound`.
pub fn job(status: JobStatus, job_id: &str) -> Option<String> {
    job_dir(status).map(|dir| format!("{dir}/{job_id}"))
}

pub fn collection(database: &str, collection: &str) -> String {
    format!("{PLAN_COLLECTIONS}/{database}/{collection}")
}

pub fn planned_servers(database: &str, collection: &str, shard: &str) -> String {
    format!("{PLAN_COLLECTIONS}/{database}/{collection}/shards/{shard}")
}

pub fn current_servers(database: &str, collection: &str, shard: &str) -> String {
    format!("{CURRENT_COLLECTIONS}/{database}/{collection}/{shard}/servers")
}

pub fn health_status(server: &str) -> String {
    format!("{HEALTH}/{server}/Status")
}

pub fn shard_lock(shard: &str) -> String {
    format!("{SHARD_LOCKS}/{shard}")
}

pub fn server_lock(server: &str) -> String {
    format!("{SERVER_LOCKS}/{server}")
}

pub fn failed_server(server: &str) -> String {
    format!("{FAILED_SERVERS}/{server}")
}

pub fn return_leadership(shard: &str) -> String {
    format!("{RETURN_LEADERSHIP}/{shard}")
}
