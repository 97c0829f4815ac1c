//! Supervision configuration stored in `supervision.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::JobTimeouts;

/// Supervision configuration (TOML).
///
/// Meant to be edited by operators. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Creator id written into jobs the loop creates.
    pub creator: String,

    /// Pause between cycles when driving a live store.
    pub interval_ms: u64,

    /// Upper bound on jobs created in a single cycle.
    pub max_new_jobs_per_cycle: usize,

    /// How long to wait for the job creation transaction to commit.
    pub wait_for_commit_ms: u64,

    /// Schedule AddFollower/RemoveFollower for shards whose replica count
    /// differs from the replication factor.
    pub enforce_replication_factor: bool,

    /// Seed for server selection; random when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,

    pub jobs: JobTimeouts,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            creator: "supervision".to_string(),
            interval_ms: 1000,
            max_new_jobs_per_cycle: 32,
            wait_for_commit_ms: 5000,
            enforce_replication_factor: true,
            rng_seed: None,
            jobs: JobTimeouts::default(),
        }
    }
}

impl SupervisionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.creator.trim().is_empty() {
            return Err(anyhow!("creator must be non-empty"));
        }
        if self.max_new_jobs_per_cycle == 0 {
            return Err(anyhow!("max_new_jobs_per_cycle must be > 0"));
        }
        if self.jobs.move_shard_timeout_secs == 0 {
            return Err(anyhow!("jobs.move_shard_timeout_secs must be > 0"));
        }
        if self.jobs.clean_out_server_timeout_secs == 0 {
            return Err(anyhow!("jobs.clean_out_server_timeout_secs must be > 0"));
        }
        if self.jobs.failed_leader_timeout_secs == 0 {
            return Err(anyhow!("jobs.failed_leader_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn wait_for_commit(&self) -> Duration {
        Duration::from_millis(self.wait_for_commit_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisionConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisionConfig> {
    if !path.exists() {
        let cfg = SupervisionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Replace `path` with `contents` via a sibling temp file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
