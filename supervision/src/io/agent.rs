//! Store client abstraction.
//!
//! The [`AgentInterface`] trait decouples the job driver and the supervision
//! loop from the consensus store that holds the agency tree. Tests and the
//! CLI use [`crate::io::memory_agency::InMemoryAgency`].

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Subject to store availability.
    Normal,
    /// Applied even while the store refuses normal writes (fixtures, repair).
    Privileged,
}

/// Outcome of a write of several independent transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Whether the store took the request at all.
    pub accepted: bool,
    /// Log index per transaction; `0` when its preconditions failed.
    pub indices: Vec<u64>,
}

impl WriteResult {
    pub fn rejected(count: usize) -> Self {
        Self {
            accepted: false,
            indices: vec![0; count],
        }
    }

    /// Whether transaction `i` was applied.
    pub fn applied(&self, i: usize) -> bool {
        self.accepted && self.indices.get(i).is_some_and(|index| *index > 0)
    }

    /// Highest index written, if anything was applied.
    pub fn last_index(&self) -> Option<u64> {
        self.indices.iter().copied().filter(|i| *i > 0).max()
    }
}

/// Values read by a multi-path query, one per path (`Null` when absent).
#[derive(Debug, Clone, PartialEq)]
pub struct TransactResult {
    pub accepted: bool,
    pub results: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ok,
    Unknown,
    Timeout,
}

pub trait AgentInterface {
    /// Submit transactions; each is applied atomically or not at all.
    fn write(&self, transactions: &[Transaction], mode: WriteMode) -> Result<WriteResult>;

    /// Read the values at `paths` from one consistent state.
    fn transact(&self, paths: &[String]) -> Result<TransactResult>;

    /// Block until `index` is committed or `timeout` elapses.
    fn wait_for(&self, index: u64, timeout: Duration) -> Result<WaitResult>;

    /// The whole tree as a snapshot.
    fn snapshot(&self) -> Result<Snapshot> {
        let read = self
            .transact(&["/".to_string()])
            .context("read agency snapshot")?;
        if !read.accepted {
            return Err(anyhow!("agency refused snapshot read"));
        }
        let root = read.results.into_iter().next().unwrap_or(Value::Null);
        Ok(Snapshot::new(root))
    }
}
