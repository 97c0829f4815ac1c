//! Single-process agency store.
//!
//! Evaluates each transaction's preconditions against the current tree and
//! applies its operations atomically, assigning consecutive log indices to
//! applied transactions. Every applied transaction is kept in a log so tests
//! can count the writes a job made.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::snapshot::{self, Snapshot};
use crate::core::transaction::Transaction;
use crate::io::agent::{AgentInterface, TransactResult, WaitResult, WriteMode, WriteResult};

/// One applied transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub transaction: Transaction,
}

#[derive(Debug)]
struct State {
    root: Value,
    index: u64,
    log: Vec<LogEntry>,
    available: bool,
}

#[derive(Debug)]
pub struct InMemoryAgency {
    state: Mutex<State>,
}

impl Default for InMemoryAgency {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl InMemoryAgency {
    pub fn new(root: Value) -> Self {
        Self {
            state: Mutex::new(State {
                root,
                index: 0,
                log: Vec::new(),
                available: true,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("agency state lock poisoned"))
    }

    /// Copy of the whole tree.
    pub fn root(&self) -> Result<Value> {
        Ok(self.lock()?.root.clone())
    }

    /// Applied transactions in commit order.
    pub fn log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.lock()?.log.clone())
    }

    /// Highest index handed out so far.
    pub fn last_index(&self) -> Result<u64> {
        Ok(self.lock()?.index)
    }

    /// While unavailable, `Normal` writes and reads are refused.
    pub fn set_available(&self, available: bool) -> Result<()> {
        self.lock()?.available = available;
        Ok(())
    }

    /// Overwrite one path outside any transaction, as another process would.
    pub fn seed(&self, path: &str, value: Value) -> Result<()> {
        let mut tx = Transaction::new();
        tx.set(path, value);
        self.write(&[tx], WriteMode::Privileged)?;
        Ok(())
    }

    /// Remove one path outside any transaction.
    pub fn remove(&self, path: &str) -> Result<()> {
        let mut tx = Transaction::new();
        tx.delete(path);
        self.write(&[tx], WriteMode::Privileged)?;
        Ok(())
    }
}

impl AgentInterface for InMemoryAgency {
    fn write(&self, transactions: &[Transaction], mode: WriteMode) -> Result<WriteResult> {
        let mut state = self.lock()?;
        if !state.available && mode == WriteMode::Normal {
            debug!(count = transactions.len(), "agency unavailable, write refused");
            return Ok(WriteResult::rejected(transactions.len()));
        }
        let mut indices = Vec::with_capacity(transactions.len());
        for tx in transactions {
            if let Err(reason) = tx.check(&state.root) {
                debug!(%reason, "transaction rejected");
                indices.push(0);
                continue;
            }
            tx.apply(&mut state.root);
            state.index += 1;
            let index = state.index;
            state.log.push(LogEntry {
                index,
                transaction: tx.clone(),
            });
            indices.push(index);
        }
        Ok(WriteResult {
            accepted: true,
            indices,
        })
    }

    fn transact(&self, paths: &[String]) -> Result<TransactResult> {
        let state = self.lock()?;
        if !state.available {
            return Ok(TransactResult {
                accepted: false,
                results: Vec::new(),
            });
        }
        let results = paths
            .iter()
            .map(|path| {
                snapshot::lookup(&state.root, path)
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect();
        Ok(TransactResult {
            accepted: true,
            results,
        })
    }

    fn wait_for(&self, index: u64, _timeout: Duration) -> Result<WaitResult> {
        let state = self.lock()?;
        if index <= state.index {
            Ok(WaitResult::Ok)
        } else {
            Ok(WaitResult::Unknown)
        }
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let state = self.lock()?;
        if !state.available {
            return Err(anyhow!("agency unavailable"));
        }
        Ok(Snapshot::new(state.root.clone()))
    }
}
