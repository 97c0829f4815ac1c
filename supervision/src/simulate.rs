//! Current-follows-Plan simulator.
//!
//! Stands in for the database servers: every reachable server in a shard's
//! Plan reports itself in Current, in Plan order. A shard whose planned
//! leader is FAILED keeps its old Current, since nobody can report for it.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;

use crate::core::cluster;
use crate::core::snapshot::Snapshot;
use crate::core::transaction::Transaction;
use crate::core::types::Health;
use crate::io::agent::{AgentInterface, WriteMode};

/// Current updates that bring every shard in line with its Plan.
pub fn current_updates(snap: &Snapshot) -> Transaction {
    let mut tx = Transaction::new();
    for shard in cluster::all_shards(snap) {
        let Some(plan) = cluster::planned(snap, &shard) else {
            continue;
        };
        let reachable = |server: &String| cluster::health(snap, server) != Some(Health::Failed);
        match plan.first() {
            Some(leader) if reachable(leader) => {}
            _ => continue,
        }
        let servers: Vec<String> = plan
            .iter()
            .filter(|server| reachable(*server))
            .cloned()
            .collect();
        if cluster::current(snap, &shard) != servers {
            tx.set(shard.current_path(), json!(servers));
        }
    }
    tx
}

/// Apply [`current_updates`] to the store. Returns how many shards changed.
pub fn sync_current<A: AgentInterface + ?Sized>(agent: &A) -> Result<usize> {
    let snap = agent.snapshot().context("read agency snapshot")?;
    let tx = current_updates(&snap);
    let changed = tx.operations().count();
    if changed == 0 {
        return Ok(0);
    }
    agent
        .write(std::slice::from_ref(&tx), WriteMode::Privileged)
        .context("write simulated Current")?;
    debug!(changed, "current synced to plan");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Operation;
    use crate::io::memory_agency::InMemoryAgency;

    fn snapshot(plan: serde_json::Value, leader_health: &str) -> Snapshot {
        Snapshot::new(json!({
            "Plan": {"Collections": {"db": {"c": {"shards": {"s1": plan}}}}},
            "Current": {"Collections": {"db": {"c": {"s1": {"servers": ["A"]}}}}},
            "Supervision": {"Health": {
                "A": {"Status": leader_health},
                "B": {"Status": "GOOD"},
                "C": {"Status": "FAILED"}
            }}
        }))
    }

    /// Failed followers are left out and resigned leaders keep their prefix.
    #[test]
    fn current_mirrors_reachable_plan_entries() {
        let tx = current_updates(&snapshot(json!(["_A", "C", "B"]), "GOOD"));
        assert_eq!(
            tx.operation("/Current/Collections/db/c/s1/servers"),
            Some(&Operation::Set(json!(["_A", "B"])))
        );
    }

    /// A shard led by a FAILED server is not touched.
    #[test]
    fn failed_leader_freezes_current() {
        let tx = current_updates(&snapshot(json!(["A", "B"]), "FAILED"));
        assert!(tx.is_empty());
    }

    /// Syncing twice changes nothing the second time.
    #[test]
    fn sync_is_idempotent() {
        let agency = InMemoryAgency::new(snapshot(json!(["A", "B"]), "GOOD").root().clone());
        assert_eq!(sync_current(&agency).expect("sync"), 1);
        assert_eq!(sync_current(&agency).expect("sync"), 0);
        assert_eq!(
            agency.root().expect("root")["Current"]["Collections"]["db"]["c"]["s1"]["servers"],
            json!(["A", "B"])
        );
    }
}
