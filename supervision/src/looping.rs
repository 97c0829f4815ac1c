//! Multi-cycle supervision loop for `supervision simulate`.

use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{info, warn};

use crate::core::jobs;
use crate::io::agent::AgentInterface;
use crate::io::config::SupervisionConfig;
use crate::simulate::sync_current;
use crate::supervision::{CycleReport, run_cycle};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No job is ToDo or Pending and the last cycle changed nothing.
    Quiescent,
    /// The configured number of cycles ran out.
    MaxCycles { max_cycles: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles: u32,
    pub created: usize,
    /// Jobs still ToDo or Pending when the loop stopped.
    pub outstanding: usize,
    pub stop: LoopStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    pub max_cycles: u32,
    /// Sync Current to Plan before every cycle.
    pub simulate_current: bool,
    /// Sleep `interval_ms` between cycles.
    pub pause: bool,
}

/// Run cycles until the cluster is quiescent or `max_cycles` is reached.
///
/// A cycle that fails to reach the store is logged and counted; the loop
/// keeps going with the next one.
pub fn run_loop<A, C, F>(
    agent: &A,
    config: &SupervisionConfig,
    options: LoopOptions,
    rng: &mut dyn RngCore,
    mut clock: C,
    mut on_cycle: F,
) -> Result<LoopOutcome>
where
    A: AgentInterface + ?Sized,
    C: FnMut() -> DateTime<Utc>,
    F: FnMut(u32, &CycleReport),
{
    let mut cycles = 0u32;
    let mut created = 0usize;
    while cycles < options.max_cycles {
        if cycles > 0 && options.pause {
            thread::sleep(config.interval());
        }
        cycles += 1;

        let synced = if options.simulate_current {
            sync_current(agent)?
        } else {
            0
        };
        let report = match run_cycle(agent, config, clock(), rng) {
            Ok(report) => report,
            Err(err) => {
                warn!(cycle = cycles, error = %format!("{err:#}"), "cycle failed");
                continue;
            }
        };
        created += report.created.len();
        on_cycle(cycles, &report);

        if synced == 0 && report.is_idle() && outstanding(agent)? == 0 {
            info!(cycles, "cluster quiescent");
            return Ok(LoopOutcome {
                cycles,
                created,
                outstanding: 0,
                stop: LoopStop::Quiescent,
            });
        }
    }
    Ok(LoopOutcome {
        cycles,
        created,
        outstanding: outstanding(agent)?,
        stop: LoopStop::MaxCycles {
            max_cycles: options.max_cycles,
        },
    })
}

fn outstanding<A: AgentInterface + ?Sized>(agent: &A) -> Result<usize> {
    let snapshot = agent.snapshot().context("read agency snapshot")?;
    Ok(jobs::all_jobs(&snapshot)
        .into_iter()
        .filter(|(status, _)| status.is_active())
        .count())
}
