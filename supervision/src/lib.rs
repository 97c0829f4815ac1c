//! Cluster supervision: persisted maintenance jobs over a replicated
//! configuration tree (the agency).
//!
//! Jobs (AddFollower, RemoveFollower, MoveShard, CleanOutServer,
//! FailedServer, FailedLeader) live as documents under `/Target/{ToDo,
//! Pending,Finished,Failed}` and advance one conditional transaction at a
//! time. A periodic supervision cycle drives them and creates new ones. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (job decisions, scheduling,
//!   invariants) over an immutable snapshot, an explicit clock and an
//!   injected RNG. No I/O.
//! - **[`io`]**: The store boundary ([`io::agent::AgentInterface`]), the
//!   in-memory store, files and configuration.
//!
//! Orchestration modules ([`job`], [`supervision`], [`looping`],
//! [`simulate`]) submit the transactions core decides on.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod job;
pub mod logging;
pub mod looping;
pub mod simulate;
pub mod supervision;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
