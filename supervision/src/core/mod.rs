//! Deterministic, pure logic shared by the supervision loop.
//!
//! Core modules must be free of I/O side effects. They operate on an
//! immutable [`snapshot::Snapshot`], an explicit clock value and an injected
//! RNG, and return transactions or decisions suitable for tests.

pub mod checks;
pub mod cluster;
pub mod invariants;
pub mod jobs;
pub mod paths;
pub mod snapshot;
pub mod transaction;
pub mod types;
