//! Stable exit codes for supervision CLI commands.

/// Command succeeded; for `simulate`, the cluster reached quiescence.
pub const OK: i32 = 0;
/// Invalid agency file, config or arguments, or an invariant violation.
pub const INVALID: i32 = 1;
/// `simulate` ran out of cycles with jobs still ToDo or Pending.
pub const OUTSTANDING: i32 = 2;
