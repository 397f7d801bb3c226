//! Stable exit codes for orchestrator CLI commands.

use crate::error::ErrorKind;

/// Command succeeded (lint: no violations).
pub const OK: i32 = 0;
/// Invalid input, config or other unexpected errors.
pub const INVALID: i32 = 1;
/// `orchestrator lint` found violations.
pub const VIOLATIONS: i32 = 2;
/// `orchestrator exec` ran the command and it exited nonzero or failed to spawn.
pub const EXECUTION_FAILED: i32 = 3;
/// `orchestrator exec` killed the command at its deadline.
pub const TIMED_OUT: i32 = 4;

/// Exit code for a failed command surfaced as `kind`.
pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Timeout => TIMED_OUT,
        ErrorKind::Execution => EXECUTION_FAILED,
        _ => INVALID,
    }
}
