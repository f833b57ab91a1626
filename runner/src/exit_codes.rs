//! Stable exit codes for `paperloop` commands.

use crate::core::types::RunStatus;

/// Command succeeded; for `run`, the program executed successfully.
pub const OK: i32 = 0;
/// Invalid input, configuration or artifact layout, or an unrecorded error.
pub const INVALID: i32 = 1;
/// `paperloop run` spent its attempt budget on program failures.
pub const EXHAUSTED: i32 = 2;
/// `paperloop run` ended fatally (environment, collaborator or cancellation).
pub const FATAL: i32 = 3;

pub fn for_status(status: &RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => OK,
        RunStatus::Exhausted => EXHAUSTED,
        RunStatus::Fatal { .. } => FATAL,
    }
}
