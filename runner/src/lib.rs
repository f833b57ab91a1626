//! Generate-execute-repair loop for research code.
//!
//! Given an algorithm description, a generation collaborator produces a small
//! code project, the sandbox executes it under resource limits, and failures
//! are fed to a repair collaborator whose patches produce new revisions until
//! the program runs or the budget is spent. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, retry policy,
//!   merger, error classification). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting components (sandbox, collaborators, artifact
//!   store, configuration).
//!
//! [`pipeline`] drives the core state machine against the I/O components.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
