//! Deterministic, pure logic for the generate-execute-repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod machine;
pub mod merge;
pub mod project;
pub mod retry;
pub mod types;
