//! Deterministic, pure logic shared by the interpreter core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod code_block;
pub mod decision;
pub mod followup;
pub mod harness;
pub mod model_info;
pub mod tool_calls;
pub mod types;
