//! I/O for the interpreter: runtime processes, the model backend, the host
//! surface, settings and prompt templates.

pub mod backend;
pub mod config;
pub mod host;
pub mod prompt;
pub mod registry;
pub mod runtime;
