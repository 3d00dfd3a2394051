//! Handoff: agent workload handoff runtime.

pub mod config;
pub mod error;
pub mod handoff;
pub mod runtime;
pub mod session_key;
