//! Core library for the hone build tool
//!
//! This crate contains the job model, content-addressed caching, the
//! execution engines (local process, container, remote pod), the job
//! graph scheduler, and the orchestration that wires them together.

pub mod cache;
pub mod condition;
pub mod config;
pub mod errors;
pub mod executor;
pub mod fingerprint;
pub mod git;
pub mod graph;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod scm;
pub mod shim;
pub mod variable;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
