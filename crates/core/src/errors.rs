//! Error types and handling
//!
//! Errors are partitioned by origin (configuration, graph, cache, executor)
//! so the orchestrator can decide what is fatal at start versus what is
//! recorded per job and counted into the exit code.

use thiserror::Error;

/// Domain errors for the build orchestrator
#[derive(Error, Debug)]
pub enum HoneError {
    /// Configuration-related errors (invalid job, bad Honefile, bad engine)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    ConfigParse { message: String },

    /// Graph-level errors (missing target, cycles)
    #[error("{message}")]
    Graph { message: String },

    /// Synthesized when an upstream job errored; carries the ancestor names
    #[error("Failed dependencies: [{}]", .failed.join(" "))]
    DependencyFailure { failed: Vec<String> },

    /// Cache I/O, network, or decoding errors
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Executor errors (nonzero exit, pod failure, daemon unreachable)
    #[error("Executor error: {message}")]
    Executor { message: String },

    /// I/O error with no more specific classification
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HoneError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }
}

/// Convenience type alias for Results with HoneError
pub type Result<T> = std::result::Result<T, HoneError>;
