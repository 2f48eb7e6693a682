//! Repo-Harvest: a quota-aware repository history harvester
//!
//! This crate extracts the collaboration history of a repository (pull requests,
//! commits, reviews, files, comments) from a paginated, rate-limited REST API.
//! Work is split into dependency-ordered phases, throttled against a single shared
//! quota budget, and checkpointed so an interrupted run resumes without re-fetching
//! completed items.

pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod output;
pub mod progress;
pub mod state;

use thiserror::Error;

/// Main error type for Repo-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Missing credential: set the {0} environment variable")]
    MissingCredential(&'static str),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Phase '{phase}' failed: task '{task}' could not complete: {reason}")]
    PhaseFailed {
        phase: String,
        task: String,
        reason: String,
    },

    #[error("Invalid task transition for '{task}': {from:?} -> {to:?}")]
    InvalidTransition {
        task: String,
        from: state::TaskStatus,
        to: state::TaskStatus,
    },

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::StorageError),

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Repo-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, CrawlJob, CrawlPlan, RepositoryKey, RunOptions};
pub use state::{ItemOutcome, TaskStatus};
