//! Data sink trait and run summary types
//!
//! This module defines the interface the orchestrator writes harvested records
//! through, and the summary produced at the end of a run.

use crate::progress::{ProgressSnapshot, TaskSnapshot};
use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {reason}")]
    InvalidJson { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Destination for harvested records
///
/// Paths are relative to the repository's output folder (see `layout`).
/// Implementations must be thread-safe; workers write concurrently.
pub trait DataSink: Send + Sync {
    /// Writes a whole collection, replacing any previous file
    ///
    /// # Arguments
    ///
    /// * `path` - Relative path of the collection file
    /// * `records` - Every record of the collection
    fn write_collection(&self, path: &Path, records: &[Value]) -> OutputResult<()>;

    /// Writes a single record
    fn write_item(&self, path: &Path, record: &Value) -> OutputResult<()>;

    /// Reads back a record written with `write_item`
    ///
    /// Only used on resume to reload listing pages.
    fn read_item(&self, path: &Path) -> OutputResult<Value>;
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

/// Summary of a run, printed to stdout and written as `summary.md`
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub repository: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub config_hash: String,
    pub tasks: Vec<TaskSnapshot>,
    /// Quota left when the run ended
    pub quota_remaining: u32,
    pub quota_limit: u32,
}

impl RunSummary {
    /// Builds a summary from the final progress snapshot
    pub fn from_snapshot(
        repository: impl Into<String>,
        status: RunStatus,
        started_at: DateTime<Utc>,
        config_hash: impl Into<String>,
        snapshot: &ProgressSnapshot,
    ) -> Self {
        Self {
            repository: repository.into(),
            status,
            started_at,
            finished_at: snapshot.taken_at,
            duration_seconds: snapshot.elapsed.as_secs(),
            config_hash: config_hash.into(),
            tasks: snapshot.tasks.clone(),
            quota_remaining: snapshot.quota.remaining,
            quota_limit: snapshot.quota.limit,
        }
    }

    pub fn total_completed(&self) -> u64 {
        self.tasks.iter().map(|t| t.counters.completed).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tasks.iter().map(|t| t.counters.failed).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.tasks.iter().map(|t| t.counters.skipped).sum()
    }

    /// Tasks that did not finish in this or an earlier run
    pub fn incomplete_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_done())
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Completed share of attempted items, as a percentage
    pub fn success_rate(&self) -> f64 {
        let attempted = self.total_completed() + self.total_failed();
        if attempted == 0 {
            return 0.0;
        }
        (self.total_completed() as f64 / attempted as f64) * 100.0
    }

    /// Tasks carried over from an earlier run
    pub fn restored_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Skipped)
            .count()
    }
}
