//! Serializable checkpoint record

use crate::state::{ItemOutcome, TaskCounters, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Format version written into every record; records with another version are ignored
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable snapshot of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,

    /// `owner/name` of the harvested repository
    pub repository: String,

    /// Hash of the effective configuration of the run that wrote the record
    pub config_hash: String,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Wall-clock seconds spent in all runs so far
    #[serde(default)]
    pub runtime_seconds: f64,

    /// Task states keyed by task name
    pub tasks: BTreeMap<String, TaskCheckpoint>,

    #[serde(default)]
    pub discovered: DiscoveredIds,
}

impl CheckpointRecord {
    /// Tasks that had not completed when the record was written
    pub fn incomplete_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|(_, task)| !task.status.is_done())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Persisted state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub status: TaskStatus,
    pub total: Option<u64>,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cursor: TaskCursor,
}

impl TaskCheckpoint {
    pub fn counters(&self) -> TaskCounters {
        TaskCounters {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
        }
    }
}

/// Where a task continues from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskCursor {
    /// Nothing processed yet
    Start,

    /// Listing task: first page not yet persisted
    Page { next_page: u32 },

    /// Item task: items settled so far, keyed by item key
    Items {
        finished: BTreeMap<String, ItemOutcome>,
    },
}

/// Ids discovered by earlier phases
///
/// Secondary ids are recorded before the item that surfaced them is marked
/// complete, so a completed item's ids are always present in the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredIds {
    /// Primary keys per listing (pull request numbers)
    pub primary: BTreeMap<String, Vec<u64>>,

    /// Deduplicated ids needing a detail fetch (commit shas)
    pub secondary: BTreeSet<String>,
}
