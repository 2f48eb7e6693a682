//! Checkpoint module for resumable runs
//!
//! This module persists orchestration progress so an interrupted run can resume:
//! - Task statuses, counters, and cursors
//! - Ids discovered by earlier phases
//! - The configuration hash of the run that wrote the record

mod record;
mod store;

pub use record::{
    CheckpointRecord, DiscoveredIds, TaskCheckpoint, TaskCursor, CHECKPOINT_VERSION,
};
pub use store::{CheckpointStore, JsonCheckpointStore, StorageError, StorageResult, CHECKPOINT_FILE};
