//! Progress module for run-wide counters and reporting
//!
//! The aggregator reads every task's counters into an immutable snapshot. The
//! same snapshot drives the periodic log line and the final summary.
//! Checkpoint records read the task tables directly, since they also need each
//! task's cursor.

mod aggregator;
mod reporter;

pub use aggregator::{
    ProgressAggregator, ProgressSnapshot, RollingRate, TaskSnapshot, RATE_WINDOW,
};
pub use reporter::{format_duration, format_progress_line, spawn_reporter};
