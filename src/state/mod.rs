//! State module for tracking crawl progress
//!
//! This module provides state management for tasks and their work items during a run.
//!
//! # Components
//!
//! - `TaskStatus`: Lifecycle of a crawler task (pending, running, completed, ...)
//! - `ItemOutcome`: Terminal outcome of a single work item
//! - `CrawlerTask`: Counters, cursor, and item table of one extraction unit
//! - `ItemTable`: Index-addressed arena of a task's work items

mod task;
mod task_state;

// Re-export main types
pub use task::{CrawlerTask, ItemTable, TaskCounters};
pub use task_state::{ItemOutcome, TaskStatus};
