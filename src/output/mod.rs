//! Output module for harvested data and run reports
//!
//! This module handles:
//! - Writing harvested records through the `DataSink` trait
//! - The on-disk layout of a repository's output folder
//! - Generating the markdown and console summaries of a run
//! - Validating an existing output tree

mod json_sink;
pub mod layout;
mod markdown;
mod stats;
mod traits;
mod validate;

pub use json_sink::JsonFileSink;
pub use markdown::{format_markdown_summary, generate_markdown_summary};
pub use stats::print_summary;
pub use traits::{DataSink, OutputError, OutputResult, RunStatus, RunSummary};
pub use validate::{print_validation_report, validate_output, ValidationReport};
