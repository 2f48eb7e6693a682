//! Markdown summary generation
//!
//! This module generates the human-readable `summary.md` written at the end
//! of a run: run metadata, overall counts, and a per-task breakdown.

use crate::output::traits::{OutputError, OutputResult, RunSummary};
use std::fs;
use std::path::Path;

/// Writes the markdown summary to `output_path`
///
/// # Arguments
///
/// * `summary` - The run summary
/// * `output_path` - Path where the markdown file should be written
///
/// # Returns
///
/// * `Ok(())` - Successfully wrote markdown summary
/// * `Err(OutputError)` - Failed to write summary
pub fn generate_markdown_summary(summary: &RunSummary, output_path: &Path) -> OutputResult<()> {
    let markdown = format_markdown_summary(summary);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_path, markdown).map_err(|source| OutputError::Write {
        path: output_path.to_path_buf(),
        source,
    })
}

/// Formats a run summary as markdown
pub fn format_markdown_summary(summary: &RunSummary) -> String {
    let mut md = String::new();

    md.push_str(&format!("# Harvest Summary: {}\n\n", summary.repository));

    // Run metadata
    md.push_str("## Run Information\n\n");
    md.push_str(&format!("- **Status**: {}\n", summary.status.as_str()));
    md.push_str(&format!("- **Started**: {}\n", summary.started_at.to_rfc3339()));
    md.push_str(&format!("- **Finished**: {}\n", summary.finished_at.to_rfc3339()));
    md.push_str(&format!(
        "- **Duration**: {} seconds ({:.2} minutes)\n",
        summary.duration_seconds,
        summary.duration_seconds as f64 / 60.0
    ));
    md.push_str(&format!("- **Config Hash**: {}\n", summary.config_hash));
    md.push_str(&format!(
        "- **Quota Left**: {} / {}\n\n",
        summary.quota_remaining, summary.quota_limit
    ));

    // Overall statistics
    md.push_str("## Overall Statistics\n\n");
    md.push_str(&format!("- **Completed**: {}\n", summary.total_completed()));
    md.push_str(&format!("- **Failed**: {}\n", summary.total_failed()));
    md.push_str(&format!("- **Skipped (not found)**: {}\n", summary.total_skipped()));
    md.push_str(&format!("- **Success Rate**: {:.2}%\n", summary.success_rate()));
    let restored = summary.restored_tasks();
    if restored > 0 {
        md.push_str(&format!(
            "- **Tasks Restored From Checkpoint**: {}\n",
            restored
        ));
    }
    md.push('\n');

    // Task breakdown
    md.push_str("## Tasks\n\n");
    md.push_str("| Phase | Task | Status | Total | Completed | Failed | Skipped |\n");
    md.push_str("|-------|------|--------|-------|-----------|--------|---------|\n");
    for task in &summary.tasks {
        let total = task
            .counters
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} |\n",
            task.phase,
            task.name,
            task.status,
            total,
            task.counters.completed,
            task.counters.failed,
            task.counters.skipped
        ));
    }
    md.push('\n');

    let incomplete = summary.incomplete_tasks();
    if !incomplete.is_empty() {
        md.push_str("## Incomplete Tasks\n\n");
        md.push_str("Run again to resume from the checkpoint.\n\n");
        for name in incomplete {
            md.push_str(&format!("- {}\n", name));
        }
        md.push('\n');
    }

    md
}
