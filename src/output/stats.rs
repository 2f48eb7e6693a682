//! Console summaries
//!
//! This module prints the end-of-run summary to stdout.

use crate::output::traits::RunSummary;
use crate::progress::format_duration;
use std::time::Duration;

/// Per-phase totals, in plan order
fn phase_totals(summary: &RunSummary) -> Vec<(&str, u64, u64, u64)> {
    let mut phases: Vec<(&str, u64, u64, u64)> = Vec::new();
    for task in &summary.tasks {
        let counters = &task.counters;
        match phases.iter_mut().find(|(name, ..)| *name == task.phase) {
            Some(entry) => {
                entry.1 += counters.completed;
                entry.2 += counters.failed;
                entry.3 += counters.skipped;
            }
            None => phases.push((
                task.phase.as_str(),
                counters.completed,
                counters.failed,
                counters.skipped,
            )),
        }
    }
    phases
}

/// Prints a run summary to stdout
///
/// # Arguments
///
/// * `summary` - The summary to display
pub fn print_summary(summary: &RunSummary) {
    println!("=== Harvest Summary: {} ===\n", summary.repository);

    println!("Run:");
    println!("  Status: {}", summary.status.as_str());
    println!(
        "  Duration: {}",
        format_duration(Duration::from_secs(summary.duration_seconds))
    );
    println!(
        "  Quota left: {} / {}",
        summary.quota_remaining, summary.quota_limit
    );
    println!();

    println!("Phases:");
    for (phase, completed, failed, skipped) in phase_totals(summary) {
        println!(
            "  {}: {} completed, {} failed, {} skipped",
            phase, completed, failed, skipped
        );
    }
    println!();

    println!("Tasks:");
    for task in &summary.tasks {
        let total = task
            .counters
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:<16} {:<10} {}/{} completed, {} failed, {} skipped",
            task.name,
            task.status.as_str(),
            task.counters.completed,
            total,
            task.counters.failed,
            task.counters.skipped
        );
    }
    println!();

    println!(
        "Success Rate: {:.1}% ({} completed, {} failed, {} not found)",
        summary.success_rate(),
        summary.total_completed(),
        summary.total_failed(),
        summary.total_skipped()
    );

    let incomplete = summary.incomplete_tasks();
    if !incomplete.is_empty() {
        println!(
            "Incomplete: {} (run again to resume)",
            incomplete.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::traits::RunStatus;
    use crate::progress::TaskSnapshot;
    use crate::state::{TaskCounters, TaskStatus};
    use chrono::Utc;

    #[test]
    fn test_phase_totals_keep_plan_order() {
        let task = |name: &str, phase: &str, completed: u64| TaskSnapshot {
            name: name.to_string(),
            phase: phase.to_string(),
            status: TaskStatus::Completed,
            counters: TaskCounters {
                total: Some(completed),
                completed,
                failed: 0,
                skipped: 0,
            },
            started_at: None,
            finished_at: None,
        };

        let summary = RunSummary {
            repository: "octo/widgets".to_string(),
            status: RunStatus::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_seconds: 1,
            config_hash: String::new(),
            tasks: vec![
                task("pull_requests", "foundation", 3),
                task("commits", "foundation", 4),
                task("pr_files", "dependencies", 5),
            ],
            quota_remaining: 0,
            quota_limit: 0,
        };

        assert_eq!(
            phase_totals(&summary),
            vec![("foundation", 7, 0, 0), ("dependencies", 5, 0, 0)]
        );
    }
}
