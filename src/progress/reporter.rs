use crate::progress::aggregator::{ProgressAggregator, ProgressSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Formats a duration as `1h02m03s` / `2m03s` / `3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// One progress line for the log
pub fn format_progress_line(snapshot: &ProgressSnapshot) -> String {
    let (done, of) = snapshot.overall();
    let percent = snapshot
        .overall_fraction()
        .map(|f| format!("{:.1}%", f * 100.0))
        .unwrap_or_else(|| "?".to_string());
    let eta = snapshot
        .eta()
        .map(format_duration)
        .unwrap_or_else(|| "unknown".to_string());

    let running: Vec<&str> = snapshot
        .tasks
        .iter()
        .filter(|task| task.status == crate::state::TaskStatus::Running)
        .map(|task| task.name.as_str())
        .collect();

    let mut line = format!(
        "Progress: {}/{} items ({}), {:.2} items/s, ETA {}, quota {}/{} ({})",
        done,
        of,
        percent,
        snapshot.rate,
        eta,
        snapshot.quota.remaining,
        snapshot.quota.limit,
        snapshot.quota.mode
    );
    if !running.is_empty() {
        line.push_str(&format!(", running: {}", running.join(", ")));
    }
    if let Some(until) = snapshot.quota.wait_until {
        line.push_str(&format!(", waiting for quota reset until {}", until));
    }
    line
}

/// Spawns a task that logs a progress line every `interval`
///
/// The caller aborts the returned handle when the run ends.
pub fn spawn_reporter(aggregator: Arc<ProgressAggregator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let snapshot = aggregator.snapshot();
            tracing::info!("{}", format_progress_line(&snapshot));
        }
    })
}
