use crate::crawler::{RateLimitSnapshot, RateLimitTracker};
use crate::state::{CrawlerTask, TaskCounters, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Window over which the completion rate is measured
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Completed-items-per-second over a sliding window
#[derive(Debug)]
pub struct RollingRate {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RollingRate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records the cumulative completed count at `at`
    pub fn sample(&mut self, at: Instant, completed: u64) {
        self.samples.push_back((at, completed));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at.duration_since(oldest) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Items per second across the window; 0 until two samples exist
    pub fn per_second(&self) -> f64 {
        let (Some(&(first_at, first)), Some(&(last_at, last))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last.saturating_sub(first) as f64 / elapsed
    }
}

/// State of one task at snapshot time
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub name: String,
    pub phase: String,
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Immutable view of the run's progress
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub taken_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub tasks: Vec<TaskSnapshot>,
    /// Completed items per second over the rate window
    pub rate: f64,
    pub quota: RateLimitSnapshot,
}

impl ProgressSnapshot {
    /// Σ completed and Σ (total − skipped) over tasks with a known total
    ///
    /// Skipped items are work that does not exist remotely, so they leave the
    /// denominator.
    pub fn overall(&self) -> (u64, u64) {
        self.tasks
            .iter()
            .filter_map(|task| {
                let total = task.counters.total?;
                Some((
                    task.counters.completed,
                    total.saturating_sub(task.counters.skipped),
                ))
            })
            .fold((0, 0), |(done, of), (c, t)| (done + c, of + t))
    }

    /// Overall progress as a fraction in 0..=1, None while nothing is known
    pub fn overall_fraction(&self) -> Option<f64> {
        let (done, of) = self.overall();
        (of > 0).then(|| done as f64 / of as f64)
    }

    /// Items not yet settled across tasks with a known total
    pub fn remaining(&self) -> Option<u64> {
        let mut known = false;
        let mut remaining = 0;
        for task in &self.tasks {
            if let Some(total) = task.counters.total {
                known = true;
                remaining += total.saturating_sub(task.counters.settled());
            }
        }
        known.then_some(remaining)
    }

    /// Estimated time to finish the known work at the current rate
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.remaining()?;
        if self.rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / self.rate))
    }

    /// Snapshot of the named task
    pub fn task(&self, name: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|task| task.name == name)
    }

    /// Counters summed over every task of `phase`
    pub fn phase_counters(&self, phase: &str) -> TaskCounters {
        self.tasks
            .iter()
            .filter(|task| task.phase == phase)
            .fold(TaskCounters::default(), |mut acc, task| {
                acc.total = match (acc.total, task.counters.total) {
                    (Some(a), Some(b)) => Some(a + b),
                    (None, Some(b)) => Some(b),
                    (a, None) => a,
                };
                acc.completed += task.counters.completed;
                acc.failed += task.counters.failed;
                acc.skipped += task.counters.skipped;
                acc
            })
    }
}

/// Collects counters from every task of a run
#[derive(Debug)]
pub struct ProgressAggregator {
    tasks: Vec<Arc<CrawlerTask>>,
    tracker: Arc<RateLimitTracker>,
    started: Instant,
    rate: Mutex<RollingRate>,
}

impl ProgressAggregator {
    /// Creates an aggregator over `tasks`, in plan order
    pub fn new(tasks: Vec<Arc<CrawlerTask>>, tracker: Arc<RateLimitTracker>) -> Self {
        Self {
            tasks,
            tracker,
            started: Instant::now(),
            rate: Mutex::new(RollingRate::new(RATE_WINDOW)),
        }
    }

    pub fn tasks(&self) -> &[Arc<CrawlerTask>] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Arc<CrawlerTask>> {
        self.tasks.iter().find(|task| task.name() == name)
    }

    /// Takes a snapshot and feeds the rolling rate
    pub fn snapshot(&self) -> ProgressSnapshot {
        let tasks: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|task| TaskSnapshot {
                name: task.name().to_string(),
                phase: task.phase().to_string(),
                status: task.status(),
                counters: task.counters(),
                started_at: task.started_at(),
                finished_at: task.finished_at(),
            })
            .collect();

        // Tasks restored as done did no work in this run
        let completed: u64 = tasks
            .iter()
            .filter(|task| task.status != TaskStatus::Skipped)
            .map(|task| task.counters.completed)
            .sum();

        let rate = {
            let mut rate = self
                .rate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            rate.sample(Instant::now(), completed);
            rate.per_second()
        };

        ProgressSnapshot {
            taken_at: Utc::now(),
            elapsed: self.started.elapsed(),
            tasks,
            rate,
            quota: self.tracker.snapshot(),
        }
    }
}
