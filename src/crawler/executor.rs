//! Bounded worker pool
//!
//! Items are polled concurrently on the calling task. The number in flight is
//! `min(max_concurrent, tracker.concurrency_cap())`, re-read after every
//! completion, so the pool shrinks as soon as quota gets tight.

use crate::crawler::rate_limiter::RateLimitTracker;
use crate::crawler::ShutdownSignal;
use crate::state::{CrawlerTask, ItemOutcome};
use crate::HarvestError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long in-flight items may keep running after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// One item of one task
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub task: Arc<CrawlerTask>,
    pub index: usize,
}

impl WorkUnit {
    pub fn new(task: Arc<CrawlerTask>, index: usize) -> Self {
        Self { task, index }
    }

    /// Key of the item, e.g. a pull request number or a commit sha
    pub fn key(&self) -> &str {
        self.task.item_key(self.index).unwrap_or_default()
    }
}

/// What a work function reports back for one item
#[derive(Debug)]
pub enum ItemResult {
    Done(ItemOutcome),
    /// The run must stop
    Fatal(HarvestError),
    /// Shutdown interrupted the item; it stays pending
    Interrupted,
}

/// Counts from one `run` call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Items left pending because of shutdown (interrupted, cut off, or never started)
    pub abandoned: usize,
    pub interrupted: bool,
}

struct Tally {
    report: ExecutionReport,
    fatal: Option<HarvestError>,
    operations: u64,
    checkpoint_interval: u64,
}

impl Tally {
    fn settle(&mut self, unit: WorkUnit, result: ItemResult, on_checkpoint: &mut impl FnMut()) {
        match result {
            ItemResult::Done(outcome) => {
                if !unit.task.record(unit.index, outcome) {
                    return;
                }
                match outcome {
                    ItemOutcome::Completed => self.report.completed += 1,
                    ItemOutcome::Failed => self.report.failed += 1,
                    ItemOutcome::Skipped => self.report.skipped += 1,
                }

                self.operations += 1;
                if self.operations % self.checkpoint_interval == 0 {
                    on_checkpoint();
                }
            }
            ItemResult::Fatal(error) => {
                if self.fatal.is_none() {
                    tracing::error!(
                        task = unit.task.name(),
                        item = unit.key(),
                        "Fatal error, stopping dispatch: {}",
                        error
                    );
                    self.fatal = Some(error);
                }
            }
            ItemResult::Interrupted => self.report.abandoned += 1,
        }
    }
}

/// Runs work items with bounded, quota-aware concurrency
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    tracker: Arc<RateLimitTracker>,
    max_concurrent: usize,
    checkpoint_interval: u64,
    grace: Duration,
    shutdown: ShutdownSignal,
}

impl TaskExecutor {
    /// Creates an executor
    ///
    /// # Arguments
    ///
    /// * `tracker` - Shared quota tracker that caps concurrency
    /// * `max_concurrent` - Configured upper bound on items in flight
    /// * `checkpoint_interval` - Settled items between checkpoint flushes
    /// * `shutdown` - Stops dispatch when triggered
    pub fn new(
        tracker: Arc<RateLimitTracker>,
        max_concurrent: usize,
        checkpoint_interval: u64,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            tracker,
            max_concurrent: max_concurrent.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
            grace: SHUTDOWN_GRACE,
            shutdown,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Current number of items allowed in flight
    pub fn pool_size(&self) -> usize {
        self.max_concurrent.min(self.tracker.concurrency_cap()).max(1)
    }

    /// Runs `work` over `units`
    ///
    /// Each settled item is recorded on its task's item table and counts as one
    /// operation; every `checkpoint_interval` operations `on_checkpoint` runs.
    /// A fatal item stops dispatch, lets in-flight items finish, and is
    /// returned as the error. Shutdown stops dispatch and gives in-flight
    /// items the grace period before they are dropped.
    pub async fn run<W, Fut, C>(
        &self,
        units: Vec<WorkUnit>,
        work: W,
        mut on_checkpoint: C,
    ) -> Result<ExecutionReport, HarvestError>
    where
        W: Fn(WorkUnit) -> Fut,
        Fut: Future<Output = ItemResult>,
        C: FnMut(),
    {
        let mut tally = Tally {
            report: ExecutionReport::default(),
            fatal: None,
            operations: 0,
            checkpoint_interval: self.checkpoint_interval,
        };
        let mut shutdown = self.shutdown.clone();
        let mut queue = units.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if tally.fatal.is_none() && !shutdown.is_triggered() {
                let cap = self.pool_size();
                while in_flight.len() < cap {
                    let Some(unit) = queue.next() else {
                        break;
                    };
                    let item = work(unit.clone());
                    in_flight.push(async move { (unit, item.await) });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((unit, result)) = in_flight.next() => {
                    tally.settle(unit, result, &mut on_checkpoint);
                }
                _ = shutdown.wait(), if !tally.report.interrupted => {
                    tally.report.interrupted = true;
                    tracing::info!(
                        "Shutdown requested; waiting up to {}s for {} in-flight items",
                        self.grace.as_secs(),
                        in_flight.len()
                    );
                }
                else => break,
            }

            if tally.report.interrupted {
                break;
            }
        }

        if tally.report.interrupted || shutdown.is_triggered() {
            tally.report.interrupted = true;

            let drain = async {
                while let Some((unit, result)) = in_flight.next().await {
                    tally.settle(unit, result, &mut on_checkpoint);
                }
            };
            if tokio::time::timeout(self.grace, drain).await.is_err() {
                tracing::warn!(
                    "Abandoning {} in-flight items after the grace period",
                    in_flight.len()
                );
            }
            tally.report.abandoned += in_flight.len() + queue.len();
        }

        match tally.fatal {
            Some(error) => Err(error),
            None => Ok(tally.report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::crawler::shutdown_channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker(conservative: bool) -> Arc<RateLimitTracker> {
        Arc::new(RateLimitTracker::new(
            &RateLimitConfig {
                max_requests_per_hour: 5000,
                rate_limit_buffer: 100,
                max_concurrent_requests: 8,
            },
            conservative,
        ))
    }

    fn task_with(n: usize) -> (Arc<CrawlerTask>, Vec<WorkUnit>) {
        let task = Arc::new(CrawlerTask::new("pr_files", "dependencies"));
        let indices = task.install_items((0..n).map(|i| i.to_string()).collect());
        let units = indices
            .into_iter()
            .map(|i| WorkUnit::new(task.clone(), i))
            .collect();
        (task, units)
    }

    #[tokio::test]
    async fn test_runs_all_items_and_flushes() {
        let executor = TaskExecutor::new(tracker(false), 4, 3, ShutdownSignal::never());
        let (task, units) = task_with(10);
        let mut flushes = 0;

        let report = executor
            .run(
                units,
                |unit| async move {
                    if unit.index == 4 {
                        ItemResult::Done(ItemOutcome::Skipped)
                    } else {
                        ItemResult::Done(ItemOutcome::Completed)
                    }
                },
                || flushes += 1,
            )
            .await
            .unwrap();

        assert_eq!(report.completed, 9);
        assert_eq!(report.skipped, 1);
        assert!(!report.interrupted);
        assert_eq!(flushes, 3);
        assert!(task.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounded_by_tracker_cap() {
        // Conservative mode caps concurrency at 2
        let tracker = tracker(true);
        let executor = TaskExecutor::new(tracker, 8, 50, ShutdownSignal::never());
        let (_task, units) = task_with(12);

        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        executor
            .run(
                units,
                |_unit| {
                    let active = &active;
                    let peak = &peak;
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        ItemResult::Done(ItemOutcome::Completed)
                    }
                },
                || {},
            )
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_unit_counted_once() {
        let executor = TaskExecutor::new(tracker(false), 4, 50, ShutdownSignal::never());
        let (task, mut units) = task_with(2);
        units.push(units[0].clone());

        let report = executor
            .run(
                units,
                |_| async { ItemResult::Done(ItemOutcome::Completed) },
                || {},
            )
            .await
            .unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(task.counters().completed, 2);
    }

    #[tokio::test]
    async fn test_fatal_stops_dispatch() {
        let executor = TaskExecutor::new(tracker(false), 1, 50, ShutdownSignal::never());
        let (task, units) = task_with(5);
        let started = AtomicUsize::new(0);

        let result = executor
            .run(
                units,
                |unit| {
                    started.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if unit.index == 1 {
                            ItemResult::Fatal(HarvestError::Authentication("HTTP 401".into()))
                        } else {
                            ItemResult::Done(ItemOutcome::Completed)
                        }
                    }
                },
                || {},
            )
            .await;

        assert!(matches!(result, Err(HarvestError::Authentication(_))));
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(task.counters().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_items_pending() {
        let (trigger, shutdown) = shutdown_channel();
        let executor = TaskExecutor::new(tracker(false), 2, 50, shutdown)
            .with_grace(Duration::from_secs(5));
        let (task, units) = task_with(6);
        let trigger = &trigger;

        let report = executor
            .run(
                units,
                |unit| async move {
                    match unit.index {
                        0 => {
                            trigger.trigger();
                            ItemResult::Done(ItemOutcome::Completed)
                        }
                        // Never finishes on its own
                        _ => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            ItemResult::Done(ItemOutcome::Completed)
                        }
                    }
                },
                || {},
            )
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.completed, 1);
        assert_eq!(report.abandoned, 5);
        assert_eq!(task.items().unwrap().pending_indices(), vec![1, 2, 3, 4, 5]);
    }
}
