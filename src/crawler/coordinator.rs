//! Crawler coordinator - main harvest orchestration logic
//!
//! This module drives a `CrawlJob` from start to finish, including:
//! - Restoring task state from the checkpoint store
//! - Running the phases of the plan in order
//! - Handing fetched records to the data sink
//! - Flushing checkpoints and handling interruption
//! - Producing the final run summary

use crate::checkpoint::{
    CheckpointRecord, CheckpointStore, TaskCheckpoint, TaskCursor, CHECKPOINT_VERSION,
};
use crate::config::Config;
use crate::crawler::executor::{ItemResult, TaskExecutor, WorkUnit};
use crate::crawler::fetcher::{FetchError, RemoteApi};
use crate::crawler::phase::{
    extract_primary_keys, extract_secondary_ids, DependencyKind, DiscoveryLog, ListingKind, Phase,
    PhaseKind, TaskKind,
};
use crate::crawler::rate_limiter::RateLimitTracker;
use crate::crawler::retry::{ErrorClass, Outcome, RetryController, RetryPolicy};
use crate::crawler::{CrawlJob, ShutdownSignal};
use crate::output::{layout, DataSink, RunStatus, RunSummary};
use crate::progress::{format_duration, spawn_reporter, ProgressAggregator};
use crate::state::{CrawlerTask, ItemOutcome, TaskStatus};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a run ended, with its summary
#[derive(Debug)]
pub enum RunOutcome {
    /// Every phase finished; the checkpoint was deleted
    Completed(RunSummary),
    /// Shutdown was requested; the checkpoint was saved
    Interrupted(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            Self::Completed(summary) | Self::Interrupted(summary) => summary,
        }
    }
}

/// Whether a phase ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Finished,
    Interrupted,
}

/// A task of the plan together with what it fetches
struct PlannedTask {
    kind: TaskKind,
    task: Arc<CrawlerTask>,
}

/// Main harvest coordinator
pub struct Coordinator {
    job: CrawlJob,
    config: Arc<Config>,
    config_hash: String,
    api: Arc<dyn RemoteApi>,
    sink: Arc<dyn DataSink>,
    store: Arc<dyn CheckpointStore>,
    shutdown: ShutdownSignal,
    tracker: Arc<RateLimitTracker>,
    retry: RetryController,
    executor: TaskExecutor,
    tasks: Vec<PlannedTask>,
    aggregator: Arc<ProgressAggregator>,
    discovered: DiscoveryLog,
    started_at: DateTime<Utc>,
    previous_runtime: f64,
    run_started: Instant,
}

impl Coordinator {
    /// Creates a coordinator and restores any previous progress
    ///
    /// # Arguments
    ///
    /// * `job` - Repository, run options and plan
    /// * `config` - Validated configuration
    /// * `config_hash` - Hash of `config`, stored in checkpoints
    /// * `api` - Remote API client
    /// * `sink` - Destination for harvested records
    /// * `store` - Checkpoint backend for this repository
    /// * `shutdown` - Requests a graceful stop
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(HarvestError)` - The checkpoint could not be read or cleared
    pub fn new(
        job: CrawlJob,
        config: Arc<Config>,
        config_hash: impl Into<String>,
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn DataSink>,
        store: Arc<dyn CheckpointStore>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, HarvestError> {
        let config_hash = config_hash.into();
        let tracker = Arc::new(RateLimitTracker::new(
            &config.rate_limit,
            job.options.conservative,
        ));
        let retry = RetryController::new(
            RetryPolicy::from_config(&config.retry),
            tracker.clone(),
            shutdown.clone(),
        );
        let executor = TaskExecutor::new(
            tracker.clone(),
            job.options.max_concurrent,
            u64::from(config.progress.checkpoint_interval),
            shutdown.clone(),
        );

        let tasks: Vec<PlannedTask> = job
            .plan
            .tasks()
            .map(|(phase, spec)| PlannedTask {
                kind: spec.kind,
                task: Arc::new(CrawlerTask::new(spec.name, phase)),
            })
            .collect();

        let record = if job.options.resume {
            store.load()?
        } else {
            store.clear()?;
            tracing::info!("Ignoring any previous checkpoint (--no-resume)");
            None
        };

        let mut started_at = Utc::now();
        let mut previous_runtime = 0.0;
        let mut discovered = DiscoveryLog::default();

        if let Some(record) = record {
            if record.config_hash != config_hash {
                tracing::warn!(
                    "Configuration changed since the checkpoint was written ({} -> {})",
                    record.config_hash,
                    config_hash
                );
            }

            for planned in &tasks {
                let Some(saved) = record.tasks.get(planned.task.name()) else {
                    continue;
                };
                let (next_page, finished) = match &saved.cursor {
                    TaskCursor::Start => (None, BTreeMap::new()),
                    TaskCursor::Page { next_page } => (Some(*next_page), BTreeMap::new()),
                    TaskCursor::Items { finished } => (None, finished.clone()),
                };
                planned
                    .task
                    .restore(saved.status, saved.counters(), next_page, finished)?;
            }

            let incomplete = record.incomplete_tasks();
            tracing::info!(
                "Resuming {} from checkpoint: {} incomplete tasks [{}], {} spent in earlier runs",
                record.repository,
                incomplete.len(),
                incomplete.join(", "),
                format_duration(Duration::from_secs_f64(record.runtime_seconds.max(0.0)))
            );

            started_at = record.started_at;
            previous_runtime = record.runtime_seconds;
            discovered = DiscoveryLog::new(record.discovered);
        }

        let aggregator = Arc::new(ProgressAggregator::new(
            tasks.iter().map(|planned| planned.task.clone()).collect(),
            tracker.clone(),
        ));

        Ok(Self {
            job,
            config,
            config_hash,
            api,
            sink,
            store,
            shutdown,
            tracker,
            retry,
            executor,
            tasks,
            aggregator,
            discovered,
            started_at,
            previous_runtime,
            run_started: Instant::now(),
        })
    }

    /// Shared quota tracker of this run
    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.aggregator
    }

    /// Runs every phase of the plan
    ///
    /// On success the checkpoint is deleted. On interruption or a fatal error
    /// a final checkpoint is written so the next run resumes.
    pub async fn run(&self) -> Result<RunOutcome, HarvestError> {
        tracing::info!(
            "Starting harvest of {} ({} phases, up to {} concurrent requests)",
            self.job.repository,
            self.job.plan.phases().len(),
            self.job.options.max_concurrent
        );

        let interval = Duration::from_secs_f64(self.config.progress.progress_update_interval);
        let reporter = spawn_reporter(self.aggregator.clone(), interval);
        let result = self.run_phases().await;
        reporter.abort();

        match result {
            Ok(Flow::Finished) => {
                self.store.clear()?;
                let summary = self.summary(RunStatus::Completed);
                tracing::info!(
                    "Harvest of {} complete: {} completed, {} failed, {} not found",
                    self.job.repository,
                    summary.total_completed(),
                    summary.total_failed(),
                    summary.total_skipped()
                );
                Ok(RunOutcome::Completed(summary))
            }
            Ok(Flow::Interrupted) => {
                self.checkpoint()?;
                tracing::info!("Harvest interrupted; checkpoint saved, run again to resume");
                Ok(RunOutcome::Interrupted(self.summary(RunStatus::Interrupted)))
            }
            Err(e) => {
                if let Err(save) = self.checkpoint() {
                    tracing::error!("Failed to save checkpoint after fatal error: {}", save);
                }
                Err(e)
            }
        }
    }

    /// Summary of the run so far
    pub fn summary(&self, status: RunStatus) -> RunSummary {
        RunSummary::from_snapshot(
            self.job.repository.to_string(),
            status,
            self.started_at,
            self.config_hash.as_str(),
            &self.aggregator.snapshot(),
        )
    }

    async fn run_phases(&self) -> Result<Flow, HarvestError> {
        for phase in self.job.plan.phases() {
            if self.shutdown.is_triggered() {
                return Ok(Flow::Interrupted);
            }

            tracing::info!("Phase '{}' ({:?}) starting", phase.name, phase.kind);
            let flow = match phase.kind {
                PhaseKind::Sequential => self.run_sequential(phase).await?,
                PhaseKind::FanOut => self.run_fan_out(phase).await?,
                PhaseKind::Batched => self.run_batched(phase).await?,
            };

            self.checkpoint()?;
            if flow == Flow::Interrupted {
                return Ok(Flow::Interrupted);
            }

            let counters = self.aggregator.snapshot().phase_counters(phase.name);
            tracing::info!(
                "Phase '{}' finished: {} completed, {} failed, {} skipped",
                phase.name,
                counters.completed,
                counters.failed,
                counters.skipped
            );
        }
        Ok(Flow::Finished)
    }

    /// Planned tasks of `phase` that still need work in this run
    fn phase_tasks<'a>(&'a self, phase: &'a Phase) -> impl Iterator<Item = &'a PlannedTask> + 'a {
        self.tasks
            .iter()
            .filter(move |planned| planned.task.phase() == phase.name)
            .filter(|planned| {
                if planned.task.status() == TaskStatus::Skipped {
                    tracing::info!(
                        task = planned.task.name(),
                        "Skipping task: completed in a previous run"
                    );
                    false
                } else {
                    true
                }
            })
    }

    fn per_page(&self) -> u32 {
        self.config.api.items_per_page
    }

    // ===== Phase 1: listings =====

    async fn run_sequential(&self, phase: &Phase) -> Result<Flow, HarvestError> {
        for planned in self.phase_tasks(phase) {
            let TaskKind::Listing(kind) = planned.kind else {
                continue;
            };

            planned.task.transition(TaskStatus::Running)?;
            match self.run_listing(&planned.task, kind).await {
                Ok(Flow::Finished) => {}
                Ok(Flow::Interrupted) => return Ok(Flow::Interrupted),
                Err(e) => {
                    planned.task.transition(TaskStatus::Failed)?;
                    return Err(e);
                }
            }
        }
        Ok(Flow::Finished)
    }

    /// Reloads the pages a previous run persisted, up to the task's cursor
    ///
    /// Returns the first page that still has to be fetched.
    fn reload_pages(&self, task: &CrawlerTask, kind: ListingKind, records: &mut Vec<Value>) -> u32 {
        let resume_from = task.next_page();
        let mut page = 1;

        while page < resume_from {
            match self.sink.read_item(&layout::listing_page(kind, page)) {
                Ok(Value::Array(items)) => {
                    self.note_listing_page(kind, &items);
                    task.record_listed(items.len() as u64);
                    records.extend(items);
                    page += 1;
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        task = task.name(),
                        "Persisted page {} is unreadable, fetching from there",
                        page
                    );
                    break;
                }
            }
        }

        if page > 1 {
            tracing::info!(
                task = task.name(),
                "Reloaded {} records from {} persisted pages",
                records.len(),
                page - 1
            );
        }
        task.set_next_page(page);
        page
    }

    fn note_listing_page(&self, kind: ListingKind, items: &[Value]) {
        self.discovered
            .add_secondary(extract_secondary_ids(TaskKind::Listing(kind), items));
    }

    async fn run_listing(&self, task: &CrawlerTask, kind: ListingKind) -> Result<Flow, HarvestError> {
        let repo = &self.job.repository;
        let per_page = self.per_page();
        let mut records = Vec::new();
        let mut page = self.reload_pages(task, kind, &mut records);

        loop {
            if self.shutdown.is_triggered() {
                return Ok(Flow::Interrupted);
            }

            let label = format!("{} page {}", task.name(), page);
            let outcome = self
                .retry
                .attempt(&label, || self.api.list_page(repo, kind, page, per_page))
                .await;

            let items = match outcome {
                Outcome::Success(response) => match response.body {
                    Value::Array(items) => items,
                    _ => {
                        return Err(self.phase_failure(
                            task,
                            format!("page {} is not a JSON array", page),
                        ))
                    }
                },
                Outcome::Skipped(_) if page == 1 => {
                    return Err(HarvestError::RepositoryNotFound(repo.to_string()))
                }
                Outcome::Skipped(_) => {
                    tracing::debug!(task = task.name(), "Page {} not found, listing ends", page);
                    break;
                }
                Outcome::Failed(e) => {
                    return Err(self.phase_failure(task, format!("page {}: {}", page, e)))
                }
                Outcome::Fatal(e) => return Err(fatal_error(e)),
                Outcome::Interrupted => return Ok(Flow::Interrupted),
            };

            let count = items.len();
            self.sink
                .write_collection(&layout::listing_page(kind, page), &items)?;
            self.note_listing_page(kind, &items);
            task.record_listed(count as u64);
            records.extend(items);
            page += 1;
            task.set_next_page(page);
            tracing::debug!(task = task.name(), "Fetched page {} ({} records)", page - 1, count);

            if count < per_page as usize {
                break;
            }
            self.checkpoint_quietly();
        }

        task.finish_listing();
        self.sink
            .write_collection(&layout::listing_collection(kind), &records)?;
        if kind == ListingKind::PullRequests {
            self.discovered
                .set_primary(kind.task_name(), extract_primary_keys(&records));
        }
        task.transition(TaskStatus::Completed)?;

        tracing::info!(task = task.name(), "Listed {} records", records.len());
        Ok(Flow::Finished)
    }

    fn phase_failure(&self, task: &CrawlerTask, reason: String) -> HarvestError {
        tracing::error!(task = task.name(), phase = task.phase(), "Listing failed: {}", reason);
        HarvestError::PhaseFailed {
            phase: task.phase().to_string(),
            task: task.name().to_string(),
            reason,
        }
    }

    // ===== Phase 2: pull request dependencies =====

    async fn run_fan_out(&self, phase: &Phase) -> Result<Flow, HarvestError> {
        let numbers = self
            .discovered
            .primary(ListingKind::PullRequests.task_name());
        let keys: Vec<String> = numbers.iter().map(u64::to_string).collect();

        let mut kinds: HashMap<String, DependencyKind> = HashMap::new();
        let mut active = Vec::new();
        let mut units = Vec::new();

        for planned in self.phase_tasks(phase) {
            let TaskKind::Dependency(kind) = planned.kind else {
                continue;
            };
            planned.task.transition(TaskStatus::Running)?;
            kinds.insert(planned.task.name().to_string(), kind);

            let pending = planned.task.install_items(keys.clone());
            tracing::info!(
                task = planned.task.name(),
                "{} pull requests, {} left to fetch",
                keys.len(),
                pending.len()
            );
            units.extend(
                pending
                    .into_iter()
                    .map(|index| WorkUnit::new(planned.task.clone(), index)),
            );
            active.push(planned.task.clone());
        }

        // Same pull request across kinds before moving on
        units.sort_by_key(|unit| unit.index);

        let report = self
            .executor
            .run(
                units,
                |unit| {
                    let kind = kinds.get(unit.task.name()).copied();
                    self.fetch_dependency(unit, kind)
                },
                || self.checkpoint_quietly(),
            )
            .await?;

        if report.interrupted {
            return Ok(Flow::Interrupted);
        }
        for task in active {
            task.transition(TaskStatus::Completed)?;
        }
        Ok(Flow::Finished)
    }

    async fn fetch_dependency(&self, unit: WorkUnit, kind: Option<DependencyKind>) -> ItemResult {
        let task = &unit.task;
        let (Some(kind), Ok(number)) = (kind, unit.key().parse::<u64>()) else {
            tracing::warn!(task = task.name(), item = unit.key(), "Unusable work item");
            return ItemResult::Done(ItemOutcome::Failed);
        };

        let repo = &self.job.repository;
        let per_page = self.per_page();
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let label = format!("{} #{} page {}", task.name(), number, page);
            let outcome = self
                .retry
                .attempt(&label, || {
                    self.api.list_dependency(repo, kind, number, page, per_page)
                })
                .await;

            match outcome {
                Outcome::Success(response) => {
                    let Value::Array(items) = response.body else {
                        log_item_failure(
                            &unit,
                            ErrorClass::MalformedResponse,
                            &format!("page {} is not a JSON array", page),
                        );
                        return ItemResult::Done(ItemOutcome::Failed);
                    };
                    let count = items.len();
                    records.extend(items);
                    if count < per_page as usize {
                        break;
                    }
                    page += 1;
                }
                Outcome::Skipped(_) if page > 1 => break,
                Outcome::Skipped(e) => {
                    tracing::debug!(
                        task = task.name(),
                        phase = task.phase(),
                        item = unit.key(),
                        "Not found: {}",
                        e
                    );
                    return ItemResult::Done(ItemOutcome::Skipped);
                }
                Outcome::Failed(e) => {
                    log_item_failure(&unit, ErrorClass::of(&e), &e.to_string());
                    return ItemResult::Done(ItemOutcome::Failed);
                }
                Outcome::Fatal(e) => return ItemResult::Fatal(fatal_error(e)),
                Outcome::Interrupted => return ItemResult::Interrupted,
            }
        }

        if let Err(e) = self
            .sink
            .write_collection(&layout::dependency_collection(number, kind), &records)
        {
            tracing::error!(task = task.name(), item = unit.key(), "Write failed: {}", e);
            return ItemResult::Done(ItemOutcome::Failed);
        }

        // Ids go in before the item is recorded complete
        self.discovered
            .add_secondary(extract_secondary_ids(TaskKind::Dependency(kind), &records));

        tracing::debug!(
            task = task.name(),
            item = unit.key(),
            "Fetched {} records",
            records.len()
        );
        ItemResult::Done(ItemOutcome::Completed)
    }

    // ===== Phase 3: commit details =====

    async fn run_batched(&self, phase: &Phase) -> Result<Flow, HarvestError> {
        for planned in self.phase_tasks(phase) {
            if planned.kind != TaskKind::Detail {
                continue;
            }
            let task = &planned.task;
            task.transition(TaskStatus::Running)?;

            let ids: Vec<String> = self.discovered.secondary().into_iter().collect();
            let total = ids.len();
            let mut pending = task.install_items(ids).into_iter().peekable();
            tracing::info!(
                task = task.name(),
                "{} unique commits, {} left to fetch",
                total,
                pending.len()
            );

            while pending.peek().is_some() {
                if self.shutdown.is_triggered() {
                    return Ok(Flow::Interrupted);
                }

                let size = self.tracker.batch_size(self.job.options.max_concurrent);
                let batch: Vec<WorkUnit> = pending
                    .by_ref()
                    .take(size)
                    .map(|index| WorkUnit::new(task.clone(), index))
                    .collect();
                tracing::debug!(
                    task = task.name(),
                    "Batch of {} ({} mode)",
                    batch.len(),
                    self.tracker.mode()
                );

                let report = self
                    .executor
                    .run(
                        batch,
                        |unit| self.fetch_detail(unit),
                        || self.checkpoint_quietly(),
                    )
                    .await?;
                self.checkpoint()?;

                if report.interrupted {
                    return Ok(Flow::Interrupted);
                }
            }

            task.transition(TaskStatus::Completed)?;
        }
        Ok(Flow::Finished)
    }

    async fn fetch_detail(&self, unit: WorkUnit) -> ItemResult {
        let sha = unit.key();
        let label = format!("{} {}", unit.task.name(), sha);
        let outcome = self
            .retry
            .attempt(&label, || self.api.fetch_detail(&self.job.repository, sha))
            .await;

        match outcome {
            Outcome::Success(response) => {
                if !response.body.is_object() {
                    log_item_failure(
                        &unit,
                        ErrorClass::MalformedResponse,
                        "commit record is not a JSON object",
                    );
                    return ItemResult::Done(ItemOutcome::Failed);
                }
                match self.sink.write_item(&layout::detail_item(sha), &response.body) {
                    Ok(()) => {
                        tracing::debug!(task = unit.task.name(), item = sha, "Fetched commit");
                        ItemResult::Done(ItemOutcome::Completed)
                    }
                    Err(e) => {
                        tracing::error!(task = unit.task.name(), item = sha, "Write failed: {}", e);
                        ItemResult::Done(ItemOutcome::Failed)
                    }
                }
            }
            Outcome::Skipped(e) => {
                tracing::debug!(task = unit.task.name(), item = sha, "Not found: {}", e);
                ItemResult::Done(ItemOutcome::Skipped)
            }
            Outcome::Failed(e) => {
                log_item_failure(&unit, ErrorClass::of(&e), &e.to_string());
                ItemResult::Done(ItemOutcome::Failed)
            }
            Outcome::Fatal(e) => ItemResult::Fatal(fatal_error(e)),
            Outcome::Interrupted => ItemResult::Interrupted,
        }
    }

    // ===== Checkpointing =====

    /// Builds a checkpoint record from the live task state
    ///
    /// Task tables are read before the discovered ids, so every completed item
    /// in the record has its ids present as well.
    pub fn build_record(&self) -> CheckpointRecord {
        let mut tasks = BTreeMap::new();
        for planned in &self.tasks {
            let task = &planned.task;
            let counters = task.counters();
            let cursor = match task.page_cursor() {
                Some(next_page) => TaskCursor::Page { next_page },
                None => {
                    let finished = task.finished_items();
                    if finished.is_empty() {
                        TaskCursor::Start
                    } else {
                        TaskCursor::Items { finished }
                    }
                }
            };

            tasks.insert(
                task.name().to_string(),
                TaskCheckpoint {
                    status: task.status(),
                    total: counters.total,
                    completed: counters.completed,
                    failed: counters.failed,
                    skipped: counters.skipped,
                    cursor,
                },
            );
        }

        CheckpointRecord {
            version: CHECKPOINT_VERSION,
            repository: self.job.repository.to_string(),
            config_hash: self.config_hash.clone(),
            started_at: self.started_at,
            updated_at: Utc::now(),
            runtime_seconds: self.previous_runtime + self.run_started.elapsed().as_secs_f64(),
            tasks,
            discovered: self.discovered.snapshot(),
        }
    }

    fn checkpoint(&self) -> Result<(), HarvestError> {
        self.store.save(&self.build_record())?;
        tracing::trace!("Checkpoint saved");
        Ok(())
    }

    /// Periodic flush; a failure is logged and the run goes on
    fn checkpoint_quietly(&self) {
        if let Err(e) = self.checkpoint() {
            tracing::warn!("Checkpoint flush failed: {}", e);
        }
    }
}

fn fatal_error(error: FetchError) -> HarvestError {
    HarvestError::Authentication(error.to_string())
}

fn log_item_failure(unit: &WorkUnit, class: ErrorClass, reason: &str) {
    tracing::warn!(
        task = unit.task.name(),
        phase = unit.task.phase(),
        item = unit.key(),
        class = %class,
        "Item failed: {}",
        reason
    );
}
