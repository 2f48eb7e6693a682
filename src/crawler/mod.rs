//! Crawler module for quota-aware repository harvesting
//!
//! This module contains the core orchestration logic, including:
//! - The remote API client and error classification
//! - Shared quota tracking and request throttling
//! - Retry/backoff for transient failures
//! - The bounded worker pool
//! - Phase planning and overall run coordination

mod coordinator;
mod executor;
mod fetcher;
mod phase;
mod rate_limiter;
mod retry;

pub use coordinator::{Coordinator, RunOutcome};
pub use executor::{ExecutionReport, ItemResult, TaskExecutor, WorkUnit};
pub use fetcher::{
    build_http_client, parse_quota_headers, ApiResponse, Credential, FetchError, FetchResult,
    GitHubClient, RemoteApi, TOKEN_ENV,
};
pub use phase::{
    extract_primary_keys, extract_secondary_ids, CrawlPlan, DependencyKind, DiscoveryLog,
    ListingKind, Phase, PhaseKind, TaskKind, TaskSpec,
};
pub use rate_limiter::{Mode, Permit, QuotaHeaders, RateLimitSnapshot, RateLimitTracker};
pub use retry::{ErrorClass, Outcome, RetryAction, RetryAttempt, RetryController, RetryPolicy};

use std::fmt;
use tokio::sync::watch;

/// Repository being harvested, `owner/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryKey {
    pub owner: String,
    pub name: String,
}

impl RepositoryKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parses `owner/name`
    pub fn parse(s: &str) -> Option<Self> {
        let (owner, name) = s.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    /// Folder name used for this repository's output, `owner-name`
    pub fn folder_name(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Per-run options chosen on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound on in-flight requests
    pub max_concurrent: usize,

    /// Stay in conservative throttling for the whole run
    pub conservative: bool,

    /// Continue from an existing checkpoint
    pub resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            conservative: false,
            resume: true,
        }
    }
}

/// Everything a run needs to know about what to harvest
#[derive(Debug, Clone)]
pub struct CrawlJob {
    pub repository: RepositoryKey,
    pub options: RunOptions,
    pub plan: CrawlPlan,
}

impl CrawlJob {
    /// Creates a job with the standard three-phase plan
    pub fn new(repository: RepositoryKey, options: RunOptions) -> Self {
        Self {
            repository,
            options,
            plan: CrawlPlan::standard(),
        }
    }

    pub fn with_plan(mut self, plan: CrawlPlan) -> Self {
        self.plan = plan;
        self
    }
}

/// Sending half of the shutdown channel
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Asks every holder of a `ShutdownSignal` to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half of the shutdown channel; cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_trigger, signal) = shutdown_channel();
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested
    ///
    /// If the trigger is dropped without firing, this never resolves.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a connected shutdown trigger and signal
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}
