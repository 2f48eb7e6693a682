//! Retry/backoff controller
//!
//! # Retry Logic
//!
//! | Class | Action |
//! |-------|--------|
//! | Transient network / timeout | Retry after `min(base * 2^n, max)`, up to `max_retries` |
//! | Server (5xx) | Same as transient |
//! | Quota (403/429) | Not counted; wait for the quota reset, then retry |
//! | Not found (404/410/422) | Skip the item |
//! | Malformed response | Fail the item |
//! | Authentication (401) | Abort the run |

use crate::config::RetryConfig;
use crate::crawler::fetcher::{ApiResponse, FetchError, FetchResult};
use crate::crawler::rate_limiter::RateLimitTracker;
use crate::crawler::ShutdownSignal;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Error taxonomy the retry table is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransientNetwork,
    Server,
    QuotaExceeded,
    NotFound,
    MalformedResponse,
    Authentication,
}

impl ErrorClass {
    pub fn of(error: &FetchError) -> Self {
        match error {
            FetchError::Network(_) | FetchError::Timeout => Self::TransientNetwork,
            FetchError::Server { .. } => Self::Server,
            FetchError::QuotaExceeded { .. } => Self::QuotaExceeded,
            FetchError::NotFound { .. } => Self::NotFound,
            FetchError::Malformed(_) | FetchError::Rejected { .. } => Self::MalformedResponse,
            FetchError::Authentication { .. } => Self::Authentication,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::Server => "server",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NotFound => "not_found",
            Self::MalformedResponse => "malformed_response",
            Self::Authentication => "authentication",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Sleep, then try again
    Retry(Duration),
    /// Wait for the quota to reset, then try again; does not use up a retry
    AwaitQuota,
    /// Give up on the item as absent
    Skip,
    /// Give up on the item as failed
    Fail,
    /// Stop the whole run
    Abort,
}

/// Backoff parameters and the retry table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs_f64(config.base_backoff_delay),
            max_delay: Duration::from_secs_f64(config.max_backoff_delay),
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Looks up the action for an error class after `retries` retries so far
    pub fn action_for(&self, class: ErrorClass, retries: u32) -> RetryAction {
        match class {
            ErrorClass::TransientNetwork | ErrorClass::Server => {
                if retries < self.max_retries {
                    RetryAction::Retry(self.backoff(retries))
                } else {
                    RetryAction::Fail
                }
            }
            ErrorClass::QuotaExceeded => RetryAction::AwaitQuota,
            ErrorClass::NotFound => RetryAction::Skip,
            ErrorClass::MalformedResponse => RetryAction::Fail,
            ErrorClass::Authentication => RetryAction::Abort,
        }
    }
}

/// Bookkeeping for one logical call across its attempts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryAttempt {
    /// Attempts sent, including the first
    pub attempts: u32,
    /// Retries used up (quota waits are not counted)
    pub retries: u32,
    pub last_class: Option<ErrorClass>,
    pub next_delay: Option<Duration>,
}

/// Result of a call after all retries
#[derive(Debug)]
pub enum Outcome {
    Success(ApiResponse),
    /// The resource is absent
    Skipped(FetchError),
    /// Retries exhausted or the response was unusable
    Failed(FetchError),
    /// The run must stop
    Fatal(FetchError),
    /// Shutdown was requested while waiting
    Interrupted,
}

/// Runs remote calls through the quota tracker and the retry table
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    tracker: Arc<RateLimitTracker>,
    shutdown: ShutdownSignal,
}

impl RetryController {
    pub fn new(
        policy: RetryPolicy,
        tracker: Arc<RateLimitTracker>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            policy,
            tracker,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Performs `op` until it succeeds or the retry table gives up
    ///
    /// A permit is acquired before every attempt, and quota headers of every
    /// response, successful or not, are fed to the tracker.
    ///
    /// # Arguments
    ///
    /// * `label` - Describes the call in log lines
    /// * `op` - Sends one request
    pub async fn attempt<F, Fut>(&self, label: &str, mut op: F) -> Outcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchResult<ApiResponse>>,
    {
        let mut shutdown = self.shutdown.clone();
        let mut state = RetryAttempt::default();

        loop {
            if !self.tracker.wait_for_permit(&mut shutdown).await {
                return Outcome::Interrupted;
            }

            state.attempts += 1;
            let error = match op().await {
                Ok(response) => {
                    if let Some(quota) = response.quota {
                        self.tracker.observe(quota);
                    }
                    return Outcome::Success(response);
                }
                Err(error) => error,
            };

            if let Some(quota) = error.quota() {
                self.tracker.observe(quota);
            }

            let class = ErrorClass::of(&error);
            state.last_class = Some(class);

            match self.policy.action_for(class, state.retries) {
                RetryAction::Retry(delay) => {
                    state.retries += 1;
                    state.next_delay = Some(delay);
                    tracing::warn!(
                        class = %class,
                        "{} failed ({}); retry {}/{} in {:.0}s",
                        label,
                        error,
                        state.retries,
                        self.policy.max_retries,
                        delay.as_secs_f64()
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => return Outcome::Interrupted,
                    }
                }
                RetryAction::AwaitQuota => {
                    let reset_at = match &error {
                        FetchError::QuotaExceeded { reset_at, .. } => *reset_at,
                        _ => None,
                    };
                    self.tracker.record_rejection(reset_at);
                }
                RetryAction::Skip => return Outcome::Skipped(error),
                RetryAction::Fail => {
                    if state.retries > 0 {
                        tracing::warn!(
                            class = %class,
                            "{} failed after {} attempts: {}",
                            label,
                            state.attempts,
                            error
                        );
                    }
                    return Outcome::Failed(error);
                }
                RetryAction::Abort => return Outcome::Fatal(error),
            }
        }
    }
}
