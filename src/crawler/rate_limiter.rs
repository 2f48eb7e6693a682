//! Shared quota tracker
//!
//! One `RateLimitTracker` is shared by every worker of a run. It is the only
//! place that knows how much of the hourly quota is left, and it turns that
//! into a throttling mode, a per-request permit, and a concurrency cap.

use crate::config::RateLimitConfig;
use crate::crawler::ShutdownSignal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Remaining quota above which requests go out without delay
const FULL_THRESHOLD: u32 = 1000;

/// Remaining quota below which the tracker turns conservative
const CONSERVATIVE_THRESHOLD: u32 = 200;

/// Delay added before each request in Moderate mode
const MODERATE_DELAY: Duration = Duration::from_millis(100);

/// Minimum delay between requests in Conservative mode
const CONSERVATIVE_MIN_DELAY: Duration = Duration::from_secs(1);

/// Extra wait after the reset time before requests resume
const RESET_SAFETY_MARGIN_SECS: i64 = 60;

/// Wait applied after a rejection that carried no reset time
const UNKNOWN_RESET_WAIT_SECS: i64 = 60;

/// Quota information carried by one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// `X-RateLimit-Remaining`
    pub remaining: u32,
    /// `X-RateLimit-Limit`
    pub limit: u32,
    /// `X-RateLimit-Reset`
    pub reset_at: DateTime<Utc>,
}

/// Throttling mode, ordered from least to most conservative
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mode {
    Full,
    Moderate,
    Conservative,
    Exhausted,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Moderate => "moderate",
            Self::Conservative => "conservative",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer to "may I send a request now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Send immediately
    Proceed,
    /// Sleep this long, then send
    Delay(Duration),
    /// Quota is spent; sleep until this instant and ask again
    WaitUntil(DateTime<Utc>),
}

/// Read-only view of the tracker, used for progress reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSnapshot {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub mode: Mode,
    pub sticky_conservative: bool,
    /// Deadline of an active quota wait, if any worker is waiting
    pub wait_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RateLimitState {
    remaining: u32,
    limit: u32,
    reset_at: DateTime<Utc>,
    sticky_conservative: bool,
    /// False while `reset_at` is a local estimate rather than a server value
    reset_known: bool,
    wait_until: Option<DateTime<Utc>>,
}

/// Shared quota tracker
#[derive(Debug)]
pub struct RateLimitTracker {
    state: Mutex<RateLimitState>,
    max_requests_per_hour: u32,
    buffer: u32,
    max_concurrent: usize,
}

impl RateLimitTracker {
    /// Creates a tracker that assumes a full budget until the first response
    ///
    /// # Arguments
    ///
    /// * `config` - Quota configuration
    /// * `conservative` - Start (and stay) in conservative mode
    pub fn new(config: &RateLimitConfig, conservative: bool) -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                remaining: config.max_requests_per_hour,
                limit: config.max_requests_per_hour,
                reset_at: Utc::now() + ChronoDuration::hours(1),
                sticky_conservative: conservative,
                reset_known: false,
                wait_until: None,
            }),
            max_requests_per_hour: config.max_requests_per_hour,
            buffer: config.rate_limit_buffer,
            max_concurrent: config.max_concurrent_requests.max(1) as usize,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateLimitState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Updates the shared state from a response's quota headers
    ///
    /// Within one reset window the remaining count only goes down; a reading
    /// from an older window is ignored and a newer window replaces the state.
    /// While the reset time is only estimated, any reading replaces it.
    pub fn observe(&self, quota: QuotaHeaders) {
        let mut state = self.lock();

        if !state.reset_known || quota.reset_at > state.reset_at {
            state.remaining = quota.remaining;
            state.limit = quota.limit;
            state.reset_at = quota.reset_at;
            state.reset_known = true;
        } else if quota.reset_at == state.reset_at {
            state.remaining = state.remaining.min(quota.remaining);
            state.limit = quota.limit;
        }
    }

    /// Records a quota rejection (HTTP 403/429)
    ///
    /// Quota is treated as spent until `reset_at` (or a short fixed wait when the
    /// server gave no reset time) and the tracker stays conservative for the
    /// rest of the run.
    pub fn record_rejection(&self, reset_at: Option<DateTime<Utc>>) {
        let mut state = self.lock();
        let now = Utc::now();

        state.sticky_conservative = true;
        state.remaining = 0;

        match reset_at.filter(|at| *at > now) {
            Some(at) => {
                state.reset_at = at;
                state.reset_known = true;
            }
            None if state.reset_at <= now => {
                state.reset_at = now + ChronoDuration::seconds(UNKNOWN_RESET_WAIT_SECS);
                state.reset_known = false;
            }
            None => {}
        }

        tracing::warn!(
            "Quota rejected by server; waiting for reset at {} and staying conservative",
            state.reset_at
        );
    }

    fn effective_remaining(&self, state: &RateLimitState) -> u32 {
        let reserved = state.limit.saturating_sub(self.max_requests_per_hour);
        state.remaining.saturating_sub(reserved)
    }

    fn mode_of(&self, state: &RateLimitState) -> Mode {
        let remaining = self.effective_remaining(state);
        if remaining == 0 || remaining <= self.buffer {
            Mode::Exhausted
        } else if state.sticky_conservative || remaining < CONSERVATIVE_THRESHOLD {
            Mode::Conservative
        } else if remaining <= FULL_THRESHOLD {
            Mode::Moderate
        } else {
            Mode::Full
        }
    }

    /// Marks the window that ended at `reset_at` as over
    fn roll_window(&self, state: &mut RateLimitState, now: DateTime<Utc>) {
        let deadline = state.reset_at + ChronoDuration::seconds(RESET_SAFETY_MARGIN_SECS);
        if now >= deadline && self.mode_of(state) == Mode::Exhausted {
            state.remaining = state.limit;
            state.reset_at = now + ChronoDuration::hours(1);
            state.reset_known = false;
            state.wait_until = None;
        }
    }

    /// Current throttling mode
    pub fn mode(&self) -> Mode {
        let state = self.lock();
        self.mode_of(&state)
    }

    /// Asks for permission to send one request
    ///
    /// A granted permit reserves one unit of quota.
    pub fn acquire(&self) -> Permit {
        let mut state = self.lock();
        let now = Utc::now();
        self.roll_window(&mut state, now);

        let remaining = self.effective_remaining(&state);
        let permit = match self.mode_of(&state) {
            Mode::Exhausted => {
                let until = state.reset_at + ChronoDuration::seconds(RESET_SAFETY_MARGIN_SECS);
                state.wait_until = Some(until);
                return Permit::WaitUntil(until);
            }
            Mode::Conservative => {
                let to_reset = (state.reset_at - now).to_std().unwrap_or_default();
                let spread = to_reset / remaining.max(1);
                Permit::Delay(spread.max(CONSERVATIVE_MIN_DELAY))
            }
            Mode::Moderate => Permit::Delay(MODERATE_DELAY),
            Mode::Full => Permit::Proceed,
        };

        state.remaining = state.remaining.saturating_sub(1);
        state.wait_until = None;
        permit
    }

    /// Waits until a request may be sent
    ///
    /// Only the calling worker sleeps. Returns false if shutdown was requested
    /// while waiting.
    pub async fn wait_for_permit(&self, shutdown: &mut ShutdownSignal) -> bool {
        loop {
            if shutdown.is_triggered() {
                return false;
            }

            let pause = match self.acquire() {
                Permit::Proceed => return true,
                Permit::Delay(delay) => {
                    return tokio::select! {
                        _ = tokio::time::sleep(delay) => true,
                        _ = shutdown.wait() => false,
                    };
                }
                Permit::WaitUntil(until) => until,
            };

            let sleep_for = (pause - Utc::now()).to_std().unwrap_or_default();
            tracing::info!(
                "Quota exhausted; pausing until {} ({:.0}s)",
                pause,
                sleep_for.as_secs_f64()
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => self.window_elapsed(pause),
                _ = shutdown.wait() => return false,
            }
        }
    }

    /// Called once a worker has slept through a quota wait ending at `until`
    fn window_elapsed(&self, until: DateTime<Utc>) {
        let mut state = self.lock();
        let deadline = state.reset_at + ChronoDuration::seconds(RESET_SAFETY_MARGIN_SECS);
        if deadline <= until && self.mode_of(&state) == Mode::Exhausted {
            state.remaining = state.limit;
            state.reset_at = until + ChronoDuration::hours(1);
            state.reset_known = false;
            state.wait_until = None;
        }
    }

    /// Number of requests allowed in flight right now
    pub fn concurrency_cap(&self) -> usize {
        let max = self.max_concurrent;
        match self.mode() {
            Mode::Full => max,
            Mode::Moderate => (max / 2).max(1),
            Mode::Conservative => max.min(2),
            Mode::Exhausted => 1,
        }
    }

    /// Batch size for batched phases
    pub fn batch_size(&self, max: usize) -> usize {
        match self.mode() {
            Mode::Full => max.min(20),
            Mode::Moderate => 10,
            Mode::Conservative => 5,
            Mode::Exhausted => 1,
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.lock();
        RateLimitSnapshot {
            remaining: state.remaining,
            limit: state.limit,
            reset_at: state.reset_at,
            mode: self.mode_of(&state),
            sticky_conservative: state.sticky_conservative,
            wait_until: state.wait_until,
        }
    }
}
