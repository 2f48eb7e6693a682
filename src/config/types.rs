use serde::Deserialize;

/// Main configuration structure for Repo-Harvest
///
/// Every section is optional in the TOML file; missing keys fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub progress: ProgressConfig,
    pub output: OutputConfig,
}

/// Remote API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the REST API
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Page size for paginated listings (the API caps this at 100)
    #[serde(rename = "items-per-page")]
    pub items_per_page: u32,

    /// Per-request timeout (seconds)
    #[serde(rename = "request-timeout")]
    pub request_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            items_per_page: 100,
            request_timeout: 30,
        }
    }
}

/// Quota and concurrency configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Self-imposed hourly budget; headroom above it is never spent
    #[serde(rename = "max-requests-per-hour")]
    pub max_requests_per_hour: u32,

    /// Remaining-quota floor at which workers stop and wait for the reset
    #[serde(rename = "rate-limit-buffer")]
    pub rate_limit_buffer: u32,

    /// Upper bound on concurrently in-flight requests
    #[serde(rename = "max-concurrent-requests")]
    pub max_concurrent_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_hour: 4800,
            rate_limit_buffer: 100,
            max_concurrent_requests: 10,
        }
    }
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed for transient and server errors
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Delay before the first retry (seconds)
    #[serde(rename = "base-backoff-delay")]
    pub base_backoff_delay: f64,

    /// Ceiling on any single backoff delay (seconds)
    #[serde(rename = "max-backoff-delay")]
    pub max_backoff_delay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_delay: 60.0,
            max_backoff_delay: 300.0,
        }
    }
}

/// Progress reporting and checkpoint cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Seconds between progress reports
    #[serde(rename = "progress-update-interval")]
    pub progress_update_interval: f64,

    /// Completed operations between checkpoint flushes
    #[serde(rename = "checkpoint-interval")]
    pub checkpoint_interval: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            progress_update_interval: 1.0,
            checkpoint_interval: 50,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root folder; each repository gets `<owner>-<repo>` below it
    #[serde(rename = "base-folder")]
    pub base_folder: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_folder: "crawled-data".to_string(),
        }
    }
}

/// Command-line overrides applied on top of the file configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    /// `--conservative`
    pub conservative: bool,

    /// `--max-concurrent <N>`
    pub max_concurrent: Option<u32>,
}

impl Config {
    /// Applies CLI overrides. Callers re-validate afterwards.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if overrides.conservative {
            self.rate_limit.max_concurrent_requests =
                self.rate_limit.max_concurrent_requests.min(5);
            self.rate_limit.rate_limit_buffer = self.rate_limit.rate_limit_buffer.max(500);
        }

        if let Some(max) = overrides.max_concurrent {
            self.rate_limit.max_concurrent_requests = max;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.items_per_page, 100);
        assert_eq!(config.rate_limit.max_requests_per_hour, 4800);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.progress.checkpoint_interval, 50);
        assert_eq!(config.output.base_folder, "crawled-data");
    }

    #[test]
    fn test_conservative_override() {
        let mut config = Config::default();
        config.apply_overrides(Overrides {
            conservative: true,
            max_concurrent: None,
        });
        assert_eq!(config.rate_limit.max_concurrent_requests, 5);
        assert_eq!(config.rate_limit.rate_limit_buffer, 500);
    }

    #[test]
    fn test_max_concurrent_override_wins() {
        let mut config = Config::default();
        config.apply_overrides(Overrides {
            conservative: true,
            max_concurrent: Some(3),
        });
        assert_eq!(config.rate_limit.max_concurrent_requests, 3);
    }
}
