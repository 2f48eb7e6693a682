use crate::config::types::{
    ApiConfig, Config, OutputConfig, ProgressConfig, RateLimitConfig, RetryConfig,
};
use crate::ConfigError;
use url::Url;

/// Longest single backoff delay accepted (one day, in seconds)
const MAX_BACKOFF_DELAY_LIMIT: f64 = 86_400.0;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_api_config(&config.api)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_retry_config(&config.retry)?;
    validate_progress_config(&config.progress)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates remote API configuration
fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.items_per_page < 1 || config.items_per_page > 100 {
        return Err(ConfigError::Validation(format!(
            "items_per_page must be between 1 and 100, got {}",
            config.items_per_page
        )));
    }

    if config.request_timeout < 1 {
        return Err(ConfigError::Validation(
            "request_timeout must be >= 1 second".to_string(),
        ));
    }

    Ok(())
}

/// Validates quota and concurrency configuration
fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_requests < 1 || config.max_concurrent_requests > 100 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_requests must be between 1 and 100, got {}",
            config.max_concurrent_requests
        )));
    }

    if config.max_requests_per_hour < 1 {
        return Err(ConfigError::Validation(
            "max_requests_per_hour must be >= 1".to_string(),
        ));
    }

    if config.rate_limit_buffer >= config.max_requests_per_hour {
        return Err(ConfigError::Validation(format!(
            "rate_limit_buffer ({}) must be below max_requests_per_hour ({})",
            config.rate_limit_buffer, config.max_requests_per_hour
        )));
    }

    Ok(())
}

/// Validates retry configuration
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if !config.base_backoff_delay.is_finite() || config.base_backoff_delay <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "base_backoff_delay must be a positive number of seconds, got {}",
            config.base_backoff_delay
        )));
    }

    if !config.max_backoff_delay.is_finite() || config.max_backoff_delay < config.base_backoff_delay
    {
        return Err(ConfigError::Validation(format!(
            "max_backoff_delay ({}) must be >= base_backoff_delay ({})",
            config.max_backoff_delay, config.base_backoff_delay
        )));
    }

    if config.max_backoff_delay > MAX_BACKOFF_DELAY_LIMIT {
        return Err(ConfigError::Validation(format!(
            "max_backoff_delay must be <= {} seconds, got {}",
            MAX_BACKOFF_DELAY_LIMIT, config.max_backoff_delay
        )));
    }

    if config.max_retries > 20 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be <= 20, got {}",
            config.max_retries
        )));
    }

    Ok(())
}

/// Validates progress configuration
fn validate_progress_config(config: &ProgressConfig) -> Result<(), ConfigError> {
    if !config.progress_update_interval.is_finite() || config.progress_update_interval <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "progress_update_interval must be positive, got {}",
            config.progress_update_interval
        )));
    }

    if config.checkpoint_interval < 1 {
        return Err(ConfigError::Validation(
            "checkpoint_interval must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.base_folder.is_empty() {
        return Err(ConfigError::Validation(
            "base_folder cannot be empty".to_string(),
        ));
    }

    Ok(())
}
