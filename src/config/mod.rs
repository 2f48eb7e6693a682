//! Configuration module for Repo-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every option has a default, so running without a file is valid.
//!
//! # Example
//!
//! ```no_run
//! use repo_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Max concurrent requests: {}", config.rate_limit.max_concurrent_requests);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, Config, OutputConfig, Overrides, ProgressConfig, RateLimitConfig, RetryConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
