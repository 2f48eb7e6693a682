//! Repo-Harvest main entry point
//!
//! This is the command-line interface for the Repo-Harvest repository history
//! harvester.

use anyhow::Context;
use clap::Parser;
use repo_harvest::checkpoint::JsonCheckpointStore;
use repo_harvest::config::{compute_config_hash, load_config_with_hash, validate, Config, Overrides};
use repo_harvest::crawler::{
    shutdown_channel, Coordinator, CrawlJob, Credential, GitHubClient, RepositoryKey, RunOptions,
    RunOutcome, TOKEN_ENV,
};
use repo_harvest::output::{
    generate_markdown_summary, layout, print_summary, print_validation_report, validate_output,
    JsonFileSink, RunStatus, RunSummary,
};
use repo_harvest::HarvestError;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Repo-Harvest: a quota-aware repository history harvester
///
/// Repo-Harvest downloads the pull requests, commits, reviews, files and
/// comments of a GitHub repository while staying inside the API quota. An
/// interrupted run resumes from its checkpoint without re-fetching finished
/// work.
#[derive(Parser, Debug)]
#[command(name = "repo-harvest")]
#[command(version)]
#[command(about = "A quota-aware repository history harvester", long_about = None)]
struct Cli {
    /// Repository owner (user or organization)
    #[arg(long, required_unless_present = "examples")]
    owner: Option<String>,

    /// Repository name
    #[arg(long, required_unless_present = "examples")]
    repo: Option<String>,

    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Throttle harder for the whole run (at most 5 concurrent requests)
    #[arg(long)]
    conservative: bool,

    /// Start over, deleting any existing checkpoint
    #[arg(long)]
    no_resume: bool,

    /// Check the existing output folder and exit
    #[arg(long)]
    validate_only: bool,

    /// Upper bound on concurrent requests
    #[arg(long, value_name = "N")]
    max_concurrent: Option<u32>,

    /// Print usage examples and exit
    #[arg(long)]
    examples: bool,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.examples {
        print_examples();
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let repository = match (&cli.owner, &cli.repo) {
        (Some(owner), Some(repo)) => RepositoryKey::new(owner.as_str(), repo.as_str()),
        _ => anyhow::bail!("--owner and --repo are required"),
    };

    let (config, config_hash) = load_effective_config(&cli)?;
    let folder = Path::new(&config.output.base_folder).join(repository.folder_name());

    if cli.validate_only {
        setup_logging(cli.verbose, cli.quiet, None)?;
        return handle_validate(&folder);
    }

    let log_path = folder.join(layout::log_file(chrono::Local::now()));
    setup_logging(cli.verbose, cli.quiet, Some(&log_path))?;
    tracing::info!("Configuration loaded (hash: {})", config_hash);
    tracing::debug!("Logging to {}", log_path.display());

    let options = RunOptions {
        max_concurrent: config.rate_limit.max_concurrent_requests as usize,
        conservative: cli.conservative,
        resume: !cli.no_resume,
    };
    handle_harvest(repository, config, config_hash, folder, options).await
}

/// Loads the configuration file and applies command-line overrides
fn load_effective_config(cli: &Cli) -> anyhow::Result<(Config, String)> {
    let (mut config, file_hash) = load_config_with_hash(cli.config.as_deref()).with_context(|| {
        match &cli.config {
            Some(path) => format!("Failed to load configuration from {}", path.display()),
            None => "Default configuration is invalid".to_string(),
        }
    })?;

    let overrides = Overrides {
        conservative: cli.conservative,
        max_concurrent: cli.max_concurrent,
    };
    if !overrides.conservative && overrides.max_concurrent.is_none() {
        return Ok((config, file_hash));
    }

    config.apply_overrides(overrides);
    validate(&config).context("Command-line overrides produce an invalid configuration")?;
    let hash = compute_config_hash(&config);
    Ok((config, hash))
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// When `log_file` is given, every event is also written there without ANSI
/// colors.
fn setup_logging(verbose: u8, quiet: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("repo_harvest=info,warn"),
            1 => EnvFilter::new("repo_harvest=debug,info"),
            2 => EnvFilter::new("repo_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(())
}

/// Handles the --validate-only mode: checks the existing output tree
fn handle_validate(folder: &Path) -> anyhow::Result<ExitCode> {
    let report = validate_output(folder)
        .with_context(|| format!("Failed to validate {}", folder.display()))?;
    print_validation_report(folder, &report);

    if report.is_valid() {
        println!("\n✓ Output is valid");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURE))
    }
}

/// Handles the main harvest operation
async fn handle_harvest(
    repository: RepositoryKey,
    config: Config,
    config_hash: String,
    folder: PathBuf,
    options: RunOptions,
) -> anyhow::Result<ExitCode> {
    let credential =
        Credential::from_env().ok_or(HarvestError::MissingCredential(TOKEN_ENV))?;
    let api = GitHubClient::new(&config.api, &credential).context("Failed to build HTTP client")?;

    let sink = JsonFileSink::new(&folder);
    let store = JsonCheckpointStore::new(&folder, repository.to_string());

    let (trigger, signal) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, finishing in-flight requests");
            trigger.trigger();
        }
    });

    if options.resume {
        tracing::info!("Harvesting {} (will resume from a checkpoint if present)", repository);
    } else {
        tracing::info!("Harvesting {} from scratch", repository);
    }

    let coordinator = Coordinator::new(
        CrawlJob::new(repository, options),
        Arc::new(config),
        config_hash,
        Arc::new(api),
        Arc::new(sink),
        Arc::new(store),
        signal,
    )?;

    match coordinator.run().await {
        Ok(outcome) => {
            report(&folder, outcome.summary());
            match outcome {
                RunOutcome::Completed(_) => Ok(ExitCode::SUCCESS),
                RunOutcome::Interrupted(_) => Ok(ExitCode::from(EXIT_INTERRUPTED)),
            }
        }
        Err(e) => {
            tracing::error!("Harvest failed: {}", e);
            report(&folder, &coordinator.summary(RunStatus::Failed));
            Ok(ExitCode::from(EXIT_FAILURE))
        }
    }
}

/// Writes `summary.md` and prints the summary to stdout
fn report(folder: &Path, summary: &RunSummary) {
    let path = folder.join(layout::SUMMARY_FILE);
    match generate_markdown_summary(summary, &path) {
        Ok(()) => tracing::info!("Summary written to {}", path.display()),
        Err(e) => tracing::warn!("Failed to write summary: {}", e),
    }
    println!();
    print_summary(summary);
}

fn print_examples() {
    println!("=== Repo-Harvest Examples ===\n");
    println!("The API token is read from the {} environment variable.\n", TOKEN_ENV);
    println!("Harvest a repository with the default settings:");
    println!("  repo-harvest --owner rust-lang --repo cargo\n");
    println!("Use a configuration file and more verbose logs:");
    println!("  repo-harvest --owner rust-lang --repo cargo --config harvest.toml -v\n");
    println!("Stay well below the quota (shared token, long run):");
    println!("  repo-harvest --owner rust-lang --repo cargo --conservative\n");
    println!("Ignore the checkpoint of an earlier run and start over:");
    println!("  repo-harvest --owner rust-lang --repo cargo --no-resume\n");
    println!("Limit concurrency explicitly:");
    println!("  repo-harvest --owner rust-lang --repo cargo --max-concurrent 4\n");
    println!("Check a finished output folder:");
    println!("  repo-harvest --owner rust-lang --repo cargo --validate-only");
}
