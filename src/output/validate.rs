//! Integrity check of an existing output tree
//!
//! Used by `--validate-only`: every JSON file below the repository folder must
//! parse, and both listing collections must exist.

use crate::crawler::ListingKind;
use crate::output::layout::{self, LOG_DIR};
use crate::output::traits::{OutputError, OutputResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of validating one output folder
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// File count per category (`pull_requests`, `pr_files`, `single_commits`, ...)
    pub categories: BTreeMap<String, usize>,

    /// Files that failed to parse, with the parser message
    pub invalid: Vec<(PathBuf, String)>,

    /// Listing collections that should exist but do not
    pub missing: Vec<PathBuf>,

    pub total_files: usize,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.total_files == 0
    }

    /// True when the tree is non-empty and has no invalid or missing files
    pub fn is_valid(&self) -> bool {
        !self.is_empty() && self.invalid.is_empty() && self.missing.is_empty()
    }
}

/// Category of a JSON file given its path relative to the repository folder
fn categorize(relative: &Path) -> String {
    let parts: Vec<&str> = relative
        .iter()
        .filter_map(|component| component.to_str())
        .collect();

    let pull = ListingKind::PullRequests.folder();
    let commit = ListingKind::Commits.folder();

    match parts.as_slice() {
        [dir, file] if *dir == pull && *file == layout::COLLECTION_FILE => {
            "pull_requests".to_string()
        }
        [dir, "pages", _] if *dir == pull => "pull_request_pages".to_string(),
        [dir, _number, kind, file] if *dir == pull && *file == layout::COLLECTION_FILE => {
            format!("pr_{}", kind)
        }
        [dir, file] if *dir == commit && *file == layout::COLLECTION_FILE => "commits".to_string(),
        [dir, "pages", _] if *dir == commit => "commit_pages".to_string(),
        [dir, "all", _] if *dir == commit => "single_commits".to_string(),
        _ => "other".to_string(),
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn collect_json_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> OutputResult<()> {
    let entries = fs::read_dir(dir).map_err(|source| OutputError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let path = entry?.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            if dir == root && path.file_name().and_then(|n| n.to_str()) == Some(LOG_DIR) {
                continue;
            }
            collect_json_files(root, &path, files)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(())
}

/// Validates the output folder of one repository
///
/// # Arguments
///
/// * `root` - The repository folder, `<base>/<owner>-<repo>`
///
/// # Returns
///
/// * `Ok(ValidationReport)` - The folder was walked; inspect the report
/// * `Err(OutputError)` - The folder could not be read
pub fn validate_output(root: &Path) -> OutputResult<ValidationReport> {
    let mut report = ValidationReport::default();
    if !root.exists() {
        tracing::warn!("Output folder {} does not exist", root.display());
        return Ok(report);
    }

    let mut files = Vec::new();
    collect_json_files(root, root, &mut files)?;
    files.sort();

    for path in files {
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        *report.categories.entry(categorize(&relative)).or_insert(0) += 1;
        report.total_files += 1;

        let content = fs::read_to_string(&path).map_err(|source| OutputError::Read {
            path: path.clone(),
            source,
        })?;
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&content) {
            tracing::warn!("Invalid JSON in {}: {}", relative.display(), e);
            report.invalid.push((relative, e.to_string()));
        }
    }

    for kind in [ListingKind::PullRequests, ListingKind::Commits] {
        let collection = layout::listing_collection(kind);
        if !root.join(&collection).exists() {
            report.missing.push(collection);
        }
    }

    Ok(report)
}

/// Prints a validation report to stdout
pub fn print_validation_report(root: &Path, report: &ValidationReport) {
    println!("=== Output Validation: {} ===\n", root.display());

    if report.is_empty() {
        println!("No JSON files found.");
        return;
    }

    println!("Files by category:");
    for (category, count) in &report.categories {
        println!("  {}: {}", category, count);
    }
    println!("  total: {}", report.total_files);
    println!();

    if !report.missing.is_empty() {
        println!("Missing listing files:");
        for path in &report.missing {
            println!("  {}", path.display());
        }
        println!();
    }

    if report.invalid.is_empty() {
        println!("All files parse as JSON.");
    } else {
        println!("Invalid files ({}):", report.invalid.len());
        for (path, reason) in &report.invalid {
            println!("  {}: {}", path.display(), reason);
        }
    }
}
