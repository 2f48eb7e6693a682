//! Output tree layout, relative to `<base>/<owner>-<repo>/`
//!
//! ```text
//! pull/all_data.json
//! pull/pages/00001.json
//! pull/<number>/<kind>/all_data.json
//! commit/all_data.json
//! commit/pages/00001.json
//! commit/all/<sha>.json
//! summary.md
//! logs/harvest_<timestamp>.log
//! ```

use crate::crawler::{DependencyKind, ListingKind};
use std::path::PathBuf;

pub const COLLECTION_FILE: &str = "all_data.json";
pub const SUMMARY_FILE: &str = "summary.md";
pub const LOG_DIR: &str = "logs";

/// Aggregate file of a listing
pub fn listing_collection(kind: ListingKind) -> PathBuf {
    PathBuf::from(kind.folder()).join(COLLECTION_FILE)
}

/// One persisted page of a listing
pub fn listing_page(kind: ListingKind, page: u32) -> PathBuf {
    PathBuf::from(kind.folder())
        .join("pages")
        .join(format!("{:05}.json", page))
}

/// Collection of one pull request sub-resource
pub fn dependency_collection(number: u64, kind: DependencyKind) -> PathBuf {
    PathBuf::from(ListingKind::PullRequests.folder())
        .join(number.to_string())
        .join(kind.as_str())
        .join(COLLECTION_FILE)
}

/// Full record of one commit
pub fn detail_item(sha: &str) -> PathBuf {
    PathBuf::from(ListingKind::Commits.folder())
        .join("all")
        .join(format!("{}.json", sha))
}

/// Log file name for a run started at `timestamp`
pub fn log_file(timestamp: chrono::DateTime<chrono::Local>) -> PathBuf {
    PathBuf::from(LOG_DIR).join(format!("harvest_{}.log", timestamp.format("%Y%m%d_%H%M%S")))
}
