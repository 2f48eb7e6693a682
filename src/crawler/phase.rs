//! Phase plan and id discovery
//!
//! A run is three dependency-ordered phases:
//!
//! | Phase | Kind | Tasks |
//! |-------|------|-------|
//! | foundation | Sequential | `pull_requests`, `commits` listings |
//! | dependencies | FanOut | `pr_files`, `pr_reviews`, `pr_commits`, `pr_comments` per pull request |
//! | details | Batched | `single_commits` over every discovered commit sha |

use crate::checkpoint::DiscoveredIds;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// How a phase runs its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Tasks run one after another
    Sequential,
    /// Tasks run concurrently over a known item set, sharing one worker pool
    FanOut,
    /// One task over a deduplicated id set, processed in batches
    Batched,
}

/// Top-level paginated listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingKind {
    PullRequests,
    Commits,
}

impl ListingKind {
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::PullRequests => "pull_requests",
            Self::Commits => "commits",
        }
    }

    /// Path segment below `repos/<owner>/<name>/`
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::PullRequests => "pulls",
            Self::Commits => "commits",
        }
    }

    /// Output folder of the listing
    pub fn folder(&self) -> &'static str {
        match self {
            Self::PullRequests => "pull",
            Self::Commits => "commit",
        }
    }
}

/// Per-pull-request sub-resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Files,
    Reviews,
    Commits,
    Comments,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 4] = [
        DependencyKind::Files,
        DependencyKind::Reviews,
        DependencyKind::Commits,
        DependencyKind::Comments,
    ];

    /// Endpoint segment and output folder name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Reviews => "reviews",
            Self::Commits => "commits",
            Self::Comments => "comments",
        }
    }

    pub fn task_name(&self) -> &'static str {
        match self {
            Self::Files => "pr_files",
            Self::Reviews => "pr_reviews",
            Self::Commits => "pr_commits",
            Self::Comments => "pr_comments",
        }
    }
}

/// What a task fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Listing(ListingKind),
    Dependency(DependencyKind),
    Detail,
}

impl TaskKind {
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::Listing(kind) => kind.task_name(),
            Self::Dependency(kind) => kind.task_name(),
            Self::Detail => "single_commits",
        }
    }
}

/// One task in the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: &'static str,
    pub kind: TaskKind,
}

impl TaskSpec {
    fn new(kind: TaskKind) -> Self {
        Self {
            name: kind.task_name(),
            kind,
        }
    }
}

/// A named stage of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: &'static str,
    pub kind: PhaseKind,
    pub tasks: Vec<TaskSpec>,
}

/// Ordered list of phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlPlan {
    phases: Vec<Phase>,
}

impl CrawlPlan {
    /// The full plan: both listings, all four dependency kinds, commit details
    pub fn standard() -> Self {
        Self::with_dependencies(&DependencyKind::ALL)
    }

    /// The standard plan restricted to the given dependency kinds
    pub fn with_dependencies(kinds: &[DependencyKind]) -> Self {
        let foundation = Phase {
            name: "foundation",
            kind: PhaseKind::Sequential,
            tasks: vec![
                TaskSpec::new(TaskKind::Listing(ListingKind::PullRequests)),
                TaskSpec::new(TaskKind::Listing(ListingKind::Commits)),
            ],
        };

        let dependencies = Phase {
            name: "dependencies",
            kind: PhaseKind::FanOut,
            tasks: kinds
                .iter()
                .map(|kind| TaskSpec::new(TaskKind::Dependency(*kind)))
                .collect(),
        };

        let details = Phase {
            name: "details",
            kind: PhaseKind::Batched,
            tasks: vec![TaskSpec::new(TaskKind::Detail)],
        };

        Self {
            phases: vec![foundation, dependencies, details],
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Every task of the plan, in execution order, with its phase name
    pub fn tasks(&self) -> impl Iterator<Item = (&'static str, &TaskSpec)> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter().map(move |task| (phase.name, task)))
    }
}

/// Pull request numbers of a listing page
pub fn extract_primary_keys(records: &[Value]) -> Vec<u64> {
    records
        .iter()
        .filter_map(|record| record.get("number").and_then(Value::as_u64))
        .collect()
}

/// Commit shas a task's records point at
///
/// Commit listings and pull request commits carry `sha`; reviews carry the
/// `commit_id` they were made on. Other kinds surface nothing. Ids end up in
/// file names, so anything that is not a hex sha is dropped.
pub fn extract_secondary_ids(kind: TaskKind, records: &[Value]) -> Vec<String> {
    let field = match kind {
        TaskKind::Listing(ListingKind::Commits) => "sha",
        TaskKind::Dependency(DependencyKind::Commits) => "sha",
        TaskKind::Dependency(DependencyKind::Reviews) => "commit_id",
        _ => return Vec::new(),
    };

    records
        .iter()
        .filter_map(|record| record.get(field).and_then(Value::as_str))
        .filter(|id| {
            let usable = is_commit_id(id);
            if !usable {
                tracing::warn!(field, "Ignoring malformed commit id {:?}", id);
            }
            usable
        })
        .map(str::to_string)
        .collect()
}

/// Hex digits only, at most a SHA-256 worth
fn is_commit_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Ids discovered so far in the run, shared by all workers
#[derive(Debug, Default)]
pub struct DiscoveryLog {
    inner: Mutex<DiscoveredIds>,
}

impl DiscoveryLog {
    pub fn new(restored: DiscoveredIds) -> Self {
        Self {
            inner: Mutex::new(restored),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveredIds> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the complete key list of a listing
    pub fn set_primary(&self, listing: &str, keys: Vec<u64>) {
        self.lock().primary.insert(listing.to_string(), keys);
    }

    pub fn primary(&self, listing: &str) -> Vec<u64> {
        self.lock().primary.get(listing).cloned().unwrap_or_default()
    }

    pub fn add_secondary(&self, ids: impl IntoIterator<Item = String>) {
        self.lock().secondary.extend(ids);
    }

    /// Sorted, deduplicated secondary ids
    pub fn secondary(&self) -> BTreeSet<String> {
        self.lock().secondary.clone()
    }

    pub fn snapshot(&self) -> DiscoveredIds {
        self.lock().clone()
    }
}
