//! End-to-end harvest runs

use crate::support::{self, pull, Call, MemorySink, MemoryStore, Reply, ScriptedApi};
use repo_harvest::checkpoint::{CheckpointStore, JsonCheckpointStore, TaskCursor};
use repo_harvest::config::Config;
use repo_harvest::crawler::{
    shutdown_channel, CrawlPlan, DependencyKind, ListingKind, Mode, RunOutcome, RunOptions,
    ShutdownSignal,
};
use repo_harvest::{HarvestError, ItemOutcome, TaskStatus};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;

/// Three pull requests, reviews and commits per pull request.
/// Reviews of #2 do not exist; review and commit of #1 and the commit of #2
/// all point at the same sha.
fn shared_sha_api() -> ScriptedApi {
    ScriptedApi::new()
        .listing(
            ListingKind::PullRequests,
            1,
            json!([pull(1), pull(2), pull(3)]),
        )
        .dependency(
            DependencyKind::Reviews,
            1,
            Reply::Records(json!([{ "id": 10, "commit_id": "abc" }])),
        )
        .dependency(DependencyKind::Reviews, 2, Reply::NotFound)
        .dependency(
            DependencyKind::Commits,
            1,
            Reply::Records(json!([{ "sha": "abc" }])),
        )
        .dependency(
            DependencyKind::Commits,
            2,
            Reply::Records(json!([{ "sha": "abc" }])),
        )
}

fn reviews_and_commits() -> CrawlPlan {
    CrawlPlan::with_dependencies(&[DependencyKind::Reviews, DependencyKind::Commits])
}

fn sequential_options() -> RunOptions {
    RunOptions {
        max_concurrent: 1,
        ..RunOptions::default()
    }
}

/// Defaults with retries that back off in milliseconds
fn quick_retries(max_retries: u32) -> Config {
    let mut config = Config::default();
    config.retry.max_retries = max_retries;
    config.retry.base_backoff_delay = 0.01;
    config.retry.max_backoff_delay = 0.02;
    config
}

fn count_calls(api: &ScriptedApi, call: &Call) -> usize {
    api.calls().iter().filter(|c| *c == call).count()
}

#[tokio::test]
async fn test_end_to_end_counts() {
    let api = Arc::new(shared_sha_api());
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(MemoryStore::default());
    let coordinator = support::coordinator(
        reviews_and_commits(),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        sink.clone(),
        store.clone(),
        ShutdownSignal::never(),
    );

    let outcome = coordinator.run().await.unwrap();
    let RunOutcome::Completed(summary) = outcome else {
        panic!("run should complete");
    };

    let snapshot = coordinator.aggregator().snapshot();
    let foundation = snapshot.phase_counters("foundation");
    assert_eq!(foundation.completed, 3);

    let dependencies = snapshot.phase_counters("dependencies");
    assert_eq!(dependencies.completed, 5);
    assert_eq!(dependencies.skipped, 1);
    assert_eq!(dependencies.failed, 0);

    let details = snapshot.phase_counters("details");
    assert_eq!(details.completed, 1);

    assert_eq!(snapshot.overall(), (9, 9));
    assert_eq!(summary.total_completed(), 9);
    assert!(summary
        .tasks
        .iter()
        .all(|task| task.status == TaskStatus::Completed));

    let pulls = sink.get("pull/all_data.json").unwrap();
    assert_eq!(pulls.as_array().unwrap().len(), 3);
    assert!(sink.get("pull/1/reviews/all_data.json").is_some());
    assert!(sink.get("pull/2/reviews/all_data.json").is_none());
    assert!(sink.get("pull/3/commits/all_data.json").is_some());
    assert_eq!(sink.get("commit/all_data.json"), Some(json!([])));
    assert_eq!(sink.get("commit/all/abc.json").unwrap()["sha"], "abc");

    assert!(store.record().is_none());
}

#[tokio::test]
async fn test_phases_run_in_order() {
    let api = Arc::new(shared_sha_api());
    let coordinator = support::coordinator(
        reviews_and_commits(),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStore::default()),
        ShutdownSignal::never(),
    );
    coordinator.run().await.unwrap();

    let calls = api.calls();
    let position = |pred: fn(&Call) -> bool| -> Vec<usize> {
        calls
            .iter()
            .enumerate()
            .filter(|(_, call)| pred(call))
            .map(|(i, _)| i)
            .collect()
    };
    let listings = position(|call| matches!(call, Call::Listing(..)));
    let dependencies = position(|call| matches!(call, Call::Dependency(..)));
    let details = position(|call| matches!(call, Call::Detail(_)));

    assert_eq!(listings.len(), 2);
    assert_eq!(dependencies.len(), 6);
    assert_eq!(details.len(), 1);
    assert!(listings.iter().max() < dependencies.iter().min());
    assert!(dependencies.iter().max() < details.iter().min());
}

#[tokio::test]
async fn test_detail_phase_covers_exact_union() {
    let api = Arc::new(
        ScriptedApi::new()
            .listing(ListingKind::PullRequests, 1, json!([pull(1), pull(2)]))
            .listing(
                ListingKind::Commits,
                1,
                json!([{ "sha": "c1" }, { "sha": "c2" }]),
            )
            .dependency(
                DependencyKind::Reviews,
                1,
                Reply::Records(json!([{ "commit_id": "c2" }, { "commit_id": "c3" }])),
            )
            .dependency(
                DependencyKind::Commits,
                2,
                Reply::Records(json!([{ "sha": "c4" }, { "sha": "c1" }])),
            ),
    );
    let coordinator = support::coordinator(
        CrawlPlan::standard(),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStore::default()),
        ShutdownSignal::never(),
    );
    coordinator.run().await.unwrap();

    let fetched: Vec<String> = api
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Detail(sha) => Some(sha),
            _ => None,
        })
        .collect();
    let unique: BTreeSet<&str> = fetched.iter().map(String::as_str).collect();

    assert_eq!(fetched.len(), 4);
    assert_eq!(unique, BTreeSet::from(["c1", "c2", "c3", "c4"]));
}

#[tokio::test]
async fn test_resume_skips_finished_work() {
    // Baseline: one uninterrupted run
    let baseline = Arc::new(MemorySink::default());
    support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        Arc::new(shared_sha_api()),
        baseline.clone(),
        Arc::new(MemoryStore::default()),
        ShutdownSignal::never(),
    )
    .run()
    .await
    .unwrap();

    // Calls 1-2 are the listings, 3-4 the first pull request's reviews and commits
    let (trigger, signal) = shutdown_channel();
    let first_api = Arc::new(shared_sha_api().interrupt_on_call(4, trigger));
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(MemoryStore::default());

    let outcome = support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        first_api.clone(),
        sink.clone(),
        store.clone(),
        signal,
    )
    .run()
    .await
    .unwrap();
    assert!(matches!(outcome, RunOutcome::Interrupted(_)));

    let record = store.record().expect("checkpoint saved on interrupt");
    assert_eq!(record.tasks["pull_requests"].status, TaskStatus::Completed);
    assert_eq!(record.tasks["pr_reviews"].status, TaskStatus::Running);
    assert!(record.discovered.secondary.contains("abc"));

    let second_api = Arc::new(shared_sha_api());
    let resumed = support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        second_api.clone(),
        sink.clone(),
        store.clone(),
        ShutdownSignal::never(),
    );
    let outcome = resumed.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let second_calls = second_api.calls();
    assert!(!second_calls
        .iter()
        .any(|call| matches!(call, Call::Listing(..))));
    assert!(!second_calls.contains(&Call::Dependency("pr_reviews", 1)));
    assert!(!second_calls.contains(&Call::Dependency("pr_commits", 1)));

    let dependency_calls = first_api
        .calls()
        .into_iter()
        .chain(second_calls)
        .filter(|call| matches!(call, Call::Dependency(..)))
        .count();
    assert_eq!(dependency_calls, 6);

    let dependencies = resumed.aggregator().snapshot().phase_counters("dependencies");
    assert_eq!(dependencies.completed, 5);
    assert_eq!(dependencies.skipped, 1);

    assert_eq!(sink.files(), baseline.files());
    assert!(store.record().is_none());
}

#[tokio::test]
async fn test_listing_resumes_from_next_page() {
    let mut config = Config::default();
    config.api.items_per_page = 2;
    let api = |interrupt: Option<_>| {
        let api = ScriptedApi::new()
            .listing(ListingKind::PullRequests, 1, json!([pull(1), pull(2)]))
            .listing(ListingKind::PullRequests, 2, json!([pull(3), pull(4)]));
        match interrupt {
            Some(trigger) => Arc::new(api.interrupt_on_call(2, trigger)),
            None => Arc::new(api),
        }
    };
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(MemoryStore::default());

    let (trigger, signal) = shutdown_channel();
    let outcome = support::coordinator(
        CrawlPlan::with_dependencies(&[]),
        RunOptions::default(),
        config.clone(),
        api(Some(trigger)),
        sink.clone(),
        store.clone(),
        signal,
    )
    .run()
    .await
    .unwrap();
    assert!(matches!(outcome, RunOutcome::Interrupted(_)));

    let record = store.record().unwrap();
    assert_eq!(
        record.tasks["pull_requests"].cursor,
        TaskCursor::Page { next_page: 3 }
    );

    let second_api = api(None);
    let resumed = support::coordinator(
        CrawlPlan::with_dependencies(&[]),
        RunOptions::default(),
        config,
        second_api.clone(),
        sink.clone(),
        store.clone(),
        ShutdownSignal::never(),
    );
    resumed.run().await.unwrap();

    assert_eq!(
        second_api.calls().first(),
        Some(&Call::Listing("pull_requests", 3))
    );
    assert_eq!(
        sink.get("pull/all_data.json").unwrap(),
        json!([pull(1), pull(2), pull(3), pull(4)])
    );

    let pulls = resumed.aggregator().snapshot();
    let pulls = pulls.task("pull_requests").unwrap();
    assert_eq!(pulls.counters.completed, 4);
    assert_eq!(pulls.counters.total, Some(4));
}

#[tokio::test]
async fn test_repository_not_found_is_fatal() {
    let api = Arc::new(ScriptedApi::new().listing(
        ListingKind::PullRequests,
        1,
        serde_json::Value::Null,
    ));
    let store = Arc::new(MemoryStore::default());
    let coordinator = support::coordinator(
        CrawlPlan::standard(),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        store.clone(),
        ShutdownSignal::never(),
    );

    let result = coordinator.run().await;
    assert!(matches!(result, Err(HarvestError::RepositoryNotFound(_))));
    assert_eq!(api.calls(), vec![Call::Listing("pull_requests", 1)]);

    let record = store.record().expect("checkpoint saved on failure");
    assert_eq!(record.tasks["pull_requests"].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_quota_rejection_waits_and_stays_conservative() {
    let api = Arc::new(
        ScriptedApi::new()
            .listing(ListingKind::Commits, 1, json!([{ "sha": "c1" }]))
            .fail_listing_once(ListingKind::Commits, 1, Reply::QuotaExceeded),
    );
    let coordinator = support::coordinator(
        CrawlPlan::with_dependencies(&[]),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStore::default()),
        ShutdownSignal::never(),
    );

    let outcome = coordinator.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let commit_pages = api
        .calls()
        .into_iter()
        .filter(|call| *call == Call::Listing("commits", 1))
        .count();
    assert_eq!(commit_pages, 2);

    let quota = coordinator.tracker().snapshot();
    assert!(quota.sticky_conservative);
    assert_eq!(quota.mode, Mode::Conservative);
}

#[tokio::test]
async fn test_checkpoint_file_removed_after_success() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonCheckpointStore::new(dir.path(), "octo/widgets"));

    let (trigger, signal) = shutdown_channel();
    support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        Arc::new(shared_sha_api().interrupt_on_call(3, trigger)),
        Arc::new(MemorySink::default()),
        store.clone(),
        signal,
    )
    .run()
    .await
    .unwrap();
    assert!(store.path().exists());

    support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        Arc::new(shared_sha_api()),
        Arc::new(MemorySink::default()),
        store.clone(),
        ShutdownSignal::never(),
    )
    .run()
    .await
    .unwrap();
    assert!(!store.path().exists());
}

#[tokio::test]
async fn test_no_resume_discards_checkpoint() {
    let store = Arc::new(MemoryStore::default());

    let (trigger, signal) = shutdown_channel();
    support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        Config::default(),
        Arc::new(shared_sha_api().interrupt_on_call(3, trigger)),
        Arc::new(MemorySink::default()),
        store.clone(),
        signal,
    )
    .run()
    .await
    .unwrap();
    assert!(store.record().is_some());

    let api = Arc::new(shared_sha_api());
    let fresh = support::coordinator(
        reviews_and_commits(),
        RunOptions {
            resume: false,
            ..sequential_options()
        },
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        store.clone(),
        ShutdownSignal::never(),
    );
    assert!(store.record().is_none());

    fresh.run().await.unwrap();
    assert!(api.calls().contains(&Call::Listing("pull_requests", 1)));
    assert_eq!(
        fresh
            .aggregator()
            .snapshot()
            .phase_counters("dependencies")
            .completed,
        5
    );
}

#[tokio::test]
async fn test_failed_items_do_not_stop_phases() {
    let api = Arc::new(
        ScriptedApi::new()
            .listing(
                ListingKind::PullRequests,
                1,
                json!([pull(1), pull(2), pull(3)]),
            )
            .dependency(DependencyKind::Reviews, 1, Reply::ServerError)
            .dependency(DependencyKind::Reviews, 2, Reply::Malformed)
            .dependency(
                DependencyKind::Commits,
                1,
                Reply::Records(json!([{ "sha": "abc" }, { "sha": "def" }, { "sha": "123" }])),
            )
            .detail("abc", Reply::ServerError)
            .detail("def", Reply::Malformed),
    );
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(MemoryStore::default());
    let coordinator = support::coordinator(
        reviews_and_commits(),
        RunOptions::default(),
        quick_retries(2),
        api.clone(),
        sink.clone(),
        store.clone(),
        ShutdownSignal::never(),
    );

    let outcome = coordinator.run().await.unwrap();
    let RunOutcome::Completed(summary) = outcome else {
        panic!("item failures must not stop the run");
    };
    assert!(summary
        .tasks
        .iter()
        .all(|task| task.status == TaskStatus::Completed));

    let snapshot = coordinator.aggregator().snapshot();
    let dependencies = snapshot.phase_counters("dependencies");
    assert_eq!(dependencies.completed, 4);
    assert_eq!(dependencies.failed, 2);
    assert_eq!(dependencies.skipped, 0);

    let details = snapshot.phase_counters("details");
    assert_eq!(details.completed, 1);
    assert_eq!(details.failed, 2);

    // Server errors use every retry, malformed bodies none
    assert_eq!(count_calls(&api, &Call::Dependency("pr_reviews", 1)), 3);
    assert_eq!(count_calls(&api, &Call::Dependency("pr_reviews", 2)), 1);
    assert_eq!(count_calls(&api, &Call::Detail("abc".to_string())), 3);
    assert_eq!(count_calls(&api, &Call::Detail("def".to_string())), 1);

    assert!(sink.get("pull/1/reviews/all_data.json").is_none());
    assert!(sink.get("pull/2/reviews/all_data.json").is_none());
    assert!(sink.get("commit/all/abc.json").is_none());
    assert!(sink.get("commit/all/def.json").is_none());
    assert!(sink.get("commit/all/123.json").is_some());
    assert!(store.record().is_none());
}

#[tokio::test]
async fn test_failed_items_retried_on_resume() {
    let listings = || {
        ScriptedApi::new().listing(ListingKind::PullRequests, 1, json!([pull(1), pull(2)]))
    };

    // Calls 1-2 are the listings, 3-4 the failing reviews of #1, 5 the commits of #1
    let (trigger, signal) = shutdown_channel();
    let first_api = Arc::new(
        listings()
            .dependency(DependencyKind::Reviews, 1, Reply::ServerError)
            .interrupt_on_call(5, trigger),
    );
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(MemoryStore::default());

    let outcome = support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        quick_retries(1),
        first_api.clone(),
        sink.clone(),
        store.clone(),
        signal,
    )
    .run()
    .await
    .unwrap();
    assert!(matches!(outcome, RunOutcome::Interrupted(_)));

    let record = store.record().expect("checkpoint saved on interrupt");
    assert_eq!(
        record.tasks["pr_reviews"].cursor,
        TaskCursor::Items {
            finished: BTreeMap::from([("1".to_string(), ItemOutcome::Failed)]),
        }
    );
    assert_eq!(
        record.tasks["pr_commits"].cursor,
        TaskCursor::Items {
            finished: BTreeMap::from([("1".to_string(), ItemOutcome::Completed)]),
        }
    );

    let second_api = Arc::new(listings());
    let resumed = support::coordinator(
        reviews_and_commits(),
        sequential_options(),
        quick_retries(1),
        second_api.clone(),
        sink.clone(),
        store.clone(),
        ShutdownSignal::never(),
    );
    let outcome = resumed.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let calls = second_api.calls();
    assert!(calls.contains(&Call::Dependency("pr_reviews", 1)));
    assert!(!calls.contains(&Call::Dependency("pr_commits", 1)));
    assert!(calls.contains(&Call::Dependency("pr_reviews", 2)));
    assert!(calls.contains(&Call::Dependency("pr_commits", 2)));

    let dependencies = resumed.aggregator().snapshot().phase_counters("dependencies");
    assert_eq!(dependencies.completed, 4);
    assert_eq!(dependencies.failed, 0);
    assert_eq!(sink.get("pull/1/reviews/all_data.json"), Some(json!([])));
}

#[tokio::test]
async fn test_listing_failure_is_fatal() {
    let api = Arc::new(
        ScriptedApi::new()
            .listing(ListingKind::PullRequests, 1, json!([pull(1)]))
            .fail_listing_once(ListingKind::PullRequests, 1, Reply::ServerError)
            .fail_listing_once(ListingKind::PullRequests, 1, Reply::ServerError),
    );
    let store = Arc::new(MemoryStore::default());
    let coordinator = support::coordinator(
        CrawlPlan::standard(),
        RunOptions::default(),
        quick_retries(1),
        api.clone(),
        Arc::new(MemorySink::default()),
        store.clone(),
        ShutdownSignal::never(),
    );

    let result = coordinator.run().await;
    match result {
        Err(HarvestError::PhaseFailed { phase, task, .. }) => {
            assert_eq!(phase, "foundation");
            assert_eq!(task, "pull_requests");
        }
        other => panic!("expected a phase failure, got {:?}", other),
    }
    assert_eq!(
        api.calls(),
        vec![
            Call::Listing("pull_requests", 1),
            Call::Listing("pull_requests", 1)
        ]
    );

    let record = store.record().expect("checkpoint saved on failure");
    assert_eq!(record.tasks["pull_requests"].status, TaskStatus::Failed);
    assert_eq!(record.tasks["commits"].status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_malformed_listing_page_is_fatal() {
    let api = Arc::new(ScriptedApi::new().fail_listing_once(
        ListingKind::Commits,
        1,
        Reply::Malformed,
    ));
    let coordinator = support::coordinator(
        CrawlPlan::with_dependencies(&[]),
        RunOptions::default(),
        Config::default(),
        api.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStore::default()),
        ShutdownSignal::never(),
    );

    let result = coordinator.run().await;
    assert!(matches!(
        result,
        Err(HarvestError::PhaseFailed { ref task, .. }) if task == "commits"
    ));
    assert_eq!(count_calls(&api, &Call::Listing("commits", 1)), 1);
}
