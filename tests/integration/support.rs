//! Scripted collaborators for driving the coordinator without a network

use async_trait::async_trait;
use repo_harvest::checkpoint::{CheckpointRecord, CheckpointStore, StorageResult};
use repo_harvest::config::Config;
use repo_harvest::crawler::{
    ApiResponse, CrawlJob, CrawlPlan, DependencyKind, FetchError, FetchResult, ListingKind,
    RemoteApi, RepositoryKey, RunOptions, ShutdownSignal, ShutdownTrigger,
};
use repo_harvest::output::{DataSink, OutputError, OutputResult};
use repo_harvest::Coordinator;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A scripted reply to one call
#[derive(Debug, Clone)]
pub enum Reply {
    Records(Value),
    NotFound,
    QuotaExceeded,
    /// HTTP 502 on every attempt
    ServerError,
    /// A 200 whose body is neither an array nor an object
    Malformed,
}

impl Reply {
    fn into_result(self) -> FetchResult<ApiResponse> {
        match self {
            Reply::Records(body) => Ok(ApiResponse::new(body)),
            Reply::NotFound => Err(FetchError::NotFound {
                status: 404,
                quota: None,
            }),
            Reply::QuotaExceeded => Err(FetchError::QuotaExceeded {
                status: 429,
                reset_at: Some(chrono::Utc::now() + chrono::Duration::seconds(1)),
                quota: None,
            }),
            Reply::ServerError => Err(FetchError::Server {
                status: 502,
                quota: None,
            }),
            Reply::Malformed => Ok(ApiResponse::new(Value::String("unexpected".into()))),
        }
    }
}

/// One recorded call, in the order calls were made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Listing(&'static str, u32),
    Dependency(&'static str, u64),
    Detail(String),
}

/// Remote API answering from fixed tables
///
/// Unscripted listings and dependencies answer with an empty array, and
/// unscripted commits with a minimal record. A reply queued with
/// `fail_listing_once` is returned once before the scripted one.
#[derive(Default)]
pub struct ScriptedApi {
    listings: HashMap<(&'static str, u32), Value>,
    dependencies: HashMap<(&'static str, u64), Reply>,
    details: HashMap<String, Reply>,
    fail_first: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
    interrupt: Mutex<Option<(usize, ShutdownTrigger)>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listing(mut self, kind: ListingKind, page: u32, records: Value) -> Self {
        self.listings.insert((kind.task_name(), page), records);
        self
    }

    pub fn dependency(mut self, kind: DependencyKind, number: u64, reply: Reply) -> Self {
        self.dependencies.insert((kind.task_name(), number), reply);
        self
    }

    pub fn detail(mut self, sha: &str, reply: Reply) -> Self {
        self.details.insert(sha.to_string(), reply);
        self
    }

    /// Answers the listing page with `reply` once before the scripted page
    pub fn fail_listing_once(self, kind: ListingKind, page: u32, reply: Reply) -> Self {
        self.fail_first
            .lock()
            .unwrap()
            .entry(format!("{}:{}", kind.task_name(), page))
            .or_default()
            .push_back(reply);
        self
    }

    /// Fires `trigger` while serving the `nth` call (1-based)
    pub fn interrupt_on_call(self, nth: usize, trigger: ShutdownTrigger) -> Self {
        *self.interrupt.lock().unwrap() = Some((nth, trigger));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            calls.len()
        };
        if let Some((nth, trigger)) = self.interrupt.lock().unwrap().as_ref() {
            if count == *nth {
                trigger.trigger();
            }
        }
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn list_page(
        &self,
        _repo: &RepositoryKey,
        kind: ListingKind,
        page: u32,
        _per_page: u32,
    ) -> FetchResult<ApiResponse> {
        self.record(Call::Listing(kind.task_name(), page));

        let queued = self
            .fail_first
            .lock()
            .unwrap()
            .get_mut(&format!("{}:{}", kind.task_name(), page))
            .and_then(VecDeque::pop_front);
        if let Some(reply) = queued {
            return reply.into_result();
        }

        let body = self
            .listings
            .get(&(kind.task_name(), page))
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        match body {
            Value::Null => Reply::NotFound.into_result(),
            body => Ok(ApiResponse::new(body)),
        }
    }

    async fn list_dependency(
        &self,
        _repo: &RepositoryKey,
        kind: DependencyKind,
        number: u64,
        _page: u32,
        _per_page: u32,
    ) -> FetchResult<ApiResponse> {
        self.record(Call::Dependency(kind.task_name(), number));
        self.dependencies
            .get(&(kind.task_name(), number))
            .cloned()
            .unwrap_or_else(|| Reply::Records(Value::Array(Vec::new())))
            .into_result()
    }

    async fn fetch_detail(&self, _repo: &RepositoryKey, sha: &str) -> FetchResult<ApiResponse> {
        self.record(Call::Detail(sha.to_string()));
        self.details
            .get(sha)
            .cloned()
            .unwrap_or_else(|| Reply::Records(serde_json::json!({ "sha": sha, "files": [] })))
            .into_result()
    }
}

/// Data sink keeping every file in memory
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<BTreeMap<PathBuf, Value>>,
}

impl MemorySink {
    pub fn files(&self) -> BTreeMap<PathBuf, Value> {
        self.files.lock().unwrap().clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.files.lock().unwrap().get(Path::new(path)).cloned()
    }
}

impl DataSink for MemorySink {
    fn write_collection(&self, path: &Path, records: &[Value]) -> OutputResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Value::Array(records.to_vec()));
        Ok(())
    }

    fn write_item(&self, path: &Path, record: &Value) -> OutputResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), record.clone());
        Ok(())
    }

    fn read_item(&self, path: &Path) -> OutputResult<Value> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| OutputError::Read {
                path: path.to_path_buf(),
                source: std::io::ErrorKind::NotFound.into(),
            })
    }
}

/// Checkpoint store keeping the last record in memory
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<CheckpointRecord>>,
}

impl MemoryStore {
    pub fn record(&self) -> Option<CheckpointRecord> {
        self.record.lock().unwrap().clone()
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&self, record: &CheckpointRecord) -> StorageResult<()> {
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<CheckpointRecord>> {
        Ok(self.record())
    }

    fn clear(&self) -> StorageResult<()> {
        *self.record.lock().unwrap() = None;
        Ok(())
    }
}

pub fn repository() -> RepositoryKey {
    RepositoryKey::new("octo", "widgets")
}

pub fn pull(number: u64) -> Value {
    serde_json::json!({ "number": number, "title": format!("PR {}", number) })
}

/// Builds a coordinator over the scripted collaborators
pub fn coordinator(
    plan: CrawlPlan,
    options: RunOptions,
    config: Config,
    api: Arc<ScriptedApi>,
    sink: Arc<MemorySink>,
    store: Arc<dyn CheckpointStore>,
    shutdown: ShutdownSignal,
) -> Coordinator {
    let job = CrawlJob::new(repository(), options).with_plan(plan);
    Coordinator::new(
        job,
        Arc::new(config),
        "test-hash",
        api,
        sink,
        store,
        shutdown,
    )
    .expect("coordinator should build")
}
