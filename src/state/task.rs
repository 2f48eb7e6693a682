use crate::state::{ItemOutcome, TaskStatus};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

const UNKNOWN_TOTAL: u64 = u64::MAX;
const PENDING: u8 = 0;

/// Arena of a task's work items
///
/// Every item key gets a stable index. Workers settle items by index with a
/// compare-and-set, so an item can be counted at most once no matter how many
/// workers race on it.
#[derive(Debug)]
pub struct ItemTable {
    keys: Vec<String>,
    states: Vec<AtomicU8>,
}

impl ItemTable {
    /// Creates a table with every item pending
    pub fn new(keys: Vec<String>) -> Self {
        let states = keys.iter().map(|_| AtomicU8::new(PENDING)).collect();
        Self { keys, states }
    }

    /// Number of items in the table
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the table has no items
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key of the item at `index`
    pub fn key(&self, index: usize) -> &str {
        &self.keys[index]
    }

    /// Outcome of the item at `index`, or None while it is pending
    pub fn outcome(&self, index: usize) -> Option<ItemOutcome> {
        ItemOutcome::from_code(self.states[index].load(Ordering::SeqCst))
    }

    /// Settles a pending item; returns false if it was already settled
    pub fn finish(&self, index: usize, outcome: ItemOutcome) -> bool {
        self.states[index]
            .compare_exchange(
                PENDING,
                outcome.to_code(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Indices of all items that are still pending
    pub fn pending_indices(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.outcome(i).is_none())
            .collect()
    }

    /// Settled items keyed by item key
    pub fn finished(&self) -> BTreeMap<String, ItemOutcome> {
        (0..self.len())
            .filter_map(|i| self.outcome(i).map(|o| (self.keys[i].clone(), o)))
            .collect()
    }
}

/// Point-in-time copy of a task's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounters {
    /// Known item total, None until the task's item set is known
    pub total: Option<u64>,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl TaskCounters {
    /// Items that reached any terminal outcome
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

/// One logical extraction unit, e.g. "pull_requests" or "single_commits"
///
/// Counters only ever grow during a run. Listing tasks grow their counters a
/// page at a time and learn their total when the listing ends; item tasks get
/// their total when the item table is installed.
#[derive(Debug)]
pub struct CrawlerTask {
    name: String,
    phase: String,
    status: Mutex<TaskStatus>,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    next_page: Mutex<Option<u32>>,
    items: OnceLock<ItemTable>,
    restored_items: Mutex<BTreeMap<String, ItemOutcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CrawlerTask {
    /// Creates a pending task
    pub fn new(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            status: Mutex::new(TaskStatus::Pending),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            next_page: Mutex::new(None),
            items: OnceLock::new(),
            restored_items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn status(&self) -> TaskStatus {
        *lock(&self.status)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.started_at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.finished_at)
    }

    /// Moves the task to `to`, enforcing the transition table
    ///
    /// `Running -> Completed` additionally requires every known item to be
    /// settled.
    pub fn transition(&self, to: TaskStatus) -> Result<(), HarvestError> {
        let mut status = lock(&self.status);
        let from = *status;

        let settled = to != TaskStatus::Completed || self.is_settled();
        if !from.can_transition_to(to) || !settled {
            return Err(HarvestError::InvalidTransition {
                task: self.name.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        match to {
            TaskStatus::Running => *lock(&self.started_at) = Some(now),
            _ if to.is_terminal() => *lock(&self.finished_at) = Some(now),
            _ => {}
        }
        *status = to;

        Ok(())
    }

    /// Current counters
    pub fn counters(&self) -> TaskCounters {
        let total = self.total.load(Ordering::SeqCst);
        TaskCounters {
            total: (total != UNKNOWN_TOTAL).then_some(total),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }

    /// Returns true once the total is known and every item is settled
    pub fn is_settled(&self) -> bool {
        let counters = self.counters();
        counters.total.is_some_and(|total| counters.settled() >= total)
    }

    // ===== Listing tasks =====

    /// Next listing page to request (1-based)
    pub fn next_page(&self) -> u32 {
        lock(&self.next_page).unwrap_or(1)
    }

    /// Records the resume cursor of a listing task
    pub fn set_next_page(&self, page: u32) {
        *lock(&self.next_page) = Some(page);
    }

    /// Persisted page cursor, if this listing has fetched anything
    pub fn page_cursor(&self) -> Option<u32> {
        *lock(&self.next_page)
    }

    /// Counts `count` newly listed records as completed items
    pub fn record_listed(&self, count: u64) {
        self.completed.fetch_add(count, Ordering::SeqCst);
    }

    /// Fixes the total of a listing task once the last page is seen
    pub fn finish_listing(&self) {
        let completed = self.completed.load(Ordering::SeqCst);
        self.total.store(completed, Ordering::SeqCst);
    }

    // ===== Item tasks =====

    /// Installs the task's item set and returns the indices still to process
    ///
    /// Items settled in a previous run (completed or skipped) are marked
    /// without re-execution and counted towards this run's counters.
    pub fn install_items(&self, keys: Vec<String>) -> Vec<usize> {
        let table = self.items.get_or_init(|| {
            let table = ItemTable::new(keys);
            self.total.store(table.len() as u64, Ordering::SeqCst);

            let restored = std::mem::take(&mut *lock(&self.restored_items));
            for index in 0..table.len() {
                if let Some(outcome) = restored.get(table.key(index)) {
                    if outcome.is_final() && table.finish(index, *outcome) {
                        self.bump(*outcome);
                    }
                }
            }
            table
        });

        table.pending_indices()
    }

    /// Item table, once installed
    pub fn items(&self) -> Option<&ItemTable> {
        self.items.get()
    }

    /// Key of the item at `index`
    pub fn item_key(&self, index: usize) -> Option<&str> {
        self.items.get().map(|table| table.key(index))
    }

    /// Settles the item at `index`; returns false if it was already settled
    pub fn record(&self, index: usize, outcome: ItemOutcome) -> bool {
        let Some(table) = self.items.get() else {
            return false;
        };
        if table.finish(index, outcome) {
            self.bump(outcome);
            true
        } else {
            false
        }
    }

    /// Settled items of this task, including ones carried over from a checkpoint
    /// but not yet applied to an item table
    pub fn finished_items(&self) -> BTreeMap<String, ItemOutcome> {
        match self.items.get() {
            Some(table) => table.finished(),
            None => lock(&self.restored_items).clone(),
        }
    }

    fn bump(&self, outcome: ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Completed => &self.completed,
            ItemOutcome::Failed => &self.failed,
            ItemOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    // ===== Checkpoint restore =====

    /// Applies persisted state to a freshly created task
    ///
    /// A task persisted as Completed becomes Skipped and keeps its counters for
    /// display. Any other task stays Pending and keeps only its cursor: the
    /// listing page to continue from, or the items already settled.
    pub fn restore(
        &self,
        persisted: TaskStatus,
        counters: TaskCounters,
        next_page: Option<u32>,
        finished: BTreeMap<String, ItemOutcome>,
    ) -> Result<(), HarvestError> {
        if TaskStatus::restored(persisted) == TaskStatus::Skipped {
            self.total.store(
                counters.total.unwrap_or(counters.settled()),
                Ordering::SeqCst,
            );
            self.completed.store(counters.completed, Ordering::SeqCst);
            self.failed.store(counters.failed, Ordering::SeqCst);
            self.skipped.store(counters.skipped, Ordering::SeqCst);
            return self.transition(TaskStatus::Skipped);
        }

        *lock(&self.next_page) = next_page;
        *lock(&self.restored_items) = finished
            .into_iter()
            .filter(|(_, outcome)| outcome.is_final())
            .collect();
        Ok(())
    }
}
