use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::StoreError;
use crate::events::{RunEvent, RunRecord, RunStatus, RunSummary, StatusChange, SummaryDelta};

/// Durable side of the tracker: a summary row per run plus an append-only event log.
///
/// Writes must be idempotent per `(run_id, seq)` so a retried batch never
/// duplicates events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_runs(&self, runs: &[RunRecord]) -> Result<(), StoreError>;

    async fn append_events(&self, events: &[RunEvent]) -> Result<(), StoreError>;

    async fn merge_summaries(&self, deltas: &[SummaryDelta]) -> Result<(), StoreError>;

    async fn apply_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError>;

    async fn run_summary(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError>;

    /// Events with `seq > after_seq`, ascending, at most `limit`.
    async fn events_after(&self, run_id: &str, after_seq: i64, limit: i64) -> Result<Vec<RunEvent>, StoreError>;
}

/// Whole durable log after `after_seq`, fetched page by page with the same
/// `seq > cursor` query the streaming fallback uses.
pub async fn durable_log(
    store: &dyn EventStore,
    run_id: &str,
    after_seq: i64,
    page_size: i64,
) -> Result<Vec<RunEvent>, StoreError> {
    let page_size = page_size.max(1);
    let mut cursor = after_seq;
    let mut out = Vec::new();
    loop {
        let page = store.events_after(run_id, cursor, page_size).await?;
        let full = page.len() as i64 >= page_size;
        if let Some(last) = page.last() {
            cursor = last.seq;
        }
        out.extend(page);
        if !full {
            return Ok(out);
        }
    }
}

/// In-process store used when no database is configured. Contents die with the process.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
    unavailable: AtomicBool,
    appended_batches: AtomicUsize,
}

#[derive(Default)]
struct MemState {
    summaries: HashMap<String, RunSummary>,
    events: HashMap<String, BTreeMap<i64, RunEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable` until switched back.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn appended_batches(&self) -> usize {
        self.appended_batches.load(Ordering::SeqCst)
    }

    pub fn event_count(&self, run_id: &str) -> usize {
        self.state.lock().events.get(run_id).map_or(0, BTreeMap::len)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

fn blank_summary(id: &str, at: chrono::DateTime<chrono::Utc>) -> RunSummary {
    RunSummary {
        id: id.to_string(),
        job: None,
        tenant: None,
        status: RunStatus::Running,
        exit_code: None,
        error: None,
        line_count: 0,
        last_line: None,
        progress: None,
        created_at: at,
        updated_at: at,
        finished_at: None,
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_runs(&self, runs: &[RunRecord]) -> Result<(), StoreError> {
        self.check()?;
        let mut st = self.state.lock();
        for run in runs {
            let row = st
                .summaries
                .entry(run.id.clone())
                .or_insert_with(|| blank_summary(&run.id, run.created_at));
            row.job = Some(run.meta.job.clone());
            row.tenant = run.meta.tenant.clone();
            row.created_at = run.created_at;
        }
        Ok(())
    }

    async fn append_events(&self, events: &[RunEvent]) -> Result<(), StoreError> {
        self.check()?;
        // same rule as Postgres TEXT: the whole batch fails
        if let Some(bad) = events.iter().find(|ev| ev.message.contains('\0')) {
            return Err(StoreError::Rejected(format!("NUL in message of {}#{}", bad.run_id, bad.seq)));
        }
        let mut st = self.state.lock();
        for ev in events {
            st.events
                .entry(ev.run_id.clone())
                .or_default()
                .entry(ev.seq)
                .or_insert_with(|| ev.clone());
        }
        self.appended_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn merge_summaries(&self, deltas: &[SummaryDelta]) -> Result<(), StoreError> {
        self.check()?;
        let mut st = self.state.lock();
        for d in deltas {
            let row = st
                .summaries
                .entry(d.run_id.clone())
                .or_insert_with(|| blank_summary(&d.run_id, d.updated_at));
            row.line_count = row.line_count.max(d.line_count);
            if d.last_line.is_some() {
                row.last_line = d.last_line.clone();
            }
            if d.progress.is_some() {
                row.progress = d.progress.clone();
            }
            row.updated_at = row.updated_at.max(d.updated_at);
        }
        Ok(())
    }

    async fn apply_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        self.check()?;
        let mut st = self.state.lock();
        for c in changes {
            let row = st
                .summaries
                .entry(c.run_id.clone())
                .or_insert_with(|| blank_summary(&c.run_id, c.at));
            row.status = c.status;
            row.exit_code = c.exit_code.or(row.exit_code);
            if c.error.is_some() {
                row.error = c.error.clone();
            }
            if c.finished_at.is_some() {
                row.finished_at = c.finished_at;
            }
            row.updated_at = row.updated_at.max(c.at);
        }
        Ok(())
    }

    async fn run_summary(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError> {
        self.check()?;
        Ok(self.state.lock().summaries.get(run_id).cloned())
    }

    async fn events_after(&self, run_id: &str, after_seq: i64, limit: i64) -> Result<Vec<RunEvent>, StoreError> {
        self.check()?;
        let st = self.state.lock();
        let Some(log) = st.events.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .range(after_seq.saturating_add(1)..)
            .take(limit.max(0) as usize)
            .map(|(_, ev)| ev.clone())
            .collect())
    }
}
