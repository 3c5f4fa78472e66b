//! Write-behind persistence of run events.
//!
//! `enqueue` never waits on the store: events land in a bounded in-memory queue
//! and a debounced task flushes them in fixed-size batches. Store failures are
//! logged and the work is put back for the next attempt; while a run is active
//! the registry stays authoritative, so nothing user-visible depends on a flush
//! succeeding.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::WriterCfg;
use crate::events::{EventKind, RunEvent, RunRecord, StatusChange, SummaryDelta};
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queue full; the incoming line was discarded.
    DroppedLine,
    /// Queue full; the oldest pending line made room for this event.
    EvictedLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Drained { events: usize },
    /// Another flush is in progress; it will pick up the work.
    Busy,
    Failed,
}

#[derive(Clone)]
pub struct EventLogWriter {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: WriterCfg,
    store: Arc<dyn EventStore>,
    pending: Mutex<Pending>,
    flush_scheduled: AtomicBool,
    flushing: AtomicBool,
    dropped_lines: AtomicU64,
    rejected_events: AtomicU64,
}

#[derive(Default)]
struct Pending {
    created: Vec<RunRecord>,
    events: VecDeque<RunEvent>,
    /// Summaries whose events are already durable but whose row update failed.
    summaries: Vec<SummaryDelta>,
    statuses: Vec<StatusChange>,
}

struct Work {
    created: Vec<RunRecord>,
    batch: Vec<RunEvent>,
    statuses: Vec<StatusChange>,
}

impl EventLogWriter {
    pub fn new(cfg: WriterCfg, store: Arc<dyn EventStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                pending: Mutex::new(Pending::default()),
                flush_scheduled: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                dropped_lines: AtomicU64::new(0),
                rejected_events: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Hot path. Never blocks on I/O. Progress and error events are never dropped.
    pub fn enqueue(&self, event: RunEvent) -> Enqueued {
        let outcome = {
            let mut p = self.inner.pending.lock();
            if p.events.len() < self.inner.cfg.queue_capacity {
                p.events.push_back(event);
                Enqueued::Queued
            } else if event.kind == EventKind::Line {
                Enqueued::DroppedLine
            } else if let Some(pos) = p.events.iter().position(|e| e.kind == EventKind::Line) {
                p.events.remove(pos);
                p.events.push_back(event);
                Enqueued::EvictedLine
            } else {
                p.events.push_back(event);
                Enqueued::Queued
            }
        };
        if outcome != Enqueued::Queued {
            let n = self.inner.dropped_lines.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 1000 == 0 {
                tracing::warn!(dropped_lines = n, capacity = self.inner.cfg.queue_capacity, "event queue full, dropping line events");
            }
        }
        self.schedule();
        outcome
    }

    /// Best-effort durable "created" row, written ahead of the run's events.
    pub fn record_created(&self, record: RunRecord) {
        self.inner.pending.lock().created.push(record);
        self.flush_now();
    }

    /// Queue a status transition; applied once the run's earlier events are durable.
    pub fn record_status(&self, change: StatusChange) {
        self.inner.pending.lock().statuses.push(change);
        self.schedule();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().events.len()
    }

    pub fn dropped_lines(&self) -> u64 {
        self.inner.dropped_lines.load(Ordering::Relaxed)
    }

    /// Events the store refused as invalid data and that were dropped.
    pub fn rejected_events(&self) -> u64 {
        self.inner.rejected_events.load(Ordering::Relaxed)
    }

    /// Whether this run still has events on their way to the store.
    pub fn holds(&self, run_id: &str) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
            || self.inner.pending.lock().events.iter().any(|e| e.run_id == run_id)
    }

    fn has_pending(&self) -> bool {
        let p = self.inner.pending.lock();
        !(p.created.is_empty() && p.events.is_empty() && p.summaries.is_empty() && p.statuses.is_empty())
    }

    fn schedule(&self) {
        self.schedule_after(Duration::from_millis(self.inner.cfg.debounce_ms));
    }

    fn schedule_after(&self, delay: Duration) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            self.inner.flush_scheduled.store(false, Ordering::Release);
            tracing::debug!("no runtime available, flush deferred");
            return;
        };
        let writer = self.clone();
        rt.spawn(async move {
            tokio::time::sleep(delay).await;
            writer.inner.flush_scheduled.store(false, Ordering::Release);
            writer.flush().await;
        });
    }

    /// Flush immediately, skipping the debounce. Used for stop/finish transitions.
    pub fn flush_now(&self) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let writer = self.clone();
        rt.spawn(async move {
            writer.flush().await;
        });
    }

    /// Drain the queue batch by batch. Only one flush runs at a time.
    pub async fn flush(&self) -> FlushOutcome {
        if self.inner.flushing.swap(true, Ordering::AcqRel) {
            return FlushOutcome::Busy;
        }
        let outcome = self.flush_until_drained().await;
        self.inner.flushing.store(false, Ordering::Release);
        self.after_flush(outcome);
        outcome
    }

    /// A flush that lost the race returned `Busy`, so whatever it meant to
    /// write is picked up here.
    fn after_flush(&self, outcome: FlushOutcome) {
        if outcome == FlushOutcome::Failed {
            self.schedule_after(Duration::from_millis(self.inner.cfg.retry_ms));
        } else if self.has_pending() {
            self.schedule_after(Duration::ZERO);
        }
    }

    /// Flush until empty or `within` elapses. Returns whether everything landed.
    pub async fn drain(&self, within: Duration) -> bool {
        let attempt = async {
            loop {
                // spawned so a timeout never cancels a flush halfway through a batch
                let writer = self.clone();
                let outcome = tokio::spawn(async move { writer.flush().await })
                    .await
                    .unwrap_or(FlushOutcome::Failed);
                match outcome {
                    FlushOutcome::Drained { .. } if !self.has_pending() => return,
                    FlushOutcome::Failed => {
                        tokio::time::sleep(Duration::from_millis(self.inner.cfg.retry_ms)).await
                    }
                    _ => tokio::time::sleep(Duration::from_millis(25)).await,
                }
            }
        };
        tokio::time::timeout(within, attempt).await.is_ok()
    }

    async fn flush_until_drained(&self) -> FlushOutcome {
        let store = self.inner.store.clone();
        let mut written = 0;
        loop {
            let work = self.take_work();
            let staged = !self.inner.pending.lock().summaries.is_empty();
            if work.created.is_empty() && work.batch.is_empty() && work.statuses.is_empty() && !staged {
                return FlushOutcome::Drained { events: written };
            }

            if !work.created.is_empty() {
                if let Err(e) = store.create_runs(&work.created).await {
                    tracing::warn!(error = %e, runs = work.created.len(), "run create failed, will retry");
                    self.requeue(work);
                    return FlushOutcome::Failed;
                }
            }

            if !work.batch.is_empty() {
                let landed = match store.append_events(&work.batch).await {
                    Ok(()) => work.batch,
                    Err(e) if e.is_permanent() => {
                        tracing::warn!(error = %e, batch = work.batch.len(), "event batch rejected, inserting row by row");
                        match self.append_each(&store, work.batch).await {
                            Ok(landed) => landed,
                            Err(rest) => {
                                self.requeue(Work { created: Vec::new(), batch: rest, statuses: work.statuses });
                                return FlushOutcome::Failed;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, batch = work.batch.len(), "event batch insert failed, will retry");
                        self.requeue(Work { created: Vec::new(), ..work });
                        return FlushOutcome::Failed;
                    }
                };
                written += landed.len();
                tracing::debug!(batch = landed.len(), "event batch persisted");
                self.stage_summaries(SummaryDelta::from_batch(&landed));
            }

            if !self.flush_summaries().await {
                self.requeue(Work { created: Vec::new(), batch: Vec::new(), statuses: work.statuses });
                return FlushOutcome::Failed;
            }

            if !work.statuses.is_empty() {
                if let Err(e) = store.apply_statuses(&work.statuses).await {
                    tracing::warn!(error = %e, "status update failed, will retry");
                    self.requeue(Work { created: Vec::new(), batch: Vec::new(), statuses: work.statuses });
                    return FlushOutcome::Failed;
                }
            }
        }
    }

    /// Pop the next batch plus any status changes whose runs have nothing left in the queue.
    fn take_work(&self) -> Work {
        let mut guard = self.inner.pending.lock();
        let p = &mut *guard;
        let created = std::mem::take(&mut p.created);
        let n = p.events.len().min(self.inner.cfg.batch_size);
        let batch: Vec<RunEvent> = p.events.drain(..n).collect();

        let statuses = if p.statuses.is_empty() {
            Vec::new()
        } else if p.events.is_empty() {
            std::mem::take(&mut p.statuses)
        } else {
            let busy: HashSet<&str> = p.events.iter().map(|e| e.run_id.as_str()).collect();
            let (ready, held): (Vec<_>, Vec<_>) =
                std::mem::take(&mut p.statuses).into_iter().partition(|s| !busy.contains(s.run_id.as_str()));
            p.statuses = held;
            ready
        };
        Work { created, batch, statuses }
    }

    /// One insert per event; events the store rejects outright are dropped.
    /// On a transient failure the unwritten remainder comes back as `Err`.
    async fn append_each(&self, store: &Arc<dyn EventStore>, batch: Vec<RunEvent>) -> Result<Vec<RunEvent>, Vec<RunEvent>> {
        let mut landed = Vec::with_capacity(batch.len());
        let mut rest = batch.into_iter();
        while let Some(ev) = rest.next() {
            match store.append_events(std::slice::from_ref(&ev)).await {
                Ok(()) => landed.push(ev),
                Err(e) if e.is_permanent() => {
                    self.inner.rejected_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(run_id = %ev.run_id, seq = ev.seq, error = %e, "event rejected by store, dropped");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event insert failed, will retry");
                    self.stage_summaries(SummaryDelta::from_batch(&landed));
                    let mut left = vec![ev];
                    left.extend(rest);
                    return Err(left);
                }
            }
        }
        Ok(landed)
    }

    fn requeue(&self, work: Work) {
        let mut p = self.inner.pending.lock();
        let mut created = work.created;
        created.append(&mut p.created);
        p.created = created;
        for ev in work.batch.into_iter().rev() {
            p.events.push_front(ev);
        }
        let mut statuses = work.statuses;
        statuses.append(&mut p.statuses);
        p.statuses = statuses;
    }

    fn stage_summaries(&self, deltas: Vec<SummaryDelta>) {
        let mut p = self.inner.pending.lock();
        for d in deltas {
            match p.summaries.iter_mut().find(|s| s.run_id == d.run_id) {
                Some(existing) => existing.absorb(d),
                None => p.summaries.push(d),
            }
        }
    }

    async fn flush_summaries(&self) -> bool {
        let staged = std::mem::take(&mut self.inner.pending.lock().summaries);
        if staged.is_empty() {
            return true;
        }
        match self.inner.store.merge_summaries(&staged).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, runs = staged.len(), "summary update failed, will retry");
                let newer = std::mem::replace(&mut self.inner.pending.lock().summaries, staged);
                self.stage_summaries(newer);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RunMeta, RunStatus};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn cfg(capacity: usize, batch: usize) -> WriterCfg {
        WriterCfg { queue_capacity: capacity, batch_size: batch, debounce_ms: 250, retry_ms: 2000 }
    }

    fn ev(run: &str, seq: i64, kind: EventKind) -> RunEvent {
        let payload = (kind == EventKind::Progress).then(|| json!({"fraction": 0.5}));
        RunEvent { run_id: run.into(), seq, kind, message: format!("m{seq}"), payload, ts: Utc::now() }
    }

    fn setup(capacity: usize, batch: usize) -> (Arc<MemoryStore>, EventLogWriter) {
        let store = Arc::new(MemoryStore::new());
        let writer = EventLogWriter::new(cfg(capacity, batch), store.clone());
        (store, writer)
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_debounce() {
        let (store, writer) = setup(100, 250);
        for i in 1..=3 {
            writer.enqueue(ev("r", i, EventKind::Line));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.event_count("r"), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.event_count("r"), 3);
        assert_eq!(store.appended_batches(), 1);
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_in_fixed_batches() {
        let (store, writer) = setup(100, 2);
        for i in 1..=5 {
            writer.enqueue(ev("r", i, EventKind::Line));
        }
        assert_eq!(writer.flush().await, FlushOutcome::Drained { events: 5 });
        assert_eq!(store.appended_batches(), 3);
    }

    #[tokio::test]
    async fn full_queue_only_sheds_lines() {
        let (_store, writer) = setup(3, 250);
        for i in 1..=3 {
            assert_eq!(writer.enqueue(ev("r", i, EventKind::Line)), Enqueued::Queued);
        }
        assert_eq!(writer.enqueue(ev("r", 4, EventKind::Line)), Enqueued::DroppedLine);
        assert_eq!(writer.enqueue(ev("r", 5, EventKind::Progress)), Enqueued::EvictedLine);
        assert_eq!(writer.enqueue(ev("r", 6, EventKind::Error)), Enqueued::EvictedLine);
        assert_eq!(writer.enqueue(ev("r", 7, EventKind::Progress)), Enqueued::EvictedLine);
        assert_eq!(writer.pending_len(), 3);

        // no lines left to evict: progress/error still get in
        assert_eq!(writer.enqueue(ev("r", 8, EventKind::Error)), Enqueued::Queued);
        assert_eq!(writer.pending_len(), 4);
        assert_eq!(writer.dropped_lines(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_events_and_retries() {
        let (store, writer) = setup(100, 250);
        store.set_unavailable(true);
        writer.enqueue(ev("r", 1, EventKind::Line));
        writer.enqueue(ev("r", 2, EventKind::Progress));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.pending_len(), 2);

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(store.event_count("r"), 2);
        let row = store.run_summary("r").await.unwrap().unwrap();
        assert_eq!(row.line_count, 2);
        assert_eq!(row.last_line.as_deref(), Some("m1"));
        assert_eq!(row.progress, Some(json!({"fraction": 0.5})));
    }

    #[tokio::test(start_paused = true)]
    async fn status_lands_after_the_runs_events() {
        let (store, writer) = setup(100, 1);
        writer.record_created(RunRecord {
            id: "r".into(),
            created_at: Utc::now(),
            meta: RunMeta { job: "build".into(), ..Default::default() },
        });
        writer.enqueue(ev("r", 1, EventKind::Line));
        writer.enqueue(ev("r", 2, EventKind::Line));
        writer.record_status(StatusChange {
            run_id: "r".into(),
            status: RunStatus::Done,
            exit_code: Some(0),
            error: None,
            finished_at: Some(Utc::now()),
            at: Utc::now(),
        });

        // batch size 1: the status is held until both events are written
        let work = writer.take_work();
        assert_eq!(work.batch.len(), 1);
        assert!(work.statuses.is_empty());
        writer.requeue(work);

        writer.flush().await;
        let row = store.run_summary("r").await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Done);
        assert_eq!(row.exit_code, Some(0));
        assert_eq!(row.line_count, 2);
        assert_eq!(row.job.as_deref(), Some("build"));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_skips_debounce() {
        let (store, writer) = setup(100, 250);
        writer.enqueue(ev("r", 1, EventKind::Line));
        writer.flush_now();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.event_count("r"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_when_store_stays_down() {
        let (store, writer) = setup(100, 250);
        store.set_unavailable(true);
        writer.enqueue(ev("r", 1, EventKind::Line));
        assert!(!writer.drain(Duration::from_secs(5)).await);
        store.set_unavailable(false);
        assert!(writer.drain(Duration::from_secs(5)).await);
        assert_eq!(store.event_count("r"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn work_left_after_a_flush_is_picked_up() {
        let (store, writer) = setup(100, 250);
        // queued while a flush was running, so the debounced flush came back Busy
        writer.inner.pending.lock().events.push_back(ev("r", 1, EventKind::Line));
        writer.after_flush(FlushOutcome::Drained { events: 0 });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.event_count("r"), 1);
        assert_eq!(writer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_row_is_dropped_and_the_rest_lands() {
        let (store, writer) = setup(100, 250);
        writer.enqueue(ev("r", 1, EventKind::Line));
        let mut bad = ev("r", 2, EventKind::Line);
        bad.message = "bin\0ary".into();
        writer.enqueue(bad);
        writer.enqueue(ev("r", 3, EventKind::Progress));
        writer.enqueue(ev("other", 1, EventKind::Line));

        assert_eq!(writer.flush().await, FlushOutcome::Drained { events: 3 });
        assert_eq!(store.event_count("r"), 2);
        assert_eq!(store.event_count("other"), 1);
        assert_eq!(writer.rejected_events(), 1);
        assert_eq!(writer.pending_len(), 0);

        // nothing stuck at the head of the queue
        writer.enqueue(ev("r", 4, EventKind::Line));
        assert_eq!(writer.flush().await, FlushOutcome::Drained { events: 1 });
        assert_eq!(store.event_count("r"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn holds_reports_queued_runs() {
        let (_store, writer) = setup(100, 250);
        writer.enqueue(ev("r", 1, EventKind::Line));
        assert!(writer.holds("r"));
        assert!(!writer.holds("other"));
    }
}

