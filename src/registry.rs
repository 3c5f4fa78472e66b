//! Authoritative in-memory state for runs owned by this process.
//!
//! The registry is constructed once and handed around as `Arc<Registry>`; it is
//! never a global. Every operation takes the run table lock, mutates, and
//! releases it before touching the writer or the process controller, so no
//! operation holds the lock across an await. Unknown run ids are silently
//! ignored by every mutating call.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RegistryCfg;
use crate::events::{scrub_json_nul, scrub_nul, EventKind, RunEvent, RunMeta, RunRecord, RunStatus, StatusChange};
use crate::process::{ProcessController, ProcessHandle, ProcessState, Termination};
use crate::progress::{self, ProgressSnapshot};
use crate::writer::EventLogWriter;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunNotice {
    Created { run_id: String },
    Stopping { run_id: String },
    Finished { run_id: String, status: RunStatus, exit_code: Option<i32> },
}

/// Point-in-time copy of a run, safe to hand to API callers.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub meta: RunMeta,
    pub status: RunStatus,
    pub finished: bool,
    pub stopped: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub line_count: i64,
    pub last_line: Option<String>,
    pub progress: Option<ProgressSnapshot>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Terminal {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Buffered events after a cursor, plus the terminal state once the run has finished.
#[derive(Debug, Clone)]
pub struct Tail {
    pub events: Vec<RunEvent>,
    /// Oldest seq still buffered; anything older was trimmed from memory.
    pub first_seq: Option<i64>,
    pub terminal: Option<Terminal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    pub active_only: bool,
    pub limit: usize,
    pub tenant: Option<String>,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self { active_only: false, limit: 50, tenant: None }
    }
}

struct RunEntry {
    id: String,
    created_at: DateTime<Utc>,
    meta: RunMeta,
    events: VecDeque<RunEvent>,
    next_seq: i64,
    last_line: Option<String>,
    progress: Option<ProgressSnapshot>,
    progress_started: Option<DateTime<Utc>>,
    finished: bool,
    stopped: bool,
    exit_code: Option<i32>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    process: ProcessState,
}

impl RunEntry {
    fn status(&self) -> RunStatus {
        RunStatus::derive(self.finished, self.stopped, self.exit_code, self.error.as_deref())
    }

    fn emit(
        &mut self,
        cfg: &RegistryCfg,
        kind: EventKind,
        message: String,
        payload: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RunEvent {
        let event = RunEvent { run_id: self.id.clone(), seq: self.next_seq, kind, message, payload, ts: now };
        self.next_seq += 1;
        if kind != EventKind::Progress {
            self.last_line = Some(event.message.clone());
        }
        self.events.push_back(event.clone());
        // memory only; the durable log keeps everything
        if self.events.len() > cfg.line_buffer_max {
            let excess = self.events.len() - cfg.line_buffer_retain;
            self.events.drain(..excess);
        }
        event
    }

    fn status_change(&self, now: DateTime<Utc>) -> StatusChange {
        StatusChange {
            run_id: self.id.clone(),
            status: self.status(),
            exit_code: self.exit_code,
            error: self.error.clone(),
            finished_at: self.finished_at,
            at: now,
        }
    }

    fn terminal(&self) -> Option<Terminal> {
        self.finished.then(|| Terminal { status: self.status(), exit_code: self.exit_code, error: self.error.clone() })
    }

    fn view(&self) -> RunView {
        RunView {
            id: self.id.clone(),
            created_at: self.created_at,
            meta: self.meta.clone(),
            status: self.status(),
            finished: self.finished,
            stopped: self.stopped,
            exit_code: self.exit_code,
            error: self.error.clone(),
            line_count: self.next_seq - 1,
            last_line: self.last_line.clone(),
            progress: self.progress.clone(),
            finished_at: self.finished_at,
            pid: self.process.handle().map(|h| h.pid),
        }
    }
}

/// `run-<utc timestamp>-<random>`; the random half makes same-millisecond collisions negligible.
pub fn new_run_id() -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"), &rand[..12])
}

pub struct Registry {
    cfg: RegistryCfg,
    runs: Mutex<HashMap<String, RunEntry>>,
    writer: EventLogWriter,
    controller: ProcessController,
    notices: broadcast::Sender<RunNotice>,
}

impl Registry {
    pub fn new(cfg: RegistryCfg, writer: EventLogWriter, controller: ProcessController) -> Arc<Self> {
        let (notices, _) = broadcast::channel(256);
        Arc::new(Self { cfg, runs: Mutex::new(HashMap::new()), writer, controller, notices })
    }

    pub fn writer(&self) -> &EventLogWriter {
        &self.writer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunNotice> {
        self.notices.subscribe()
    }

    pub fn create(&self, mut meta: RunMeta) -> RunView {
        meta.job = scrub_nul(&meta.job).into_owned();
        meta.tenant = meta.tenant.map(|t| scrub_nul(&t).into_owned());
        scrub_json_nul(&mut meta.scope);
        scrub_json_nul(&mut meta.flags);
        let now = Utc::now();
        let id = new_run_id();
        let entry = RunEntry {
            id: id.clone(),
            created_at: now,
            meta: meta.clone(),
            events: VecDeque::new(),
            next_seq: 1,
            last_line: None,
            progress: None,
            progress_started: None,
            finished: false,
            stopped: false,
            exit_code: None,
            error: None,
            finished_at: None,
            process: ProcessState::NoProcess,
        };
        let view = entry.view();
        self.runs.lock().insert(id.clone(), entry);

        self.writer.record_created(RunRecord { id: id.clone(), created_at: now, meta });
        let _ = self.notices.send(RunNotice::Created { run_id: id.clone() });
        tracing::info!(run_id = %id, job = %view.meta.job, "run created");
        view
    }

    pub fn get(&self, id: &str) -> Option<RunView> {
        self.runs.lock().get(id).map(RunEntry::view)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.runs.lock().contains_key(id)
    }

    /// Newest first.
    pub fn list(&self, filter: &ListFilter) -> Vec<RunView> {
        let runs = self.runs.lock();
        let mut views: Vec<RunView> = runs
            .values()
            .filter(|r| !filter.active_only || !r.finished)
            .filter(|r| filter.tenant.is_none() || r.meta.tenant == filter.tenant)
            .map(RunEntry::view)
            .collect();
        drop(runs);
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        views.truncate(filter.limit);
        views
    }

    /// Feed one line of job output. Progress lines update the snapshot; everything
    /// else, including malformed progress lines, is kept as text.
    pub fn append_line(&self, id: &str, text: &str) {
        let text = scrub_nul(text);
        let now = Utc::now();
        let event = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(id) else {
                return;
            };
            match progress::parse_line(&text) {
                Some(line) => {
                    let started = *run.progress_started.get_or_insert(now);
                    let snapshot = line.snapshot(started, now);
                    let payload = serde_json::to_value(&snapshot).ok().map(|mut v| {
                        scrub_json_nul(&mut v);
                        v
                    });
                    run.progress = Some(snapshot);
                    run.emit(&self.cfg, EventKind::Progress, text.to_string(), payload, now)
                }
                None => run.emit(&self.cfg, EventKind::Line, text.to_string(), None, now),
            }
        };
        self.writer.enqueue(event);
    }

    pub fn attach_process(self: &Arc<Self>, id: &str, handle: ProcessHandle) {
        let stop_now = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(id) else {
                return;
            };
            if run.finished {
                return;
            }
            if run.stopped {
                run.process = ProcessState::Stopping(handle);
                true
            } else {
                run.process = ProcessState::Attached(handle);
                false
            }
        };
        tracing::debug!(run_id = %id, pid = handle.pid, "process attached");
        if stop_now {
            self.begin_termination(id, handle);
        }
    }

    /// Request termination. Returns `false` when there was nothing to stop.
    /// Completion is observed later through `end`.
    pub fn stop(self: &Arc<Self>, id: &str) -> bool {
        let now = Utc::now();
        let (handle, change) = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(id) else {
                return false;
            };
            if run.stopped || run.finished {
                return false;
            }
            run.stopped = true;
            let handle = match run.process {
                ProcessState::Attached(h) => {
                    run.process = ProcessState::Stopping(h);
                    Some(h)
                }
                _ => None,
            };
            (handle, run.status_change(now))
        };
        tracing::info!(run_id = %id, "stop requested");
        self.writer.record_status(change);
        self.writer.flush_now();
        let _ = self.notices.send(RunNotice::Stopping { run_id: id.to_string() });
        if let Some(h) = handle {
            self.begin_termination(id, h);
        }
        true
    }

    fn begin_termination(self: &Arc<Self>, id: &str, handle: ProcessHandle) {
        self.controller.terminate(handle, Termination::Graceful);
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry: Weak<Registry> = Arc::downgrade(self);
        let id = id.to_string();
        let grace = self.cfg.stop_grace();
        rt.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if let Some(h) = registry.still_stopping(&id) {
                tracing::warn!(run_id = %id, pid = h.pid, "no exit within grace period, forcing termination");
                registry.controller.terminate(h, Termination::Forced);
            }
        });
    }

    fn still_stopping(&self, id: &str) -> Option<ProcessHandle> {
        match self.runs.lock().get(id)?.process {
            ProcessState::Stopping(h) => Some(h),
            _ => None,
        }
    }

    /// Exit reported by the launcher. Only the first call for a run has any effect.
    pub fn end(&self, id: &str, exit_code: i32) {
        let now = Utc::now();
        let (synthesized, change) = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(id) else {
                return;
            };
            if run.finished {
                return;
            }
            let synthesized = if exit_code != 0 && run.error.is_none() {
                let msg = format!("Job exited with code {exit_code}");
                run.error = Some(msg.clone());
                Some(run.emit(&self.cfg, EventKind::Error, msg, Some(json!({ "error": true })), now))
            } else {
                None
            };
            run.finished = true;
            run.exit_code = Some(exit_code);
            run.finished_at = Some(now);
            run.process = ProcessState::Exited;
            (synthesized, run.status_change(now))
        };
        if let Some(ev) = synthesized {
            self.writer.enqueue(ev);
        }
        tracing::info!(run_id = %id, status = change.status.as_str(), exit_code, "run finished");
        let notice = RunNotice::Finished { run_id: id.to_string(), status: change.status, exit_code: Some(exit_code) };
        self.writer.record_status(change);
        self.writer.flush_now();
        let _ = self.notices.send(notice);
    }

    /// Record a job-level error. A run that never got a process is finalized at once.
    pub fn error(&self, id: &str, err: &str) {
        let scrubbed = scrub_nul(err);
        let err: &str = &scrubbed;
        let now = Utc::now();
        let (event, no_process) = {
            let mut runs = self.runs.lock();
            let Some(run) = runs.get_mut(id) else {
                return;
            };
            if run.finished {
                tracing::debug!(run_id = %id, error = err, "error after finish ignored");
                return;
            }
            if run.error.is_none() {
                run.error = Some(err.to_string());
            }
            let event = run.emit(&self.cfg, EventKind::Error, err.to_string(), Some(json!({ "error": true })), now);
            (event, matches!(run.process, ProcessState::NoProcess))
        };
        tracing::warn!(run_id = %id, error = err, "run reported error");
        self.writer.enqueue(event);
        if no_process {
            self.end(id, 1);
        }
    }

    pub fn tail(&self, id: &str, after_seq: i64) -> Option<Tail> {
        let runs = self.runs.lock();
        let run = runs.get(id)?;
        Some(Tail {
            events: run.events.iter().filter(|e| e.seq > after_seq).cloned().collect(),
            first_seq: run.events.front().map(|e| e.seq),
            terminal: run.terminal(),
        })
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.runs.lock().values().filter(|r| !r.finished).map(|r| r.id.clone()).collect()
    }

    /// Drop finished runs older than the retention window. Returns how many went.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.cfg.retention_secs as i64);
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, r| match (r.finished, r.finished_at) {
            (true, Some(at)) => at + retention > now,
            _ => true,
        });
        before - runs.len()
    }

    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = Duration::from_secs(self.cfg.prune_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let pruned = registry.prune(Utc::now());
                if pruned > 0 {
                    tracing::debug!(pruned, "pruned finished runs");
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::WriterCfg;
    use crate::process::testing::{RecordingSignaller, Sent};
    use crate::store::{EventStore, MemoryStore};

    pub(crate) struct Fixture {
        pub registry: Arc<Registry>,
        pub store: Arc<MemoryStore>,
        pub signals: Arc<RecordingSignaller>,
    }

    pub(crate) fn fixture_with(cfg: RegistryCfg, signals: RecordingSignaller) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let signals = Arc::new(signals);
        let writer = EventLogWriter::new(WriterCfg::default(), store.clone());
        let registry = Registry::new(cfg, writer, ProcessController::new(signals.clone()));
        Fixture { registry, store, signals }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(RegistryCfg::default(), RecordingSignaller::default())
    }

    fn meta(job: &str, tenant: Option<&str>) -> RunMeta {
        RunMeta { job: job.into(), tenant: tenant.map(Into::into), ..Default::default() }
    }

    const PID: ProcessHandle = ProcessHandle { pid: 900, pgid: Some(900) };

    #[test]
    fn run_ids_are_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let f = fixture();
        let a = f.registry.create(meta("a", Some("t1")));
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = f.registry.create(meta("b", Some("t2")));
        tokio::time::sleep(Duration::from_millis(2)).await;
        let c = f.registry.create(meta("c", Some("t1")));
        f.registry.end(&b.id, 0);

        let all = f.registry.list(&ListFilter::default());
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![&c.id, &b.id, &a.id]);

        let active = f.registry.list(&ListFilter { active_only: true, ..Default::default() });
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|r| r.status == RunStatus::Running));

        let t1 = f.registry.list(&ListFilter { tenant: Some("t1".into()), limit: 1, ..Default::default() });
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].id, c.id);
    }

    #[tokio::test]
    async fn lines_and_progress_share_one_sequence() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.append_line(&run.id, "hello");
        f.registry.append_line(&run.id, r#"@@PROGRESS {"totals":{"all":10},"done":{"all":4}}"#);
        f.registry.append_line(&run.id, "world");

        let tail = f.registry.tail(&run.id, 0).unwrap();
        let kinds: Vec<_> = tail.events.iter().map(|e| (e.seq, e.kind)).collect();
        assert_eq!(kinds, vec![(1, EventKind::Line), (2, EventKind::Progress), (3, EventKind::Line)]);

        let view = f.registry.get(&run.id).unwrap();
        assert_eq!(view.line_count, 3);
        assert_eq!(view.last_line.as_deref(), Some("world"));
        assert_eq!(view.progress.unwrap().fraction, Some(0.4));
    }

    #[tokio::test]
    async fn malformed_progress_is_kept_verbatim() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        let bad = r#"@@PROGRESS {"totals": {"all": 10"#;
        f.registry.append_line(&run.id, bad);

        let tail = f.registry.tail(&run.id, 0).unwrap();
        assert_eq!(tail.events[0].kind, EventKind::Line);
        assert_eq!(tail.events[0].message, bad);
        assert!(f.registry.get(&run.id).unwrap().progress.is_none());
    }

    #[tokio::test]
    async fn nul_bytes_in_output_still_reach_the_store() {
        let f = fixture();
        let run = f.registry.create(meta("geo\0", None));
        f.registry.append_line(&run.id, "bin\0ary");
        f.registry.append_line(&run.id, "@@PROGRESS {\"totals\":{\"all\":2},\"done\":{\"all\":1},\"last\":{\"kind\":\"city\",\"city\":\"a\\u0000b\"}}");
        f.registry.error(&run.id, "bad\0exit");
        f.registry.writer().flush().await;

        let tail = f.registry.tail(&run.id, 0).unwrap();
        assert_eq!(tail.events[0].message, "bin\u{FFFD}ary");
        assert_eq!(tail.events[2].message, "bad\u{FFFD}exit");
        assert!(!tail.events[1].payload.as_ref().unwrap().to_string().contains("\\u0000"));
        assert_eq!(f.store.event_count(&run.id), 3);
        let row = f.store.run_summary(&run.id).await.unwrap().unwrap();
        assert_eq!(row.job.as_deref(), Some("geo\u{FFFD}"));
    }

    #[tokio::test]
    async fn buffer_trims_memory_but_not_sequence() {
        let cfg = RegistryCfg { line_buffer_max: 10, line_buffer_retain: 6, ..Default::default() };
        let f = fixture_with(cfg, RecordingSignaller::default());
        let run = f.registry.create(meta("geo", None));
        for i in 1..=11 {
            f.registry.append_line(&run.id, &format!("line {i}"));
        }
        let tail = f.registry.tail(&run.id, 0).unwrap();
        assert_eq!(tail.events.len(), 6);
        assert_eq!(tail.first_seq, Some(6));
        assert_eq!(tail.events.last().unwrap().seq, 11);
        assert_eq!(f.registry.get(&run.id).unwrap().line_count, 11);

        f.registry.writer().flush().await;
        assert_eq!(f.store.event_count(&run.id), 11);
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let f = fixture();
        f.registry.append_line("nope", "x");
        f.registry.attach_process("nope", PID);
        assert!(!f.registry.stop("nope"));
        f.registry.end("nope", 1);
        f.registry.error("nope", "boom");
        assert!(f.registry.get("nope").is_none());
        assert!(f.registry.tail("nope", 0).is_none());
        assert!(f.signals.sent().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_synthesizes_error_line() {
        let f = fixture();
        let mut notices = f.registry.subscribe();
        let run = f.registry.create(meta("geo", None));
        f.registry.attach_process(&run.id, PID);
        f.registry.end(&run.id, 1);
        f.registry.end(&run.id, 0);

        let tail = f.registry.tail(&run.id, 0).unwrap();
        let last = tail.events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert!(!last.message.is_empty());
        let terminal = tail.terminal.unwrap();
        assert_eq!(terminal.status, RunStatus::Error);
        assert_eq!(terminal.exit_code, Some(1));

        let mut finished = 0;
        while let Ok(n) = notices.try_recv() {
            if matches!(n, RunNotice::Finished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn clean_exit_is_done() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.append_line(&run.id, "ok");
        f.registry.end(&run.id, 0);
        let view = f.registry.get(&run.id).unwrap();
        assert_eq!(view.status, RunStatus::Done);
        assert!(view.error.is_none());
        assert_eq!(view.line_count, 1);
    }

    #[tokio::test]
    async fn error_before_spawn_finalizes() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.error(&run.id, "spawn failed: no such file");

        let view = f.registry.get(&run.id).unwrap();
        assert!(view.finished);
        assert_eq!(view.exit_code, Some(1));
        assert_eq!(view.status, RunStatus::Error);
        assert_eq!(view.error.as_deref(), Some("spawn failed: no such file"));
        // the recorded error is not replaced by a generic one
        let tail = f.registry.tail(&run.id, 0).unwrap();
        assert_eq!(tail.events.len(), 1);
    }

    #[tokio::test]
    async fn error_with_live_process_waits_for_exit() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.attach_process(&run.id, PID);
        f.registry.error(&run.id, "upstream 500");
        assert!(!f.registry.get(&run.id).unwrap().finished);
        f.registry.end(&run.id, 3);
        let tail = f.registry.tail(&run.id, 0).unwrap();
        assert_eq!(tail.events.len(), 1, "no generic line when an error was recorded");
        assert_eq!(tail.terminal.unwrap().error.as_deref(), Some("upstream 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_escalates_after_grace() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.attach_process(&run.id, PID);
        assert!(f.registry.stop(&run.id));
        assert!(!f.registry.stop(&run.id));
        assert_eq!(f.signals.sent(), vec![Sent::Group(900, Termination::Graceful)]);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(
            f.signals.sent(),
            vec![Sent::Group(900, Termination::Graceful), Sent::Group(900, Termination::Forced)]
        );
        assert_eq!(f.registry.get(&run.id).unwrap().status, RunStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_within_grace_cancels_escalation() {
        let f = fixture_with(RegistryCfg::default(), RecordingSignaller { fail_group: true, ..Default::default() });
        let run = f.registry.create(meta("geo", None));
        f.registry.attach_process(&run.id, PID);
        f.registry.stop(&run.id);
        f.registry.end(&run.id, 143);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(
            f.signals.sent(),
            vec![Sent::Group(900, Termination::Graceful), Sent::Process(900, Termination::Graceful)]
        );
        let view = f.registry.get(&run.id).unwrap();
        assert!(view.finished);
        assert_eq!(view.status, RunStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_after_stop_terminates_immediately() {
        let f = fixture();
        let run = f.registry.create(meta("geo", None));
        f.registry.stop(&run.id);
        assert!(f.signals.sent().is_empty());
        f.registry.attach_process(&run.id, PID);
        assert_eq!(f.signals.sent(), vec![Sent::Group(900, Termination::Graceful)]);
    }

    #[tokio::test]
    async fn prune_only_drops_expired_finished_runs() {
        let cfg = RegistryCfg { retention_secs: 60, ..Default::default() };
        let f = fixture_with(cfg, RecordingSignaller::default());
        let done = f.registry.create(meta("a", None));
        let live = f.registry.create(meta("b", None));
        f.registry.end(&done.id, 0);

        assert_eq!(f.registry.prune(Utc::now()), 0);
        assert_eq!(f.registry.prune(Utc::now() + chrono::Duration::seconds(61)), 1);
        assert!(f.registry.get(&done.id).is_none());
        assert!(f.registry.get(&live.id).is_some());

        // stale ids after pruning stay harmless
        f.registry.append_line(&done.id, "late");
        f.registry.end(&done.id, 0);
    }

    #[tokio::test]
    async fn finish_reaches_the_durable_summary() {
        let f = fixture();
        let run = f.registry.create(meta("geo", Some("acme")));
        f.registry.append_line(&run.id, "hello");
        f.registry.end(&run.id, 0);
        f.registry.writer().flush().await;

        let row = f.store.run_summary(&run.id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Done);
        assert_eq!(row.tenant.as_deref(), Some("acme"));
        assert_eq!(row.last_line.as_deref(), Some("hello"));
        assert!(row.finished_at.is_some());
    }
}
