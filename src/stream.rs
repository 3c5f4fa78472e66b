//! Resumable per-run event streams.
//!
//! A stream is a plain `futures` stream of [`Frame`]s; the HTTP layer maps them
//! onto SSE. Each client owns its own cursor, so any number of clients can
//! follow the same run. Dropping the stream (client disconnect) drops every
//! pending tick with it.

use futures_util::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{StreamCfg, StreamSource};
use crate::events::{RunEvent, RunStatus, RunSummary};
use crate::registry::{Registry, Terminal};
use crate::store::EventStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub ok: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndPayload {
    pub fn not_found() -> Self {
        Self { ok: false, status: "not_found".into(), exit_code: None, error: Some("run not found".into()) }
    }
}

impl From<Terminal> for EndPayload {
    fn from(t: Terminal) -> Self {
        Self { ok: t.status == RunStatus::Done, status: t.status.as_str().into(), exit_code: t.exit_code, error: t.error }
    }
}

impl From<&RunSummary> for EndPayload {
    fn from(s: &RunSummary) -> Self {
        Self {
            ok: s.status == RunStatus::Done,
            status: s.status.as_str().into(),
            exit_code: s.exit_code,
            error: s.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Retry(Duration),
    Hello { run_id: String },
    /// A logged event; `name` is `line` or `progress`.
    Event { id: i64, name: &'static str, data: String },
    /// Synthetic keep-alive line with no id, sent when a run has been quiet.
    Heartbeat(String),
    Ping,
    End(EndPayload),
}

impl Frame {
    fn from_event(ev: &RunEvent) -> Self {
        Frame::Event { id: ev.seq, name: ev.wire_name(), data: ev.wire_data() }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub source: StreamSource,
    pub tick: Duration,
    pub fallback_tick: Duration,
    pub fallback_retry: Duration,
    pub heartbeat: Duration,
    pub page_size: i64,
    pub retry_hint: Duration,
}

impl From<&StreamCfg> for StreamSettings {
    fn from(c: &StreamCfg) -> Self {
        Self {
            source: c.source,
            tick: Duration::from_millis(c.tick_ms),
            fallback_tick: Duration::from_millis(c.fallback_tick_ms),
            fallback_retry: Duration::from_millis(c.fallback_retry_ms),
            heartbeat: c.heartbeat(),
            page_size: c.page_size.max(1),
            retry_hint: Duration::from_millis(c.retry_hint_ms),
        }
    }
}

/// Empty polls a stopped run without an exit time gets before its stream closes.
const STOPPED_QUIET_TICKS: u32 = 3;

fn heartbeat_line(idle: Duration) -> String {
    format!("[heartbeat] still running, no output for {}s", idle.as_secs())
}

/// Stream one run to one client, resuming after `last_event_id` (0 = from the start).
pub fn follow_run(
    registry: Arc<Registry>,
    store: Arc<dyn EventStore>,
    settings: StreamSettings,
    run_id: String,
    last_event_id: i64,
) -> impl Stream<Item = Frame> + Send {
    async_stream::stream! {
        yield Frame::Retry(settings.retry_hint);
        yield Frame::Hello { run_id: run_id.clone() };

        let mut cursor = last_event_id.max(0);
        let mut last_activity = Instant::now();

        if settings.source == StreamSource::MemoryFirst {
            while let Some(tail) = registry.tail(&run_id, cursor) {
                // events trimmed from memory are still in the durable log
                if let Some(first) = tail.first_seq.filter(|first| *first > cursor + 1) {
                    match store.events_after(&run_id, cursor, settings.page_size).await {
                        Ok(page) => {
                            let before = cursor;
                            for ev in page.iter().filter(|e| e.seq < first) {
                                cursor = ev.seq;
                                yield Frame::from_event(ev);
                            }
                            if cursor != before {
                                last_activity = Instant::now();
                                continue;
                            }
                            // still queued for the store; a gap the writer no longer holds was shed
                            if registry.writer().holds(&run_id) {
                                yield Frame::Ping;
                                tokio::time::sleep(settings.fallback_retry).await;
                                continue;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(run_id = %run_id, error = %e, "catch-up read failed, retrying");
                            yield Frame::Ping;
                            tokio::time::sleep(settings.fallback_retry).await;
                            continue;
                        }
                    }
                }

                if tail.events.is_empty() {
                    if last_activity.elapsed() >= settings.heartbeat {
                        yield Frame::Heartbeat(heartbeat_line(last_activity.elapsed()));
                        last_activity = Instant::now();
                    }
                } else {
                    for ev in &tail.events {
                        cursor = ev.seq;
                        yield Frame::from_event(ev);
                    }
                    last_activity = Instant::now();
                }
                yield Frame::Ping;

                if let Some(terminal) = tail.terminal {
                    yield Frame::End(terminal.into());
                    return;
                }
                tokio::time::sleep(settings.tick).await;
            }
        }

        // durable log: runs owned by another instance, pruned from memory, or durable-only mode
        let mut quiet_after_stop = 0;
        loop {
            let summary = match store.run_summary(&run_id).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(run_id = %run_id, error = %e, "status query failed, retrying");
                    yield Frame::Ping;
                    tokio::time::sleep(settings.fallback_retry).await;
                    continue;
                }
            };
            let Some(summary) = summary else {
                if registry.contains(&run_id) {
                    // created here but the summary row has not landed yet
                    yield Frame::Ping;
                    tokio::time::sleep(settings.fallback_tick).await;
                    continue;
                }
                yield Frame::End(EndPayload::not_found());
                return;
            };

            let page = match store.events_after(&run_id, cursor, settings.page_size).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(run_id = %run_id, error = %e, "event query failed, retrying");
                    yield Frame::Ping;
                    tokio::time::sleep(settings.fallback_retry).await;
                    continue;
                }
            };
            let full_page = page.len() as i64 >= settings.page_size;

            if page.is_empty() {
                if last_activity.elapsed() >= settings.heartbeat {
                    yield Frame::Heartbeat(heartbeat_line(last_activity.elapsed()));
                    last_activity = Instant::now();
                }
            } else {
                for ev in &page {
                    cursor = ev.seq;
                    yield Frame::from_event(ev);
                }
                last_activity = Instant::now();
            }
            yield Frame::Ping;

            if full_page {
                continue;
            }
            if summary.is_finished() {
                yield Frame::End(EndPayload::from(&summary));
                return;
            }
            if summary.status != RunStatus::Running {
                // stopped but no exit recorded: late output may still land
                quiet_after_stop = if page.is_empty() { quiet_after_stop + 1 } else { 0 };
                if quiet_after_stop >= STOPPED_QUIET_TICKS {
                    yield Frame::End(EndPayload::from(&summary));
                    return;
                }
            }
            tokio::time::sleep(settings.fallback_tick).await;
        }
    }
}
