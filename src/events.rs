use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Line,
    Progress,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Line => "line",
            EventKind::Progress => "progress",
            EventKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "line" => Ok(EventKind::Line),
            "progress" => Ok(EventKind::Progress),
            "error" => Ok(EventKind::Error),
            other => Err(StoreError::Corrupt { field: "kind", value: other.to_string() }),
        }
    }
}

/// One ordered record of job output. `seq` starts at 1 per run and is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub seq: i64,
    pub kind: EventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub ts: DateTime<Utc>,
}

impl RunEvent {
    /// SSE event name. Errors are delivered as visible lines.
    pub fn wire_name(&self) -> &'static str {
        match self.kind {
            EventKind::Progress => "progress",
            EventKind::Line | EventKind::Error => "line",
        }
    }

    /// SSE data: raw text for lines, JSON for progress snapshots.
    pub fn wire_data(&self) -> String {
        match (self.kind, &self.payload) {
            (EventKind::Progress, Some(p)) => p.to_string(),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Stopped,
    Error,
}

impl RunStatus {
    /// Status is always derived, never stored on the in-memory run.
    pub fn derive(finished: bool, stopped: bool, exit_code: Option<i32>, error: Option<&str>) -> Self {
        if stopped {
            RunStatus::Stopped
        } else if !finished {
            RunStatus::Running
        } else if error.is_some() || exit_code != Some(0) {
            RunStatus::Error
        } else {
            RunStatus::Done
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "stopped" => Ok(RunStatus::Stopped),
            "error" => Ok(RunStatus::Error),
            other => Err(StoreError::Corrupt { field: "status", value: other.to_string() }),
        }
    }
}

/// Caller-supplied description of a run. Opaque to the tracker apart from
/// `tenant`, which `list` can filter on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default)]
    pub scope: Value,
    #[serde(default)]
    pub flags: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub meta: RunMeta,
}

/// Terminal or stop transition destined for the durable summary row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

/// Per-run summary fields derived from a flushed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDelta {
    pub run_id: String,
    pub line_count: i64,
    pub last_line: Option<String>,
    pub progress: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl SummaryDelta {
    /// Fold a newer delta into this one. Counters never move backwards and
    /// absent fields never erase present ones.
    pub fn absorb(&mut self, newer: SummaryDelta) {
        self.line_count = self.line_count.max(newer.line_count);
        if newer.last_line.is_some() {
            self.last_line = newer.last_line;
        }
        if newer.progress.is_some() {
            self.progress = newer.progress;
        }
        self.updated_at = self.updated_at.max(newer.updated_at);
    }

    /// Summarize a batch, keeping the latest line and progress per run in batch order.
    pub fn from_batch(batch: &[RunEvent]) -> Vec<SummaryDelta> {
        let mut order: Vec<String> = Vec::new();
        let mut by_run: HashMap<String, SummaryDelta> = HashMap::new();
        for ev in batch {
            let delta = SummaryDelta {
                run_id: ev.run_id.clone(),
                line_count: ev.seq,
                last_line: match ev.kind {
                    EventKind::Line | EventKind::Error => Some(ev.message.clone()),
                    EventKind::Progress => None,
                },
                progress: match ev.kind {
                    EventKind::Progress => ev.payload.clone(),
                    _ => None,
                },
                updated_at: ev.ts,
            };
            match by_run.get_mut(&ev.run_id) {
                Some(existing) => existing.absorb(delta),
                None => {
                    order.push(ev.run_id.clone());
                    by_run.insert(ev.run_id.clone(), delta);
                }
            }
        }
        order.into_iter().filter_map(|id| by_run.remove(&id)).collect()
    }
}

/// Durable per-run row used for cheap polling and the streaming fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub job: Option<String>,
    pub tenant: Option<String>,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub line_count: i64,
    pub last_line: Option<String>,
    pub progress: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    /// Whether the run's process is known to have exited. A stopped run may not
    /// be finished yet.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some() || matches!(self.status, RunStatus::Done | RunStatus::Error)
    }
}

/// Postgres TEXT and JSONB cannot hold NUL, so it is stored as U+FFFD.
pub fn scrub_nul(text: &str) -> Cow<'_, str> {
    if text.contains('\0') {
        Cow::Owned(text.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(text)
    }
}

/// [`scrub_nul`] over every string and key in a JSON value.
pub fn scrub_json_nul(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains('\0') {
                *s = s.replace('\0', "\u{FFFD}");
            }
        }
        Value::Array(items) => items.iter_mut().for_each(scrub_json_nul),
        Value::Object(map) => {
            if map.keys().any(|k| k.contains('\0')) {
                *map = std::mem::take(map)
                    .into_iter()
                    .map(|(k, v)| (scrub_nul(&k).into_owned(), v))
                    .collect();
            }
            map.values_mut().for_each(scrub_json_nul);
        }
        _ => {}
    }
}
