//! Tagged progress lines emitted by job programs on stdout.
//!
//! A progress line is one of the reserved prefixes followed by exactly one JSON
//! object. Anything that does not match, including a well-prefixed line whose
//! payload fails validation, is ordinary output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const INIT_PREFIX: &str = "@@PROGRESS_INIT ";
pub const UPDATE_PREFIX: &str = "@@PROGRESS ";
pub const END_PREFIX: &str = "@@PROGRESS_END ";

/// Category key holding the overall counts.
pub const ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Init,
    Update,
    End,
}

/// The last geographic unit a job finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LastItem {
    State {
        state: String,
    },
    County {
        county: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    City {
        city: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        county: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
}

impl LastItem {
    pub fn describe(&self) -> String {
        match self {
            LastItem::State { state } => format!("state {state}"),
            LastItem::County { county, state: Some(st) } => format!("county {county}, {st}"),
            LastItem::County { county, state: None } => format!("county {county}"),
            LastItem::City { city, county, state } => {
                let within: Vec<&str> = [county.as_deref(), state.as_deref()].into_iter().flatten().collect();
                if within.is_empty() {
                    format!("city {city}")
                } else {
                    format!("city {city} ({})", within.join(", "))
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub totals: BTreeMap<String, u64>,
    #[serde(default)]
    pub done: BTreeMap<String, u64>,
    #[serde(default)]
    pub pct: Option<f64>,
    #[serde(default)]
    pub last: Option<LastItem>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub phase: ProgressPhase,
    pub payload: ProgressPayload,
}

/// Latest derived completion state. Replaced wholesale on every progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: ProgressPhase,
    /// 0..=1, `None` when indeterminate.
    pub fraction: Option<f64>,
    pub totals: BTreeMap<String, u64>,
    pub done: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<LastItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub eta_secs: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Returns `None` for anything that is not a valid progress line.
pub fn parse_line(line: &str) -> Option<ProgressLine> {
    let (phase, rest) = if let Some(rest) = line.strip_prefix(INIT_PREFIX) {
        (ProgressPhase::Init, rest)
    } else if let Some(rest) = line.strip_prefix(END_PREFIX) {
        (ProgressPhase::End, rest)
    } else if let Some(rest) = line.strip_prefix(UPDATE_PREFIX) {
        (ProgressPhase::Update, rest)
    } else {
        return None;
    };

    let value: Value = serde_json::from_str(rest.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    let payload: ProgressPayload = serde_json::from_value(value).ok()?;
    Some(ProgressLine { phase, payload })
}

impl ProgressLine {
    /// `started_at` is when the run reported its first progress; ETA is measured from there.
    pub fn snapshot(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> ProgressSnapshot {
        let p = &self.payload;
        let total = p.totals.get(ALL).copied().unwrap_or(0);
        let done = p.done.get(ALL).copied().unwrap_or(0);

        let fraction = match p.pct {
            Some(pct) => Some(pct.clamp(0.0, 1.0)),
            None if total > 0 => Some((done as f64 / total as f64).clamp(0.0, 1.0)),
            None if self.phase == ProgressPhase::End => Some(1.0),
            None => None,
        };

        ProgressSnapshot {
            phase: self.phase,
            fraction,
            totals: p.totals.clone(),
            done: p.done.clone(),
            summary: p.last.as_ref().map(LastItem::describe),
            last: p.last.clone(),
            message: p.message.clone(),
            eta_secs: eta_secs(total, done, started_at, now),
            updated_at: now,
        }
    }
}

fn eta_secs(total: u64, done: u64, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<f64> {
    if done == 0 || total == 0 {
        return None;
    }
    let elapsed = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let rate = done as f64 / elapsed.max(1.0);
    let remaining = total.saturating_sub(done) as f64;
    if rate > 0.0 {
        Some(remaining / rate)
    } else {
        None
    }
}
