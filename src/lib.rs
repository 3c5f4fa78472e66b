//! Run tracking for long-running background jobs: an in-memory run registry,
//! a write-behind durable event log, and resumable per-run event streams.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod postgres;
pub mod process;
pub mod progress;
pub mod registry;
pub mod store;
pub mod stream;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::api::AppState;
use crate::config::TrackerCfg;
use crate::error::StoreError;
use crate::postgres::PgStore;
use crate::process::ProcessController;
use crate::registry::Registry;
use crate::store::{EventStore, MemoryStore};
use crate::stream::StreamSettings;
use crate::writer::EventLogWriter;

/// Everything one tracker process owns, wired together.
pub struct Tracker {
    pub cfg: TrackerCfg,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn EventStore>,
}

impl Tracker {
    pub fn new(cfg: TrackerCfg, store: Arc<dyn EventStore>, controller: ProcessController) -> Self {
        let writer = EventLogWriter::new(cfg.writer.clone(), store.clone());
        let registry = Registry::new(cfg.registry.clone(), writer, controller);
        Self { cfg, registry, store }
    }

    /// Postgres when `database_url` is set, otherwise an in-process store.
    pub async fn open(cfg: TrackerCfg) -> Result<Self, StoreError> {
        let store: Arc<dyn EventStore> = match cfg.database_url.as_deref() {
            Some(url) => Arc::new(PgStore::connect(url).await?),
            None => {
                tracing::warn!("no database configured, run history will not outlive this process");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(cfg, store, ProcessController::system()))
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings::from(&self.cfg.stream)
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.registry.clone(), self.store.clone(), self.stream_settings())
    }

    /// Stop every active run, wait for the ones with a live process to exit,
    /// then drain the event log. Returns whether everything was persisted.
    pub async fn shutdown(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        let active = self.registry.active_ids();
        let with_process: Vec<String> = active
            .iter()
            .filter(|id| self.registry.get(id).is_some_and(|v| v.pid.is_some()))
            .cloned()
            .collect();
        if !active.is_empty() {
            tracing::info!(runs = active.len(), "stopping active runs");
        }
        for id in &active {
            self.registry.stop(id);
        }

        while Instant::now() < deadline {
            let live = self.registry.active_ids();
            if !with_process.iter().any(|id| live.contains(id)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let writer = self.registry.writer();
        let left = deadline.saturating_duration_since(Instant::now()).max(Duration::from_secs(1));
        let drained = writer.drain(left).await;
        if drained {
            tracing::info!("event log drained");
        } else {
            tracing::warn!(pending = writer.pending_len(), "event log not fully persisted before shutdown");
        }
        drained
    }
}
