use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Heartbeats closer together than this are pointless for idle streams.
pub const MIN_HEARTBEAT_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryCfg {
    /// Buffer length that triggers a trim.
    pub line_buffer_max: usize,
    /// Events kept after a trim (most recent).
    pub line_buffer_retain: usize,
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
    pub stop_grace_ms: u64,
}

impl Default for RegistryCfg {
    fn default() -> Self {
        Self {
            line_buffer_max: 5000,
            line_buffer_retain: 4000,
            retention_secs: 3600,
            prune_interval_secs: 60,
            stop_grace_ms: 1200,
        }
    }
}

impl RegistryCfg {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterCfg {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub debounce_ms: u64,
    pub retry_ms: u64,
}

impl Default for WriterCfg {
    fn default() -> Self {
        Self { queue_capacity: 20_000, batch_size: 250, debounce_ms: 250, retry_ms: 2000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    /// Serve from the registry, fall back to the durable log for runs it does not hold.
    MemoryFirst,
    /// Always replay from the durable log; required when several instances share one store.
    DurableOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCfg {
    pub source: StreamSource,
    pub tick_ms: u64,
    pub fallback_tick_ms: u64,
    pub fallback_retry_ms: u64,
    pub heartbeat_secs: u64,
    pub page_size: i64,
    pub retry_hint_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            source: StreamSource::MemoryFirst,
            tick_ms: 800,
            fallback_tick_ms: 800,
            fallback_retry_ms: 3000,
            heartbeat_secs: 60,
            page_size: 800,
            retry_hint_ms: 3000,
        }
    }
}

impl StreamCfg {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(MIN_HEARTBEAT_SECS))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerCfg {
    pub bind: Option<String>,
    pub database_url: Option<String>,
    pub registry: RegistryCfg,
    pub writer: WriterCfg,
    pub stream: StreamCfg,
}

impl TrackerCfg {
    /// Read YAML (when a path is given), apply `RUNTRACK_*` / `DATABASE_URL`
    /// overrides, then validate.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let txt = tokio::fs::read_to_string(p)
                    .await
                    .map_err(|source| ConfigError::Read { path: p.display().to_string(), source })?;
                serde_yaml::from_str(&txt)?
            }
            None => TrackerCfg::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = get("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = get("RUNTRACK_BIND") {
            self.bind = Some(v);
        }
        if let Some(v) = get("RUNTRACK_STREAM_SOURCE") {
            self.stream.source = match v.as_str() {
                "memory_first" => StreamSource::MemoryFirst,
                "durable_only" => StreamSource::DurableOnly,
                _ => return Err(ConfigError::Env { var: "RUNTRACK_STREAM_SOURCE", value: v }),
            };
        }
        override_num(&get, "RUNTRACK_STOP_GRACE_MS", &mut self.registry.stop_grace_ms)?;
        override_num(&get, "RUNTRACK_RETENTION_SECS", &mut self.registry.retention_secs)?;
        override_num(&get, "RUNTRACK_QUEUE_CAPACITY", &mut self.writer.queue_capacity)?;
        override_num(&get, "RUNTRACK_BATCH_SIZE", &mut self.writer.batch_size)?;
        override_num(&get, "RUNTRACK_HEARTBEAT_SECS", &mut self.stream.heartbeat_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.registry;
        if r.line_buffer_retain == 0 || r.line_buffer_retain > r.line_buffer_max {
            return Err(ConfigError::Invalid(format!(
                "registry.line_buffer_retain ({}) must be between 1 and line_buffer_max ({})",
                r.line_buffer_retain, r.line_buffer_max
            )));
        }
        if self.writer.queue_capacity == 0 {
            return Err(ConfigError::Invalid("writer.queue_capacity must be greater than 0".into()));
        }
        if self.writer.batch_size == 0 {
            return Err(ConfigError::Invalid("writer.batch_size must be greater than 0".into()));
        }
        if self.stream.page_size <= 0 {
            return Err(ConfigError::Invalid("stream.page_size must be greater than 0".into()));
        }
        if self.stream.tick_ms == 0 || self.stream.fallback_tick_ms == 0 {
            return Err(ConfigError::Invalid("stream tick intervals must be greater than 0".into()));
        }
        Ok(())
    }
}

fn override_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = get(var) {
        *slot = v.trim().parse().map_err(|_| ConfigError::Env { var, value: v })?;
    }
    Ok(())
}
