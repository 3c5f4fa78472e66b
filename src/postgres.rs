use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::StoreError;
use crate::events::{EventKind, RunEvent, RunRecord, RunStatus, RunSummary, StatusChange, SummaryDelta};
use crate::store::EventStore;

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await?;

    tracing::info!("database connected and migrations applied");
    Ok(pool)
}

/// `run_summaries` + `run_events` on Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: String,
    seq: i64,
    kind: String,
    message: String,
    payload: Option<Json<Value>>,
    ts: DateTime<Utc>,
}

impl TryFrom<EventRow> for RunEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(RunEvent {
            run_id: row.run_id,
            seq: row.seq,
            kind: EventKind::parse(&row.kind)?,
            message: row.message,
            payload: row.payload.map(|Json(v)| v),
            ts: row.ts,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    job: Option<String>,
    tenant: Option<String>,
    status: String,
    exit_code: Option<i32>,
    error: Option<String>,
    line_count: i64,
    last_line: Option<String>,
    progress: Option<Json<Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<SummaryRow> for RunSummary {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(RunSummary {
            id: row.id,
            job: row.job,
            tenant: row.tenant,
            status: RunStatus::parse(&row.status)?,
            exit_code: row.exit_code,
            error: row.error,
            line_count: row.line_count,
            last_line: row.last_line,
            progress: row.progress.map(|Json(v)| v),
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn create_runs(&self, runs: &[RunRecord]) -> Result<(), StoreError> {
        if runs.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO run_summaries (id, job, tenant, meta, created_at, updated_at) ");
        qb.push_values(runs, |mut b, run| {
            b.push_bind(run.id.clone())
                .push_bind(run.meta.job.clone())
                .push_bind(run.meta.tenant.clone())
                .push_bind(Json(run.meta.clone()))
                .push_bind(run.created_at)
                .push_bind(run.created_at);
        });
        // A status or summary may already have created the row.
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             job = EXCLUDED.job, \
             tenant = EXCLUDED.tenant, \
             meta = EXCLUDED.meta, \
             created_at = LEAST(run_summaries.created_at, EXCLUDED.created_at)",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn append_events(&self, events: &[RunEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO run_events (run_id, seq, kind, message, payload, ts) ");
        qb.push_values(events, |mut b, ev| {
            b.push_bind(ev.run_id.clone())
                .push_bind(ev.seq)
                .push_bind(ev.kind.as_str())
                .push_bind(ev.message.clone())
                .push_bind(ev.payload.clone().map(Json))
                .push_bind(ev.ts);
        });
        qb.push(" ON CONFLICT (run_id, seq) DO NOTHING");
        qb.build().execute(&self.pool).await?;
        tracing::debug!(count = events.len(), "appended run events");
        Ok(())
    }

    async fn merge_summaries(&self, deltas: &[SummaryDelta]) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO run_summaries (id, line_count, last_line, progress, updated_at) ");
        qb.push_values(deltas, |mut b, d| {
            b.push_bind(d.run_id.clone())
                .push_bind(d.line_count)
                .push_bind(d.last_line.clone())
                .push_bind(d.progress.clone().map(Json))
                .push_bind(d.updated_at);
        });
        qb.push(
            " ON CONFLICT (id) DO UPDATE SET \
             line_count = GREATEST(run_summaries.line_count, EXCLUDED.line_count), \
             last_line = COALESCE(EXCLUDED.last_line, run_summaries.last_line), \
             progress = COALESCE(EXCLUDED.progress, run_summaries.progress), \
             updated_at = GREATEST(run_summaries.updated_at, EXCLUDED.updated_at)",
        );
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn apply_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        // One run can appear twice (stopped, then finished); apply in order.
        let mut tx = self.pool.begin().await?;
        for c in changes {
            sqlx::query(
                "INSERT INTO run_summaries (id, status, exit_code, error, finished_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 exit_code = COALESCE(EXCLUDED.exit_code, run_summaries.exit_code), \
                 error = COALESCE(EXCLUDED.error, run_summaries.error), \
                 finished_at = COALESCE(EXCLUDED.finished_at, run_summaries.finished_at), \
                 updated_at = GREATEST(run_summaries.updated_at, EXCLUDED.updated_at)",
            )
            .bind(&c.run_id)
            .bind(c.status.as_str())
            .bind(c.exit_code)
            .bind(&c.error)
            .bind(c.finished_at)
            .bind(c.at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn run_summary(&self, run_id: &str) -> Result<Option<RunSummary>, StoreError> {
        let row: Option<SummaryRow> = sqlx::query_as(
            "SELECT id, job, tenant, status, exit_code, error, line_count, last_line, progress, \
             created_at, updated_at, finished_at \
             FROM run_summaries WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunSummary::try_from).transpose()
    }

    async fn events_after(&self, run_id: &str, after_seq: i64, limit: i64) -> Result<Vec<RunEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT run_id, seq, kind, message, payload, ts FROM run_events \
             WHERE run_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3",
        )
        .bind(run_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunEvent::try_from).collect()
    }
}
