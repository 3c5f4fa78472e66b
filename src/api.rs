use std::{convert::Infallible, future::Future, sync::Arc};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    events::{RunMeta, RunSummary},
    launcher::{self, JobSpec},
    registry::{ListFilter, Registry, RunNotice, RunView},
    store::EventStore,
    stream::{self, Frame, StreamSettings},
};

const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    store: Arc<dyn EventStore>,
    stream: StreamSettings,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn EventStore>, stream: StreamSettings) -> Self {
        Self { registry, store, stream }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/runs", post(start_run).get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/stream", get(run_stream))
        .route("/api/notices", get(notices))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve<F>(bind: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "runtrack API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Deserialize)]
struct StartRunReq {
    #[serde(flatten)]
    meta: RunMeta,
    command: JobSpec,
}

async fn start_run(State(st): State<AppState>, Json(req): Json<StartRunReq>) -> Result<impl IntoResponse, ApiErr> {
    req.command.validate().map_err(|e| ApiErr::bad_request(e.to_string()))?;
    if req.meta.job.trim().is_empty() {
        return Err(ApiErr::bad_request("job must not be empty"));
    }

    let view = st.registry.create(req.meta);
    launcher::launch(st.registry.clone(), view.id.clone(), req.command);
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_runs(State(st): State<AppState>, Query(mut filter): Query<ListFilter>) -> Json<Vec<RunView>> {
    filter.limit = filter.limit.min(MAX_LIST_LIMIT);
    Json(st.registry.list(&filter))
}

/// Live runs come from memory; anything else from the durable summary.
#[derive(Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
enum RunDetail {
    Memory(RunView),
    Durable(RunSummary),
}

async fn get_run(State(st): State<AppState>, Path(id): Path<String>) -> Result<Json<RunDetail>, ApiErr> {
    if let Some(view) = st.registry.get(&id) {
        return Ok(Json(RunDetail::Memory(view)));
    }
    match st.store.run_summary(&id).await? {
        Some(summary) => Ok(Json(RunDetail::Durable(summary))),
        None => Err(ApiErr::not_found(&id)),
    }
}

async fn stop_run(State(st): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiErr> {
    if st.registry.stop(&id) {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "runId": id, "stopping": true }))));
    }
    if st.registry.contains(&id) {
        return Err(ApiErr::conflict(format!("Run {id} is not running")));
    }
    Err(ApiErr::not_found(&id))
}

#[derive(Deserialize, Default)]
struct StreamQuery {
    #[serde(rename = "lastEventId")]
    last_event_id: Option<String>,
}

/// Header wins over the query parameter; garbage means "from the start".
fn resume_point(headers: &HeaderMap, query: &StreamQuery) -> i64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query.last_event_id.clone())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(0)
}

pub async fn run_stream(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last = resume_point(&headers, &query);
    tracing::debug!(run_id = %run_id, last_event_id = last, "stream opened");
    let frames = stream::follow_run(st.registry.clone(), st.store.clone(), st.stream.clone(), run_id, last);
    Sse::new(frames.map(|frame| Ok(to_sse(frame))))
}

/// Created/stopping/finished notices for every run, for dashboards that list runs.
/// Lagged receivers skip what they missed.
pub async fn notices(
    State(st): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.registry.subscribe();

    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| async move { msg.ok() })
        .map(|notice: RunNotice| {
            let data = serde_json::to_string(&notice).unwrap_or_default();
            Ok(Event::default().event("notice").data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(frame: Frame) -> Event {
    match frame {
        Frame::Retry(every) => Event::default().retry(every),
        Frame::Hello { run_id } => Event::default().event("hello").data(json!({ "runId": run_id }).to_string()),
        Frame::Event { id, name, data } => Event::default().id(id.to_string()).event(name).data(data),
        Frame::Heartbeat(text) => Event::default().event("line").data(text),
        Frame::Ping => Event::default().event("ping").data(json!({ "ts": Utc::now() }).to_string()),
        Frame::End(payload) => {
            let data = serde_json::to_value(&payload).unwrap_or(Value::Null);
            Event::default().event("end").data(data.to_string())
        }
    }
}

const RUN_NOT_FOUND_HINT: &str = "Runs are pruned from memory after the retention window; check the id or the durable log.";

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: &'static str,
    message: String,
    suggestion: Option<&'static str>,
}

impl ApiErr {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), suggestion: None }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    fn not_found(run_id: &str) -> Self {
        Self {
            suggestion: Some(RUN_NOT_FOUND_HINT),
            ..Self::new(StatusCode::NOT_FOUND, "run_not_found", format!("Run not found: {run_id}"))
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiErr {
    fn from(e: E) -> Self {
        let e = e.into();
        tracing::error!(error = %e, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("Internal error: {e}"))
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            error: &'a str,
            code: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<&'a str>,
        }
        let body = ErrorBody { error: &self.message, code: self.code, suggestion: self.suggestion };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamCfg;
    use crate::events::{RunRecord, RunStatus, StatusChange};
    use crate::registry::tests::{fixture, Fixture};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(f: &Fixture) -> Router {
        router(AppState::new(f.registry.clone(), f.store.clone(), StreamSettings::from(&StreamCfg::default())))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn meta(job: &str) -> RunMeta {
        RunMeta { job: job.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn finished_run_streams_to_completion() {
        let f = fixture();
        let run = f.registry.create(meta("geo"));
        f.registry.append_line(&run.id, "hello");
        f.registry.append_line(&run.id, r#"@@PROGRESS {"totals":{"all":2},"done":{"all":1}}"#);
        f.registry.end(&run.id, 0);

        let (status, body) = send(app(&f), get(&format!("/api/runs/{}/stream", run.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("retry:"));
        assert!(body.lines().next().unwrap().ends_with("3000"));
        assert!(body.contains("event: hello"));
        assert!(body.contains("id: 1\nevent: line\ndata: hello"));
        assert!(body.contains("id: 2\nevent: progress"));
        assert!(body.contains(r#""fraction":0.5"#));
        assert!(body.contains("event: end"));
        assert!(body.contains(r#""ok":true"#));
    }

    #[tokio::test]
    async fn stream_resumes_from_header_or_query() {
        let f = fixture();
        let run = f.registry.create(meta("geo"));
        for line in ["a", "b", "c"] {
            f.registry.append_line(&run.id, line);
        }
        f.registry.end(&run.id, 0);

        let req = Request::builder()
            .uri(format!("/api/runs/{}/stream?lastEventId=1", run.id))
            .header("Last-Event-ID", "2")
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(app(&f), req).await;
        assert!(!body.contains("id: 2\n"));
        assert!(body.contains("id: 3\nevent: line\ndata: c"));

        let (_, body) = send(app(&f), get(&format!("/api/runs/{}/stream?lastEventId=1", run.id))).await;
        assert!(!body.contains("id: 1\n"));
        assert!(body.contains("id: 2\n"));
    }

    #[tokio::test]
    async fn unknown_run_stream_ends_with_not_found() {
        let f = fixture();
        let (status, body) = send(app(&f), get("/api/runs/run-missing/stream")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("event: end"));
        assert!(body.contains("not_found"));
    }

    #[tokio::test]
    async fn list_and_detail() {
        let f = fixture();
        let a = f.registry.create(RunMeta { job: "a".into(), tenant: Some("acme".into()), ..Default::default() });
        f.registry.create(meta("b"));

        let (status, body) = send(app(&f), get("/api/runs?tenant=acme")).await;
        assert_eq!(status, StatusCode::OK);
        let runs: Vec<Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["id"], a.id.as_str());

        let (status, body) = send(app(&f), get(&format!("/api/runs/{}", a.id))).await;
        assert_eq!(status, StatusCode::OK);
        let detail: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(detail["source"], "memory");
        assert_eq!(detail["status"], "running");
    }

    #[tokio::test]
    async fn detail_falls_back_to_durable_summary() {
        let f = fixture();
        let now = Utc::now();
        f.store
            .create_runs(&[RunRecord { id: "run-elsewhere".into(), created_at: now, meta: meta("geo") }])
            .await
            .unwrap();
        f.store
            .apply_statuses(&[StatusChange {
                run_id: "run-elsewhere".into(),
                status: RunStatus::Done,
                exit_code: Some(0),
                error: None,
                finished_at: Some(now),
                at: now,
            }])
            .await
            .unwrap();

        let (status, body) = send(app(&f), get("/api/runs/run-elsewhere")).await;
        assert_eq!(status, StatusCode::OK);
        let detail: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(detail["source"], "durable");
        assert_eq!(detail["status"], "done");

        let (status, body) = send(app(&f), get("/api/runs/run-nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("run_not_found"));
    }

    #[tokio::test]
    async fn stop_reports_conflict_and_not_found() {
        let f = fixture();
        let run = f.registry.create(meta("geo"));
        let post = |uri: String| Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();

        let (status, _) = send(app(&f), post(format!("/api/runs/{}/stop", run.id))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = send(app(&f), post(format!("/api/runs/{}/stop", run.id))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, body) = send(app(&f), post("/api/runs/run-missing/stop".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(err["code"], "run_not_found");
        assert_eq!(err["suggestion"], RUN_NOT_FOUND_HINT);
    }

    #[tokio::test]
    async fn start_rejects_blank_program() {
        let f = fixture();
        let req = Request::builder()
            .method("POST")
            .uri("/api/runs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"job":"geo","command":{"program":""}}"#))
            .unwrap();
        let (status, body) = send(app(&f), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("program"));
        assert!(!body.contains("suggestion"));
        assert!(f.registry.list(&ListFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn notices_reach_subscribers() {
        let f = fixture();
        let res = app(&f).oneshot(get("/api/notices")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let run = f.registry.create(meta("geo"));
        let mut body = res.into_body().into_data_stream();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: notice"));
        assert!(text.contains(&run.id));
        assert!(text.contains(r#""type":"created""#));
    }

    #[test]
    fn resume_point_ignores_garbage() {
        let mut headers = HeaderMap::new();
        let q = StreamQuery { last_event_id: Some("7".into()) };
        assert_eq!(resume_point(&headers, &q), 7);
        headers.insert("last-event-id", "nope".parse().unwrap());
        assert_eq!(resume_point(&headers, &q), 0);
        assert_eq!(resume_point(&HeaderMap::new(), &StreamQuery::default()), 0);
    }
}
