//! HTTP surface: JSON endpoints over the ledger plus the dashboard page.

use crate::ledger::Ledger;
use crate::scheduler::Scheduler;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use port_inspect::Inspector;
use portledger_core::{AnnotationPatch, LedgerError, PortKey};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub scheduler: Scheduler,
    pub inspector: Arc<Inspector>,
    pub csrf_token: Arc<str>,
    pub frontend_dir: PathBuf,
}

impl AppState {
    pub fn new(ledger: Ledger, scheduler: Scheduler, inspector: Inspector, frontend_dir: PathBuf) -> Self {
        AppState {
            ledger,
            scheduler,
            inspector: Arc::new(inspector),
            csrf_token: uuid::Uuid::new_v4().to_string().into(),
            frontend_dir,
        }
    }
}

pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::ScanUnavailable(_) | LedgerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Diagnosis(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string(), "code": self.0.code() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a store call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(LedgerError::Store(format!("worker failed: {e}"))))?
        .map_err(ApiError)
}

#[derive(Debug, Deserialize)]
pub struct HostQuery {
    pub host_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TupleQuery {
    pub host_id: Option<String>,
    pub protocol: String,
    pub port: i64,
    pub limit: Option<usize>,
}

impl TupleQuery {
    fn key(&self, default_host: &str) -> Result<PortKey, ApiError> {
        let host = self.host_id.as_deref().unwrap_or(default_host);
        Ok(PortKey::parse(host, &self.protocol, self.port)?)
    }
}

fn tuple(q: Result<Query<TupleQuery>, QueryRejection>, state: &AppState) -> Result<(PortKey, Option<usize>), ApiError> {
    let Query(q) = q.map_err(|e| ApiError(LedgerError::validation(e.body_text())))?;
    Ok((q.key(state.ledger.host_id())?, q.limit))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/csrf-token", get(csrf_token))
        .route("/ports", get(list_ports).delete(forget_port))
        .route("/history", get(history))
        .route("/notes", post(save_note))
        .route("/acknowledge", post(acknowledge))
        .route("/trigger-scan", post(trigger_scan))
        .route("/inspect", post(inspect))
        .layer(middleware::from_fn_with_state(state.clone(), require_csrf))
        .with_state(state)
}

async fn require_csrf(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(req).await;
    }
    let presented = req.headers().get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(&*state.csrf_token) {
        tracing::debug!(method = %req.method(), path = %req.uri().path(), "rejected request without CSRF token");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "missing or invalid CSRF token" }))).into_response();
    }
    next.run(req).await
}

fn inject_token(html: &str, token: &str) -> String {
    let script = format!("<script>window.PORTLEDGER_CSRF_TOKEN = \"{token}\";</script>");
    match html.find("</head>") {
        Some(i) => format!("{}{}{}", &html[..i], script, &html[i..]),
        None => format!("{script}{html}"),
    }
}

async fn index(State(state): State<AppState>) -> Response {
    let path = state.frontend_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => {
            let mut resp = Html(inject_token(&html, &state.csrf_token)).into_response();
            resp.headers_mut().insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            resp
        }
        Err(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": "frontend not found" }))).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let ledger = state.ledger.clone();
    blocking(move || ledger.ping()).await?;
    Ok(Json(json!({
        "status": "ok",
        "host_id": state.ledger.host_id(),
        "scan_running": state.scheduler.is_running(),
    })))
}

async fn csrf_token(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "csrf_token": &*state.csrf_token }))
}

async fn list_ports(
    State(state): State<AppState>,
    q: Result<Query<HostQuery>, QueryRejection>,
) -> ApiResult<Vec<portledger_core::MergedPortItem>> {
    let Query(q) = q.map_err(|e| ApiError(LedgerError::validation(e.body_text())))?;
    let host = q.host_id.unwrap_or_else(|| state.ledger.host_id().to_string());
    let ledger = state.ledger.clone();
    Ok(Json(blocking(move || ledger.list_merged(&host)).await?))
}

async fn history(
    State(state): State<AppState>,
    q: Result<Query<TupleQuery>, QueryRejection>,
) -> ApiResult<Vec<portledger_core::TimelineEvent>> {
    let (key, limit) = tuple(q, &state)?;
    let ledger = state.ledger.clone();
    Ok(Json(blocking(move || ledger.timeline(&key, limit)).await?))
}

async fn save_note(
    State(state): State<AppState>,
    q: Result<Query<TupleQuery>, QueryRejection>,
    body: Result<Json<AnnotationPatch>, JsonRejection>,
) -> ApiResult<portledger_core::AnnotationRecord> {
    let (key, _) = tuple(q, &state)?;
    let Json(patch) = body.map_err(|e| ApiError(LedgerError::validation(e.body_text())))?;
    let ledger = state.ledger.clone();
    Ok(Json(blocking(move || ledger.upsert_annotation(&key, &patch)).await?))
}

async fn forget_port(
    State(state): State<AppState>,
    q: Result<Query<TupleQuery>, QueryRejection>,
) -> ApiResult<serde_json::Value> {
    let (key, _) = tuple(q, &state)?;
    let ledger = state.ledger.clone();
    let outcome = blocking(move || ledger.delete_tuple(&key)).await?;
    Ok(Json(json!({
        "status": "deleted",
        "fact_deleted": outcome.fact_deleted,
        "note_deleted": outcome.note_deleted,
    })))
}

async fn acknowledge(
    State(state): State<AppState>,
    q: Result<Query<TupleQuery>, QueryRejection>,
) -> ApiResult<portledger_core::TimelineEvent> {
    let (key, _) = tuple(q, &state)?;
    let ledger = state.ledger.clone();
    Ok(Json(blocking(move || ledger.acknowledge(&key)).await?))
}

async fn trigger_scan(State(state): State<AppState>) -> ApiResult<ledger_sqlite::CycleReport> {
    Ok(Json(state.scheduler.run_cycle().await?))
}

async fn inspect(
    State(state): State<AppState>,
    q: Result<Query<TupleQuery>, QueryRejection>,
) -> ApiResult<serde_json::Value> {
    let (key, _) = tuple(q, &state)?;
    let diagnosis = state.inspector.inspect(key.protocol, key.port).await?;

    let ledger = state.ledger.clone();
    let output = diagnosis.output.clone();
    let record_key = key.clone();
    let recorded = match blocking(move || ledger.record_diagnosis(&record_key, &output)).await {
        Ok(_) => true,
        Err(ApiError(LedgerError::NotFound(_))) => false,
        Err(e) => return Err(e),
    };
    Ok(Json(json!({
        "output": diagnosis.output,
        "error": diagnosis.failed,
        "exit_code": diagnosis.exit_code,
        "recorded": recorded,
    })))
}

/// Serves until ctrl-c.
pub async fn serve(state: AppState, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "portledger listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use ledger_sqlite::Db;
    use portledger_core::{Observation, PlanOptions, Protocol, ScanSnapshot};
    use socket_scan::StaticSource;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        token: String,
        source: Arc<StaticSource>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html><head><title>ports</title></head><body></body></html>")
            .unwrap();
        let source = Arc::new(StaticSource::new(ScanSnapshot::from([(
            PortKey::new("local", Protocol::Tcp, 8080).unwrap(),
            Observation { pid: 100, process_name: "nginx".into(), cmdline: "nginx".into() },
        )])));
        let ledger = Ledger::new(Db::open_in_memory().unwrap(), "local");
        let scheduler = Scheduler::new(ledger.clone(), source.clone(), PlanOptions::default());
        let inspector = Inspector::new("sh", vec!["-c".into(), "echo inspected {protocol}/{port}".into()], Duration::from_secs(5));
        let state = AppState::new(ledger, scheduler, inspector, dir.path().to_path_buf());
        let token = state.csrf_token.to_string();
        Harness { app: router(state), token, source, _dir: dir }
    }

    impl Harness {
        async fn call(&self, method: &str, uri: &str, body: Option<serde_json::Value>, with_token: bool) -> (StatusCode, String) {
            let mut req = HttpRequest::builder().method(method).uri(uri);
            if with_token {
                req = req.header(CSRF_HEADER, &self.token);
            }
            let req = match body {
                Some(v) => req.header("content-type", "application/json").body(Body::from(v.to_string())).unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            (status, String::from_utf8(bytes.to_vec()).unwrap())
        }

        async fn json(&self, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
            let (status, text) = self.call(method, uri, body, true).await;
            (status, serde_json::from_str(&text).unwrap_or(serde_json::Value::Null))
        }
    }

    #[tokio::test]
    async fn health_and_token_are_open() {
        let h = harness();
        let (status, body) = h.json("GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["host_id"], "local");
        let (_, body) = h.json("GET", "/csrf-token", None).await;
        assert_eq!(body["csrf_token"], h.token.as_str());
    }

    #[tokio::test]
    async fn writes_without_token_are_forbidden() {
        let h = harness();
        let (status, _) = h.call("POST", "/trigger-scan", None, false).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = h.call("DELETE", "/ports?protocol=tcp&port=8080", None, false).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn index_carries_the_token() {
        let h = harness();
        let (status, html) = h.call("GET", "/", None, false).await;
        assert_eq!(status, StatusCode::OK);
        let script = html.find("PORTLEDGER_CSRF_TOKEN").unwrap();
        assert!(script < html.find("</head>").unwrap());
        assert!(html.contains(&h.token));
    }

    #[tokio::test]
    async fn trigger_then_list() {
        let h = harness();
        let (status, report) = h.json("POST", "/trigger-scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["appeared"], 1);

        let (status, rows) = h.json("GET", "/ports", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rows[0]["port"], 8080);
        assert_eq!(rows[0]["derived_status"], "suspicious");
        assert_eq!(rows[0]["risk_level"], "unknown");
        assert_eq!(rows[0]["latest_event_type"], "appeared");
    }

    #[tokio::test]
    async fn failed_scan_reports_unavailable() {
        let h = harness();
        h.source.set(None);
        let (status, body) = h.json("POST", "/trigger-scan", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "scan_unavailable");
    }

    #[tokio::test]
    async fn notes_validate_and_merge() {
        let h = harness();
        let (status, body) = h.json("POST", "/notes?protocol=sctp&port=22", Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("protocol"));

        let (status, _) = h.json("POST", "/notes?protocol=tcp&port=22", Some(json!({"risk_level": "evil"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h.json("POST", "/notes?protocol=tcp&port=22", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, note) =
            h.json("POST", "/notes?protocol=tcp&port=22", Some(json!({"title": "ssh", "risk_level": "trusted"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(note["risk_level"], "trusted");
        assert_eq!(note["is_pinned"], false);

        let (_, rows) = h.json("GET", "/ports", None).await;
        assert_eq!(rows[0]["port"], 22);
        assert_eq!(rows[0]["derived_status"], "unknown");
    }

    #[tokio::test]
    async fn history_of_unknown_tuple_is_404() {
        let h = harness();
        let (status, body) = h.json("GET", "/history?protocol=tcp&port=9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (status, _) = h.json("GET", "/history?protocol=tcp", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn acknowledge_and_forget() {
        let h = harness();
        h.json("POST", "/trigger-scan", None).await;
        let (status, ev) = h.json("POST", "/acknowledge?protocol=tcp&port=8080", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ev["event_type"], "acknowledged");

        let (_, events) = h.json("GET", "/history?protocol=tcp&port=8080", None).await;
        assert_eq!(events[0]["event_type"], "acknowledged");
        assert_eq!(events[1]["event_type"], "appeared");

        let (status, out) = h.json("DELETE", "/ports?protocol=tcp&port=8080", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["fact_deleted"], true);
        assert_eq!(out["note_deleted"], false);
    }

    #[tokio::test]
    async fn inspect_records_diagnosis_for_known_tuple() {
        let h = harness();
        h.json("POST", "/trigger-scan", None).await;
        let (status, body) = h.json("POST", "/inspect?protocol=tcp&port=8080", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], false);
        assert_eq!(body["recorded"], true);
        assert!(body["output"].as_str().unwrap().contains("inspected tcp/8080"));

        let (_, events) = h.json("GET", "/history?protocol=tcp&port=8080", None).await;
        assert_eq!(events[0]["event_type"], "diagnosed");

        let (_, unknown) = h.json("POST", "/inspect?protocol=udp&port=8080", None).await;
        assert_eq!(unknown["recorded"], false);
    }
}
