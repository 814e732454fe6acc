use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth;
use crate::context::{self, ContextFormat, ContextSource};
use crate::engine::{Engine, NewRun};
use crate::error::EngineError;
use crate::model::{ContextSet, Verdict};
use crate::registry::ActiveRunSummary;
use crate::ws;

pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/:name", axum::routing::delete(delete_project))
        .route("/projects/:name/prompts", post(add_prompt).get(list_prompts))
        .route("/projects/:name/runs", get(list_runs))
        .route("/runs", post(create_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/stats", get(run_stats))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/resume", post(resume_run))
        .route("/runs/:id/validate", post(validate_batch))
        .route("/runs/:id/items/:index/verdict", put(record_verdict))
        .route("/runs/:id/items/:index/judge", post(judge_item))
        .route("/runs/:id/items/:index/skip", post(skip_item))
        .route("/runs/:id/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Engine errors rendered as JSON with a matching status code.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::MalformedInput { .. }
            | EngineError::InvalidDocument(_)
            | EngineError::UnsupportedFormat(_)
            | EngineError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateName(_) | EngineError::InvalidState(_) => StatusCode::CONFLICT,
            EngineError::Call(_) => StatusCode::BAD_GATEWAY,
            EngineError::Corrupt { .. }
            | EngineError::Io(_)
            | EngineError::Serde(_)
            | EngineError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            EngineError::MalformedInput { .. } => "malformed_input",
            EngineError::InvalidDocument(_) => "invalid_document",
            EngineError::UnsupportedFormat(_) => "unsupported_format",
            EngineError::InvalidName { .. } => "invalid_name",
            EngineError::NotFound(_) => "not_found",
            EngineError::DuplicateName(_) => "duplicate_name",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Call(_) => "backend_error",
            EngineError::Corrupt { .. } | EngineError::Io(_) | EngineError::Serde(_) => {
                "storage_error"
            }
            EngineError::Client(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.0.to_string(),
        });
        if let EngineError::MalformedInput { index, .. } = &self.0 {
            body["index"] = serde_json::json!(index);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    active_runs: Vec<ActiveRunSummary>,
    runs_started: u64,
    runs_completed: u64,
    runs_cancelled: u64,
    runs_failed: u64,
    capacity: usize,
    available_slots: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let engine = &state.engine;
    let m = engine.metrics();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: engine.uptime_secs(),
        active_runs: engine.active_runs(),
        runs_started: m.runs_started.load(Ordering::Relaxed),
        runs_completed: m.runs_completed.load(Ordering::Relaxed),
        runs_cancelled: m.runs_cancelled.load(Ordering::Relaxed),
        runs_failed: m.runs_failed.load(Ordering::Relaxed),
        capacity: engine.config().max_concurrency,
        available_slots: engine.available_permits(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.engine.metrics().render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

// ---- projects ----

#[derive(Deserialize)]
struct ProjectPayload {
    name: String,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProjectPayload>,
) -> ApiResult<impl IntoResponse> {
    let project = state.engine.create_project(&payload.name).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_projects().await?))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let runs_removed = state.engine.delete_project(&name).await?;
    Ok(Json(serde_json::json!({
        "deleted": name,
        "runs_removed": runs_removed,
    })))
}

#[derive(Deserialize)]
struct PromptPayload {
    text: String,
}

async fn add_prompt(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<PromptPayload>,
) -> ApiResult<impl IntoResponse> {
    let prompt = state.engine.add_prompt(&name, &payload.text).await?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

async fn list_prompts(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_prompts(&name).await?))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_runs(&name).await?))
}

// ---- runs ----

#[derive(Deserialize)]
struct RunPayload {
    project: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    /// Contexts given inline.
    #[serde(default)]
    contexts: Option<Vec<String>>,
    /// Raw context document, parsed with `format`.
    #[serde(default)]
    source: Option<String>,
    /// Context file on the server.
    #[serde(default)]
    contexts_path: Option<PathBuf>,
    #[serde(default)]
    format: Option<ContextFormat>,
    #[serde(default = "default_start")]
    start: bool,
}

fn default_start() -> bool {
    true
}

async fn resolve_contexts(
    payload: &mut RunPayload,
) -> Result<(ContextSet, ContextSource), EngineError> {
    match (
        payload.contexts.take(),
        payload.source.take(),
        payload.contexts_path.take(),
    ) {
        (Some(list), None, None) => Ok((context::from_strings(list)?, ContextSource::Inline)),
        (None, Some(source), None) => {
            let format = payload.format.unwrap_or(ContextFormat::StructuredArray);
            let contexts = context::load_str(&source, format)?;
            Ok((contexts, ContextSource::Document { format }))
        }
        (None, None, Some(path)) => {
            let format = match payload.format {
                Some(format) => format,
                None => ContextFormat::from_path(&path)?,
            };
            let contexts = context::load_path(&path, Some(format)).await?;
            Ok((contexts, ContextSource::File { path, format }))
        }
        _ => Err(EngineError::InvalidDocument(
            "give exactly one of 'contexts', 'source' or 'contexts_path'".into(),
        )),
    }
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<RunPayload>,
) -> ApiResult<impl IntoResponse> {
    let (contexts, source) = resolve_contexts(&mut payload).await?;
    let run = state
        .engine
        .create_run_with(NewRun {
            project: payload.project,
            prompt: payload.prompt,
            prompt_id: payload.prompt_id,
            contexts,
            model: payload.model,
            endpoint: payload.endpoint,
            source: Some(source),
        })
        .await?;
    if payload.start {
        state.engine.start_run(run.id()).await?;
    }
    info!(run_id = %run.id(), items = run.items.len(), "Run created via API");
    Ok((StatusCode::ACCEPTED, Json(run.summary())))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.load_run(&id).await?))
}

async fn run_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.stats(&id).await?))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.engine.cancel_run(&id).await?;
    Ok(Json(serde_json::json!({ "run_id": id, "cancelled": cancelled })))
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.resume_run(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": id, "resumed": true })),
    ))
}

#[derive(Deserialize)]
struct ValidatePayload {
    #[serde(default)]
    start: usize,
    count: usize,
}

async fn validate_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ValidatePayload>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .validation()
            .validate_batch(&id, payload.start, payload.count)
            .await?,
    ))
}

#[derive(Deserialize)]
struct VerdictPayload {
    verdict: Verdict,
    #[serde(default)]
    reason: Option<String>,
}

async fn record_verdict(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
    Json(payload): Json<VerdictPayload>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .validation()
            .record_manual_verdict(&id, index, payload.verdict, payload.reason)
            .await?,
    ))
}

async fn judge_item(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.engine.validation().validate_automated(&id, index).await?,
    ))
}

#[derive(Deserialize, Default)]
struct SkipPayload {
    #[serde(default)]
    reason: Option<String>,
}

async fn skip_item(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, usize)>,
    payload: Option<Json<SkipPayload>>,
) -> ApiResult<impl IntoResponse> {
    let reason = payload.and_then(|Json(p)| p.reason);
    Ok(Json(state.engine.validation().skip(&id, index, reason).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::inference::testing::ScriptedBackend;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app(dir: &std::path::Path, auth_token: Option<&str>) -> (Router, Arc<Engine>) {
        let config = Config {
            data_dir: dir.to_path_buf(),
            auth_token: auth_token.map(String::from),
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..Config::default()
        };
        let engine = Arc::new(
            Engine::with_backends(
                config,
                Arc::new(ScriptedBackend::new()),
                Arc::new(ScriptedBackend::new().script("alpha", vec![Ok("FAIL".into())])),
            )
            .await
            .unwrap(),
        );
        let state = Arc::new(AppState {
            engine: engine.clone(),
        });
        (router(state), engine)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), Some("s3cret")).await;
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, Method::GET, "/projects", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_token");
    }

    #[tokio::test]
    async fn test_bearer_token_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), Some("s3cret")).await;
        let req = Request::builder()
            .uri("/projects")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let resp = tokio_test::assert_ok!(app.oneshot(req).await);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_project_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), None).await;

        let (status, body) = call(&app, Method::POST, "/projects", Some(serde_json::json!({"name": "demo"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "demo");

        let (status, body) = call(&app, Method::POST, "/projects", Some(serde_json::json!({"name": "demo"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate_name");

        let (status, _) = call(&app, Method::POST, "/projects", Some(serde_json::json!({"name": "../x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            "/projects/demo/prompts",
            Some(serde_json::json!({"text": "Answer: {context}"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "prompt_1");

        let (status, body) = call(&app, Method::DELETE, "/projects/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runs_removed"], 0);

        let (status, _) = call(&app, Method::GET, "/projects/demo/runs", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_and_validate_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let (app, engine) = app(dir.path(), None).await;
        engine.create_project("demo").await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/runs",
            Some(serde_json::json!({
                "project": "demo",
                "prompt": "Is this an address? {context}",
                "source": "context\nalpha\nbeta\n",
                "format": {"kind": "tabular"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["total"], 2);
        let run_id = body["id"].as_str().unwrap().to_string();
        engine.run_to_completion(&run_id).await.unwrap();

        let (status, body) = call(&app, Method::GET, &format!("/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["items"][1]["context"], "beta");
        assert_eq!(body["source"]["kind"], "document");
        assert_eq!(body["source"]["format"]["kind"], "tabular");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/runs/{}/items/0/judge", run_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["validation"]["verdict"], "fail");

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/runs/{}/items/1/verdict", run_id),
            Some(serde_json::json!({"verdict": "pass", "reason": "checked by hand"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["validation"]["source"], "manual");

        let (status, body) = call(&app, Method::GET, &format!("/runs/{}/stats", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pass"], 1);
        assert_eq!(body["fail"], 1);
        assert_eq!(body["percent_complete"], 100.0);

        // Item 0 already has a judge verdict; starting at 1 picks only the hand-graded item.
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/runs/{}/validate", run_id),
            Some(serde_json::json!({"start": 1, "count": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["start"], 1);
        assert_eq!(body["validated"], 1);

        let (status, body) = call(&app, Method::POST, &format!("/runs/{}/cancel", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], false);
    }

    #[tokio::test]
    async fn test_run_from_context_file_records_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let (app, engine) = app(dir.path(), None).await;
        engine.create_project("demo").await.unwrap();
        let path = dir.path().join("contexts.json");
        std::fs::write(&path, r#"{"contexts": ["first", "second"]}"#).unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/runs",
            Some(serde_json::json!({
                "project": "demo",
                "prompt": "Summarize: {context}",
                "contexts_path": path.to_str().unwrap(),
                "start": false,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["id"].as_str().unwrap().to_string();

        let run = engine.load_run(&run_id).await.unwrap();
        assert_eq!(
            run.header.source,
            Some(ContextSource::File {
                path,
                format: ContextFormat::StructuredArray,
            })
        );
        assert_eq!(run.items.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_run_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (app, engine) = app(dir.path(), None).await;
        engine.create_project("demo").await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/runs",
            Some(serde_json::json!({
                "project": "demo",
                "prompt": "p",
                "contexts": ["ok", " "],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "malformed_input");
        assert_eq!(body["index"], 1);

        let (status, _) = call(
            &app,
            Method::POST,
            "/runs",
            Some(serde_json::json!({"project": "demo", "prompt": "p"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/runs/not-a-run", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_verdict_on_unfinished_item_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (app, engine) = app(dir.path(), None).await;
        engine.create_project("demo").await.unwrap();
        let run = engine
            .create_run_from_strings("demo", "p", vec!["a".into()], "m")
            .await
            .unwrap();

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/runs/{}/items/0/verdict", run.id()),
            Some(serde_json::json!({"verdict": "pass"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/runs/{}/items/0/skip", run.id()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), None).await;
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("promptbench_runs_started_total 0"));
    }
}
