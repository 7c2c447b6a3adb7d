//! Node HTTP surface. Task routes live under `/api/*` behind the signed
//! envelope; `/vnc/{task_id}` authenticates by token only, since it is the
//! operator-facing URL the UI opens directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::NodeConfig;
use crate::engine::runner::AgentRunner;
use crate::engine::scripted::ScriptedRunner;
use crate::engine::{EngineConfig, TaskEngine};
use crate::error::ApiError;
use crate::security::keys::KeyRing;
use crate::security::{EnvelopeVerifier, constant_time_eq};
use crate::store::TaskStore;
use crate::task::{AssistRequest, ContinueRequest, CreateTaskRequest, ScheduleRequest};
use crate::vnc::{VncBroker, VncDenied};

/// Request bodies are small (task specs, assist text); screenshots only flow
/// node→head in responses.
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Base model catalog offered to the UI; the configured default is merged in.
const BASE_MODELS: [&str; 3] = ["gpt-5", "gpt-5-mini", "gpt-5-nano"];

/// Single-use enrollment gate for `POST /api/admin/head-key`.
pub struct EnrollmentGate {
    token: Option<String>,
    used: AtomicBool,
}

impl EnrollmentGate {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            used: AtomicBool::new(false),
        }
    }

    pub fn available(&self) -> bool {
        self.token.is_some() && !self.used.load(Ordering::SeqCst)
    }

    /// Consume the token if it matches. One redemption only.
    pub fn redeem(&self, presented: &str) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        if !constant_time_eq(expected, presented) {
            return false;
        }
        !self.used.swap(true, Ordering::SeqCst)
    }
}

/// Context bag handed to every handler.
#[derive(Clone)]
pub struct NodeState {
    pub cfg: Arc<NodeConfig>,
    pub engine: Arc<TaskEngine>,
    pub verifier: Arc<EnvelopeVerifier>,
    pub ring: Arc<KeyRing>,
    pub vnc: Arc<VncBroker>,
    pub enrollment: Arc<EnrollmentGate>,
}

pub struct NodeApp {
    pub router: Router,
    pub state: NodeState,
}

/// Pick the agent driver. `scripted` is built in; real browser drivers plug
/// in through [`TaskEngine::bootstrap`] when embedding the crate.
pub fn select_runner(cfg: &NodeConfig) -> Result<Arc<dyn AgentRunner>> {
    match cfg.agent_driver.as_str() {
        "scripted" => Ok(Arc::new(ScriptedRunner::completing(2))),
        other => bail!("unknown AGENT_DRIVER {other:?} (supported: scripted)"),
    }
}

/// A node that requires auth, has no trust material, and no way to enroll
/// any can never serve a privileged request.
pub fn trust_is_hopeless(cfg: &NodeConfig, ring: &KeyRing) -> bool {
    cfg.require_auth
        && ring.is_empty()
        && cfg.head_public_keys.is_empty()
        && cfg.enroll_token.is_none()
}

/// Build the node application: store recovery, engine bootstrap, router.
pub fn build(cfg: NodeConfig) -> Result<NodeApp> {
    let runner = select_runner(&cfg)?;
    build_with_runner(cfg, runner)
}

pub fn build_with_runner(cfg: NodeConfig, runner: Arc<dyn AgentRunner>) -> Result<NodeApp> {
    let cfg = Arc::new(cfg);
    let store = Arc::new(TaskStore::open(&cfg.tasks_dir()).context("open task store")?);
    let ring = Arc::new(
        KeyRing::load(cfg.head_public_keys.clone(), cfg.trust_dir())
            .context("load trusted head keys")?,
    );
    let verifier = Arc::new(EnvelopeVerifier::new(Arc::clone(&ring)));
    let engine = TaskEngine::bootstrap(EngineConfig::from_node(&cfg), Arc::clone(&store), runner)
        .context("bootstrap task engine")?;
    let vnc = Arc::new(VncBroker::new(
        Arc::clone(&store),
        cfg.vnc_target_host.clone(),
        cfg.vnc_target_port,
    ));
    let enrollment = Arc::new(EnrollmentGate::new(cfg.enroll_token.clone()));

    let state = NodeState {
        cfg,
        engine,
        verifier,
        ring,
        vnc,
        enrollment,
    };
    Ok(NodeApp {
        router: build_router(state.clone()),
        state,
    })
}

/// Serve the node on its configured port, with the scheduler timer and the
/// SIGHUP key-reload watcher running alongside.
pub async fn serve(cfg: NodeConfig) -> Result<()> {
    run(build(cfg)?).await
}

/// Serve an already-built node application.
pub async fn run(app: NodeApp) -> Result<()> {
    let port = app.state.cfg.port;
    app.state.engine.spawn_scheduler();
    spawn_key_reload(Arc::clone(&app.state.ring));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("bind node socket")?;
    tracing::info!(
        port,
        node_id = %app.state.cfg.node_id,
        trusted_keys = app.state.ring.len(),
        require_auth = app.state.cfg.require_auth,
        "node listening"
    );
    axum::serve(listener, app.router)
        .await
        .context("serve node HTTP")?;
    Ok(())
}

#[cfg(unix)]
fn spawn_key_reload(ring: Arc<KeyRing>) {
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hangup.recv().await.is_some() {
            match ring.reload() {
                Ok(count) => tracing::info!(count, "reloaded trusted head keys"),
                Err(error) => tracing::warn!(%error, "trusted key reload failed"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_key_reload(_ring: Arc<KeyRing>) {}

fn build_router(state: NodeState) -> Router {
    let protected = Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{task_id}", get(task_detail).delete(delete_task))
        .route("/api/tasks/{task_id}/assist", post(assist_task))
        .route("/api/tasks/{task_id}/continue", post(continue_task))
        .route("/api/tasks/{task_id}/stop", post(stop_task))
        .route("/api/tasks/{task_id}/run-now", post(run_now_task))
        .route("/api/tasks/{task_id}/schedule", post(schedule_task))
        .route("/api/tasks/{task_id}/open-browser", post(open_browser))
        .route("/api/tasks/{task_id}/close-browser", post(close_browser))
        .route("/api/tasks/{task_id}/admin-vnc", post(admin_vnc))
        .route("/api/config/defaults", get(config_defaults))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_envelope,
        ));

    Router::new()
        .merge(protected)
        .route("/healthz", get(healthz))
        .route("/api/node/info", get(node_info))
        .route("/api/admin/head-key", post(install_head_key))
        .route("/vnc/{task_id}", get(vnc_ws))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

// ── Envelope middleware ──────────────────────────────────────────────────

/// Verify the signed envelope on privileged routes. Auth is disabled only
/// when the node both holds no trusted keys and was told not to require
/// auth; a configured key set is always enforced.
async fn require_envelope(State(state): State<NodeState>, req: Request, next: Next) -> Response {
    let have_keys = !state.ring.is_empty();
    if !state.cfg.require_auth && !have_keys {
        return next.run(req).await;
    }
    if !have_keys {
        return ApiError::TrustNotConfigured.into_response();
    }

    let method = req.method().as_str().to_owned();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_owned(), |pq| pq.as_str().to_owned());
    let signature = header_string(&req, crate::security::envelope::SIGNATURE_HEADER);
    let meta = header_string(&req, crate::security::envelope::META_HEADER);

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::invalid_input("request body too large").into_response(),
    };

    match state.verifier.verify(
        &method,
        &path_and_query,
        &bytes,
        signature.as_deref(),
        meta.as_deref(),
        Utc::now(),
    ) {
        Ok(()) => {
            let req = Request::from_parts(parts, Body::from(bytes));
            next.run(req).await
        }
        Err(kind) => {
            tracing::warn!(%method, path = %path_and_query, code = kind.code(), "envelope rejected");
            ApiError::Unauthorized(kind).into_response()
        }
    }
}

fn header_string(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn node_info(State(state): State<NodeState>) -> impl IntoResponse {
    let mut issues: Vec<String> = Vec::new();
    if state.cfg.require_auth && state.ring.is_empty() {
        issues.push("trust not configured".into());
    }
    let ready = issues.is_empty();
    Json(serde_json::json!({
        "node_id": state.cfg.node_id,
        "node_name": state.cfg.node_name,
        "ready": ready,
        "issues": issues,
        "enrollment": state.enrollment.available(),
    }))
}

#[derive(Deserialize)]
struct HeadKeyEnrollment {
    public_key: String,
    token: String,
}

async fn install_head_key(
    State(state): State<NodeState>,
    body: Result<Json<HeadKeyEnrollment>, JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(error) => {
            return ApiError::invalid_input(format!("invalid enrollment body: {error}"))
                .into_response();
        }
    };
    if !state.enrollment.redeem(&payload.token) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "enrollment_rejected",
                "detail": "enrollment token missing, wrong, or already used",
            })),
        )
            .into_response();
    }
    match state.ring.install(&payload.public_key) {
        Ok(key) => Json(serde_json::json!({
            "installed": true,
            "key_id": key.key_id,
        }))
        .into_response(),
        Err(error) => ApiError::internal(error).into_response(),
    }
}

async fn config_defaults(State(state): State<NodeState>) -> impl IntoResponse {
    let mut models: Vec<String> = BASE_MODELS.iter().map(ToString::to_string).collect();
    if !models.contains(&state.cfg.default_model) {
        models.push(state.cfg.default_model.clone());
    }
    models.sort();
    let effort_by_model: serde_json::Map<String, serde_json::Value> = models
        .iter()
        .map(|model| {
            (
                model.clone(),
                serde_json::json!(crate::task::REASONING_EFFORT_OPTIONS),
            )
        })
        .collect();

    Json(serde_json::json!({
        "model": state.cfg.default_model,
        "temperature": serde_json::Value::Null,
        "max_steps": state.cfg.max_steps_default,
        "supportedModels": models,
        "refreshSeconds": state.cfg.refresh_seconds,
        "openaiBaseUrl": state.cfg.openai_base_url,
        "leaveBrowserOpen": false,
        "reasoningEffortOptions": crate::task::REASONING_EFFORT_OPTIONS,
        "reasoningEffortOptionsByModel": effort_by_model,
        "schedulingEnabled": true,
        "scheduleCheckSeconds": state.cfg.schedule_check_seconds,
    }))
}

async fn list_tasks(State(state): State<NodeState>) -> impl IntoResponse {
    Json(state.engine.list().await)
}

async fn create_task(
    State(state): State<NodeState>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) =
        body.map_err(|error| ApiError::invalid_input(format!("invalid task body: {error}")))?;
    let detail = state.engine.create(payload).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn task_detail(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.detail(&task_id).await?))
}

async fn delete_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.delete(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assist_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
    body: Result<Json<AssistRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) =
        body.map_err(|error| ApiError::invalid_input(format!("invalid assist body: {error}")))?;
    Ok(Json(state.engine.assist(&task_id, payload.message).await?))
}

async fn continue_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
    body: Result<Json<ContinueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) =
        body.map_err(|error| ApiError::invalid_input(format!("invalid continue body: {error}")))?;
    Ok(Json(
        state
            .engine
            .continue_task(&task_id, payload.instructions)
            .await?,
    ))
}

async fn stop_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.stop(&task_id).await?))
}

async fn run_now_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.run_now(&task_id).await?))
}

async fn schedule_task(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) =
        body.map_err(|error| ApiError::invalid_input(format!("invalid schedule body: {error}")))?;
    Ok(Json(
        state
            .engine
            .reschedule(&task_id, payload.scheduled_for)
            .await?,
    ))
}

async fn open_browser(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.open_browser(&task_id).await?))
}

async fn close_browser(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.close_browser(&task_id).await?))
}

async fn admin_vnc(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.mint_vnc(&task_id).await?))
}

// ── VNC endpoint ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VncQuery {
    #[serde(default)]
    token: String,
}

/// Token-gated WebSocket bridge. The gate decision happens before the
/// upgrade: 403 on token mismatch, 404 when the task has no open browser.
async fn vnc_ws(
    State(state): State<NodeState>,
    Path(task_id): Path<String>,
    Query(query): Query<VncQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.vnc.authorize(&task_id, &query.token).await {
        Ok(()) => {
            let broker = Arc::clone(&state.vnc);
            ws.on_upgrade(move |socket| async move { broker.proxy(socket, task_id).await })
        }
        Err(VncDenied::Forbidden) => StatusCode::FORBIDDEN.into_response(),
        Err(VncDenied::NotFound) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_gate_is_single_use() {
        let gate = EnrollmentGate::new(Some("secret".into()));
        assert!(gate.available());
        assert!(!gate.redeem("wrong"));
        assert!(gate.available());
        assert!(gate.redeem("secret"));
        assert!(!gate.available());
        assert!(!gate.redeem("secret"));
    }

    #[test]
    fn enrollment_gate_without_token_rejects_everything() {
        let gate = EnrollmentGate::new(None);
        assert!(!gate.available());
        assert!(!gate.redeem("anything"));
    }

    #[test]
    fn body_limit_covers_task_payloads() {
        assert!(MAX_BODY_SIZE >= 1024 * 1024);
    }

    #[test]
    fn hopeless_trust_requires_all_paths_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut cfg = NodeConfig {
            data_root: tmp.path().to_path_buf(),
            ..NodeConfig::default()
        };
        let ring = KeyRing::load(Vec::new(), cfg.trust_dir()).unwrap();
        assert!(trust_is_hopeless(&cfg, &ring));

        cfg.enroll_token = Some("tok".into());
        assert!(!trust_is_hopeless(&cfg, &ring));

        cfg.enroll_token = None;
        cfg.require_auth = false;
        assert!(!trust_is_hopeless(&cfg, &ring));
    }
}
