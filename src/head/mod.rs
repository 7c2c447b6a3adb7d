//! Head service: node registry, envelope signing, fan-out, task routing by
//! node affinity, and the UI-facing HTTP API.
//!
//! The head holds no task state of its own. Every task lives on the node
//! that created it; the head signs requests, relays replies, and keeps an
//! advisory task→node affinity cache (the record's `node_id` stays
//! authoritative).

pub mod client;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures_util::future::join_all;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;

use crate::config::{HeadConfig, NodeTarget};
use crate::error::ApiError;
use crate::security::keys::ensure_keypair;
use crate::security::EnvelopeSigner;
use client::{NodeClient, NodeReply};

pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

const TASK_ACTIONS: [&str; 8] = [
    "assist",
    "continue",
    "stop",
    "run-now",
    "schedule",
    "open-browser",
    "close-browser",
    "admin-vnc",
];

#[derive(Clone)]
pub struct HeadState {
    pub cfg: Arc<HeadConfig>,
    pub client: Arc<NodeClient>,
    pub public_key_pem: String,
    affinity: Arc<Mutex<HashMap<String, String>>>,
    /// Live node descriptors: the configured registry plus the last-seen
    /// status tracked from each round-trip.
    registry: Arc<Mutex<Vec<NodeTarget>>>,
}

impl HeadState {
    /// Snapshot of every configured node, disabled ones included.
    fn nodes(&self) -> Vec<NodeTarget> {
        self.registry.lock().expect("node registry poisoned").clone()
    }

    /// Nodes currently in rotation.
    fn enabled_nodes(&self) -> Vec<NodeTarget> {
        self.nodes().into_iter().filter(|n| n.enabled).collect()
    }

    fn node_by_id(&self, id: &str) -> Result<NodeTarget, ApiError> {
        let node = self
            .nodes()
            .into_iter()
            .find(|node| node.id == id)
            .ok_or_else(|| ApiError::invalid_input(format!("unknown node {id:?}")))?;
        if !node.enabled {
            return Err(ApiError::conflict(format!("node {id:?} is disabled")));
        }
        Ok(node)
    }

    /// Pick the node for an operation that carries no task id yet.
    fn select_node(&self, node_id: Option<&str>) -> Result<NodeTarget, ApiError> {
        match node_id {
            Some(id) => self.node_by_id(id),
            None => {
                let enabled = self.enabled_nodes();
                match enabled.as_slice() {
                    [] => Err(ApiError::conflict("no enabled nodes are configured")),
                    [node] => Ok(node.clone()),
                    _ => Err(ApiError::invalid_input(
                        "node_id is required when multiple nodes are configured",
                    )),
                }
            }
        }
    }

    /// Send one signed call and record the round-trip outcome on the node's
    /// descriptor.
    async fn call_node(
        &self,
        node: &NodeTarget,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<NodeReply, ApiError> {
        let result = self.client.call(node, method, path_and_query, body).await;
        match &result {
            Ok(_) => self.note_roundtrip(&node.id, None),
            Err(error) => self.note_roundtrip(&node.id, Some(fanout_detail(error))),
        }
        result
    }

    fn note_roundtrip(&self, node_id: &str, error: Option<String>) {
        let mut registry = self.registry.lock().expect("node registry poisoned");
        if let Some(node) = registry.iter_mut().find(|n| n.id == node_id) {
            match error {
                None => {
                    node.last_seen = Some(Utc::now());
                    node.last_error = None;
                }
                Some(detail) => node.last_error = Some(detail),
            }
        }
    }

    fn remember_affinity(&self, task_id: &str, node_id: &str) {
        self.affinity
            .lock()
            .expect("affinity cache poisoned")
            .insert(task_id.to_string(), node_id.to_string());
    }

    fn forget_affinity(&self, task_id: &str) {
        self.affinity
            .lock()
            .expect("affinity cache poisoned")
            .remove(task_id);
    }

    fn cached_node(&self, task_id: &str) -> Option<NodeTarget> {
        let node_id = self
            .affinity
            .lock()
            .expect("affinity cache poisoned")
            .get(task_id)
            .cloned()?;
        self.node_by_id(&node_id).ok()
    }

    /// Find the node owning a task: explicit `node_id` first, then the
    /// affinity cache, then a lightweight broadcast probe. Disabled nodes
    /// are out of rotation and never probed.
    async fn resolve_task_node(
        &self,
        task_id: &str,
        node_id: Option<&str>,
    ) -> Result<NodeTarget, ApiError> {
        if let Some(id) = node_id {
            return self.node_by_id(id);
        }
        let enabled = self.enabled_nodes();
        if let [node] = enabled.as_slice() {
            return Ok(node.clone());
        }
        if let Some(node) = self.cached_node(task_id) {
            return Ok(node);
        }

        let path = format!("/api/tasks/{task_id}");
        let probes = join_all(enabled.into_iter().map(|node| {
            let path = path.clone();
            async move {
                let reply = self.call_node(&node, Method::HEAD, &path, None).await;
                (node, reply)
            }
        }))
        .await;

        for (node, reply) in probes {
            if let Ok(reply) = reply
                && reply.is_success()
            {
                self.remember_affinity(task_id, &node.id);
                return Ok(node);
            }
        }
        Err(ApiError::not_found(task_id))
    }
}

/// Build the head router. Generates the keypair on first start.
pub fn build(cfg: HeadConfig) -> Result<(Router, HeadState)> {
    anyhow::ensure!(
        !cfg.nodes.is_empty(),
        "HEAD_NODES is empty; configure at least one node (url|id[,url|id...])"
    );
    let keypair = ensure_keypair(&cfg.private_key_path(), &cfg.public_key_path())
        .context("load or create head keypair")?;
    let signer = Arc::new(EnvelopeSigner::new(&keypair));
    let client = Arc::new(NodeClient::new(signer, cfg.node_timeout()));
    let cfg = Arc::new(cfg);
    let state = HeadState {
        registry: Arc::new(Mutex::new(cfg.nodes.clone())),
        cfg,
        client,
        public_key_pem: keypair.public_pem,
        affinity: Arc::new(Mutex::new(HashMap::new())),
    };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/security/public-key", get(public_key))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{node_id}/install-head-key", post(install_head_key))
        .route("/api/config/defaults", get(config_defaults))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{task_id}", get(task_detail).delete(delete_task))
        .route("/api/tasks/{task_id}/{action}", post(task_action))
        .with_state(state.clone());

    match state.cfg.assets_dir.as_deref().filter(|dir| dir.is_dir()) {
        Some(dir) => {
            router = router.fallback_service(ServeDir::new(dir));
        }
        None => {
            router = router.fallback(index_placeholder);
        }
    }

    let router = router
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));
    Ok((router, state))
}

pub async fn serve(cfg: HeadConfig) -> Result<()> {
    let port = cfg.port;
    let (router, state) = build(cfg)?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("bind head socket")?;
    tracing::info!(
        port,
        nodes = state.cfg.nodes.len(),
        "head listening"
    );
    axum::serve(listener, router)
        .await
        .context("serve head HTTP")?;
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn relay(reply: NodeReply) -> Response {
    if reply.status == StatusCode::NO_CONTENT {
        return StatusCode::NO_CONTENT.into_response();
    }
    (reply.status, Json(reply.body)).into_response()
}

/// Make node-relative values usable from the operator's browser: prefix the
/// VNC launch URL with the owning node's base URL and stamp the node id
/// into the relayed record.
fn localize(node: &NodeTarget, mut body: Value) -> Value {
    if let Some(url) = body.get("vnc_launch_url").and_then(Value::as_str)
        && url.starts_with('/')
    {
        let absolute = format!("{}{url}", node.base_url);
        body["vnc_launch_url"] = Value::String(absolute);
    }
    if let Some(record) = body.get_mut("record").and_then(Value::as_object_mut) {
        record.insert("node_id".into(), json!(node.id));
    }
    body
}

fn fanout_detail(error: &ApiError) -> String {
    match error {
        ApiError::NodeTimeout { .. } => "timeout".into(),
        ApiError::NodeUnreachable { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct TaskQuery {
    node_id: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn index_placeholder() -> impl IntoResponse {
    Html(
        "<html><body><h1>browsergrid head</h1>\
         <p>No UI bundle configured (set HEAD_ASSETS_DIR). API under /api/.</p>\
         </body></html>",
    )
}

async fn public_key(State(state): State<HeadState>) -> impl IntoResponse {
    Json(json!({ "public_key": state.public_key_pem }))
}

async fn list_nodes(State(state): State<HeadState>) -> impl IntoResponse {
    let probes = join_all(state.nodes().into_iter().map(|node| {
        let state = state.clone();
        async move {
            if !node.enabled {
                return (node.id.clone(), None);
            }
            let reply = state
                .call_node(&node, Method::GET, "/api/node/info", None)
                .await;
            (node.id.clone(), Some(reply))
        }
    }))
    .await;
    let replies: HashMap<String, Option<Result<NodeReply, ApiError>>> =
        probes.into_iter().collect();

    // Re-snapshot after the probes so last_seen/last_error reflect them.
    let nodes: Vec<Value> = state
        .nodes()
        .into_iter()
        .map(|node| {
            let probe = if node.enabled {
                replies.get(&node.id).and_then(Option::as_ref)
            } else {
                None
            };
            let status = match probe {
                Some(Ok(reply)) if reply.is_success() => json!({
                    "ready": reply.body.get("ready").and_then(Value::as_bool).unwrap_or(false),
                    "issues": reply.body.get("issues").cloned().unwrap_or_else(|| json!([])),
                    "reachable": true,
                    "enrollment": reply.body.get("enrollment").and_then(Value::as_bool).unwrap_or(false),
                }),
                Some(Ok(reply)) => json!({
                    "ready": false,
                    "issues": [format!("node answered {}", reply.status)],
                    "reachable": true,
                    "enrollment": false,
                }),
                Some(Err(error)) => json!({
                    "ready": false,
                    "issues": [fanout_detail(error)],
                    "reachable": false,
                    "enrollment": false,
                }),
                None => json!({
                    "ready": false,
                    "issues": ["disabled"],
                    "reachable": false,
                    "enrollment": false,
                }),
            };
            let mut entry = json!({
                "id": node.id,
                "name": node.name,
                "url": node.base_url,
                "enabled": node.enabled,
                "last_seen": node.last_seen,
                "last_error": node.last_error,
            });
            if let (Some(entry), Some(status)) = (entry.as_object_mut(), status.as_object()) {
                for (key, value) in status {
                    entry.insert(key.clone(), value.clone());
                }
            }
            entry
        })
        .collect();

    Json(json!({
        "nodes": nodes,
        "public_key": state.public_key_pem,
        "enroll_token": state.cfg.enroll_token,
    }))
}

async fn install_head_key(
    State(state): State<HeadState>,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(token) = state.cfg.enroll_token.clone() else {
        return Err(ApiError::invalid_input("enrollment token not configured"));
    };
    let node = state.node_by_id(&node_id)?;
    let payload = json!({ "public_key": state.public_key_pem, "token": token });
    let reply = state
        .call_node(&node, Method::POST, "/api/admin/head-key", Some(&payload))
        .await?;
    Ok(relay(reply))
}

async fn config_defaults(
    State(state): State<HeadState>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let node = match query.node_id.as_deref() {
        Some(id) => state.node_by_id(id)?,
        None => state
            .enabled_nodes()
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::conflict("no enabled nodes are configured"))?,
    };
    let reply = state
        .call_node(&node, Method::GET, "/api/config/defaults", None)
        .await?;
    if !reply.is_success() {
        return Ok(relay(reply));
    }
    let mut body = reply.body;
    body["nodeId"] = json!(node.id);
    body["nodeName"] = json!(node.name);
    Ok(Json(body).into_response())
}

/// Fan out to every enabled node, merging summaries. A slow or failing node
/// degrades only its own entries: its failure lands in `errors[]` and the
/// response stays 200.
async fn list_tasks(State(state): State<HeadState>) -> impl IntoResponse {
    let replies = join_all(state.enabled_nodes().into_iter().map(|node| {
        let state = state.clone();
        async move {
            let reply = state.call_node(&node, Method::GET, "/api/tasks", None).await;
            (node, reply)
        }
    }))
    .await;

    let mut tasks: Vec<Value> = Vec::new();
    let mut errors: Vec<Value> = Vec::new();
    for (node, reply) in replies {
        match reply {
            Ok(reply) if reply.is_success() => {
                if let Value::Array(items) = reply.body {
                    for mut item in items {
                        if item.get("node_id").and_then(Value::as_str).is_none() {
                            item["node_id"] = json!(node.id);
                        }
                        tasks.push(item);
                    }
                }
            }
            Ok(reply) => {
                errors.push(json!({
                    "node_id": node.id,
                    "detail": format!("node answered {}", reply.status),
                }));
            }
            Err(error) => {
                errors.push(json!({
                    "node_id": node.id,
                    "detail": fanout_detail(&error),
                }));
            }
        }
    }

    Json(json!({ "tasks": tasks, "errors": errors }))
}

async fn create_task(
    State(state): State<HeadState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut payload) =
        body.map_err(|error| ApiError::invalid_input(format!("invalid task body: {error}")))?;
    let node_id = payload
        .get("node_id")
        .or_else(|| payload.get("nodeId"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    if let Some(map) = payload.as_object_mut() {
        map.remove("node_id");
        map.remove("nodeId");
    }
    let node = state.select_node(node_id.as_deref())?;

    let reply = state
        .call_node(&node, Method::POST, "/api/tasks", Some(&payload))
        .await?;
    if !reply.is_success() {
        return Ok(relay(reply));
    }
    let body = localize(&node, reply.body);
    if let Some(task_id) = body
        .get("record")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
    {
        state.remember_affinity(task_id, &node.id);
    }
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn task_detail(
    State(state): State<HeadState>,
    Path(task_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let node = state
        .resolve_task_node(&task_id, query.node_id.as_deref())
        .await?;
    let reply = state
        .call_node(&node, Method::GET, &format!("/api/tasks/{task_id}"), None)
        .await?;
    if !reply.is_success() {
        return Ok(relay(reply));
    }
    Ok(Json(localize(&node, reply.body)).into_response())
}

async fn delete_task(
    State(state): State<HeadState>,
    Path(task_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, ApiError> {
    let node = state
        .resolve_task_node(&task_id, query.node_id.as_deref())
        .await?;
    let reply = state
        .call_node(&node, Method::DELETE, &format!("/api/tasks/{task_id}"), None)
        .await?;
    if reply.is_success() {
        state.forget_affinity(&task_id);
    }
    Ok(relay(reply))
}

async fn task_action(
    State(state): State<HeadState>,
    Path((task_id, action)): Path<(String, String)>,
    Query(query): Query<TaskQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    if !TASK_ACTIONS.contains(&action.as_str()) {
        return Err(ApiError::not_found(format!("action {action}")));
    }
    let payload = body.ok().map(|Json(value)| value);
    let node = state
        .resolve_task_node(&task_id, query.node_id.as_deref())
        .await?;
    let reply = state
        .call_node(
            &node,
            Method::POST,
            &format!("/api/tasks/{task_id}/{action}"),
            payload.as_ref(),
        )
        .await?;
    if !reply.is_success() {
        return Ok(relay(reply));
    }
    Ok(Json(localize(&node, reply.body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str) -> NodeTarget {
        NodeTarget::new(id, format!("http://{id}.local:7790"))
    }

    fn disabled_target(id: &str) -> NodeTarget {
        let mut node = target(id);
        node.enabled = false;
        node
    }

    fn state_with_nodes(nodes: Vec<NodeTarget>) -> HeadState {
        let keypair = crate::security::keys::generate_keypair().unwrap();
        let signer = Arc::new(EnvelopeSigner::new(&keypair));
        HeadState {
            registry: Arc::new(Mutex::new(nodes.clone())),
            cfg: Arc::new(HeadConfig {
                nodes,
                ..HeadConfig::default()
            }),
            client: Arc::new(NodeClient::new(signer, std::time::Duration::from_secs(5))),
            public_key_pem: keypair.public_pem,
            affinity: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[test]
    fn select_node_uses_single_node_without_id() {
        let state = state_with_nodes(vec![target("a")]);
        assert_eq!(state.select_node(None).unwrap().id, "a");
    }

    #[test]
    fn select_node_requires_id_with_multiple_nodes() {
        let state = state_with_nodes(vec![target("a"), target("b")]);
        let err = state.select_node(None).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert_eq!(state.select_node(Some("b")).unwrap().id, "b");
    }

    #[test]
    fn select_node_skips_disabled_nodes() {
        // Two configured, one in rotation: no node_id needed.
        let state = state_with_nodes(vec![target("a"), disabled_target("b")]);
        assert_eq!(state.select_node(None).unwrap().id, "a");

        // Addressing the disabled node directly is refused.
        let err = state.select_node(Some("b")).unwrap_err();
        assert_eq!(err.code(), "conflict");

        // Nothing in rotation at all.
        let state = state_with_nodes(vec![disabled_target("a")]);
        assert_eq!(state.select_node(None).unwrap_err().code(), "conflict");
    }

    #[test]
    fn disabled_node_is_dropped_from_rotation_and_affinity() {
        let state = state_with_nodes(vec![target("a"), disabled_target("b")]);
        let enabled = state.enabled_nodes();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "a");

        // A cached affinity pointing at a disabled node does not resolve.
        state.remember_affinity("t1", "b");
        assert!(state.cached_node("t1").is_none());
    }

    #[test]
    fn roundtrips_update_last_seen_and_last_error() {
        let state = state_with_nodes(vec![target("a")]);
        assert!(state.nodes()[0].last_seen.is_none());

        state.note_roundtrip("a", None);
        let node = state.nodes()[0].clone();
        assert!(node.last_seen.is_some());
        assert!(node.last_error.is_none());

        state.note_roundtrip("a", Some("timeout".into()));
        let node = state.nodes()[0].clone();
        assert_eq!(node.last_error.as_deref(), Some("timeout"));
        // last_seen survives a failed round-trip.
        assert!(node.last_seen.is_some());
    }

    #[test]
    fn localize_rewrites_relative_vnc_url_and_node_id() {
        let node = target("alpha");
        let body = json!({
            "record": { "id": "t1", "node_id": "stale" },
            "vnc_launch_url": "/vnc/t1?token=abc",
        });
        let out = localize(&node, body);
        assert_eq!(
            out["vnc_launch_url"],
            json!("http://alpha.local:7790/vnc/t1?token=abc")
        );
        assert_eq!(out["record"]["node_id"], json!("alpha"));
    }

    #[test]
    fn localize_leaves_absolute_urls_alone() {
        let node = target("alpha");
        let body = json!({ "vnc_launch_url": "https://other/vnc/t1?token=abc" });
        let out = localize(&node, body);
        assert_eq!(out["vnc_launch_url"], json!("https://other/vnc/t1?token=abc"));
    }

    #[test]
    fn affinity_cache_roundtrip() {
        let state = state_with_nodes(vec![target("a"), target("b")]);
        assert!(state.cached_node("t1").is_none());
        state.remember_affinity("t1", "b");
        assert_eq!(state.cached_node("t1").unwrap().id, "b");
        state.forget_affinity("t1");
        assert!(state.cached_node("t1").is_none());
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(!TASK_ACTIONS.contains(&"self-destruct"));
        assert!(TASK_ACTIONS.contains(&"run-now"));
    }

    #[test]
    fn fanout_detail_maps_timeouts() {
        let err = ApiError::NodeTimeout {
            node_id: "b".into(),
        };
        assert_eq!(fanout_detail(&err), "timeout");
    }
}
