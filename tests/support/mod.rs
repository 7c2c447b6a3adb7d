//! Shared fixtures for the integration suites: ephemeral node/head servers
//! wired with a scripted agent driver and a signing client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde_json::Value;
use tempfile::TempDir;

use browsergrid::config::{HeadConfig, NodeConfig, NodeTarget};
use browsergrid::engine::runner::AgentRunner;
use browsergrid::engine::scripted::ScriptedRunner;
use browsergrid::gateway::{self, NodeApp};
use browsergrid::head;
use browsergrid::head::client::NodeClient;
use browsergrid::security::keys::{HeadKeypair, ensure_keypair, generate_keypair};
use browsergrid::security::EnvelopeSigner;

/// Serve a router on an ephemeral localhost port.
pub async fn serve_router(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

pub fn node_config(tmp: &TempDir, head: &HeadKeypair) -> NodeConfig {
    NodeConfig {
        node_id: "node-a".into(),
        node_name: "node-a".into(),
        data_root: tmp.path().join("node"),
        head_public_keys: vec![head.public_pem.clone()],
        schedule_check_seconds: 1,
        stop_grace_seconds: 2,
        ..NodeConfig::default()
    }
}

pub struct TestNode {
    pub addr: SocketAddr,
    pub app: NodeApp,
    pub target: NodeTarget,
}

impl TestNode {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Boot a node with the given runner, scheduler timer included.
pub async fn spawn_node(cfg: NodeConfig, runner: Arc<dyn AgentRunner>) -> TestNode {
    let app = gateway::build_with_runner(cfg, runner).expect("build node");
    app.state.engine.spawn_scheduler();
    let addr = serve_router(app.router.clone()).await;
    let mut target = NodeTarget::new(app.state.cfg.node_id.clone(), format!("http://{addr}"));
    target.name = app.state.cfg.node_name.clone();
    TestNode { addr, app, target }
}

pub fn default_runner() -> Arc<dyn AgentRunner> {
    Arc::new(ScriptedRunner::completing(2))
}

/// Signing client bound to one node, mirroring what the head does.
pub struct SignedApi {
    pub client: NodeClient,
    pub target: NodeTarget,
}

impl SignedApi {
    pub fn new(head: &HeadKeypair, target: NodeTarget) -> Self {
        let signer = Arc::new(EnvelopeSigner::new(head));
        Self {
            client: NodeClient::new(signer, Duration::from_secs(10)),
            target,
        }
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let reply = self
            .client
            .call(&self.target, reqwest::Method::GET, path, None)
            .await
            .expect("node reachable");
        (reply.status.as_u16(), reply.body)
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> (u16, Value) {
        let reply = self
            .client
            .call(&self.target, reqwest::Method::POST, path, body)
            .await
            .expect("node reachable");
        (reply.status.as_u16(), reply.body)
    }

    pub async fn delete(&self, path: &str) -> u16 {
        let reply = self
            .client
            .call(&self.target, reqwest::Method::DELETE, path, None)
            .await
            .expect("node reachable");
        reply.status.as_u16()
    }
}

/// Poll task detail until `pred` holds or the deadline passes.
pub async fn wait_for_task<F>(api: &SignedApi, task_id: &str, mut pred: F) -> Value
where
    F: FnMut(&Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, body) = api.get(&format!("/api/tasks/{task_id}")).await;
        assert_eq!(status, 200, "task detail fetch failed: {body}");
        if pred(&body) {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task condition; last body {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn fresh_head() -> HeadKeypair {
    generate_keypair().expect("generate head keypair")
}

/// Materialize the head keypair under `tmp/head/` so a head built over the
/// same key directory signs with the key the nodes were told to trust.
pub fn head_keypair(tmp: &TempDir) -> HeadKeypair {
    let dir = tmp.path().join("head");
    ensure_keypair(&dir.join("head_private.pem"), &dir.join("head_public.pem"))
        .expect("create head keypair")
}

/// Boot a head over the given node targets.
pub async fn spawn_head(tmp: &TempDir, nodes: Vec<NodeTarget>, timeout_secs: u64) -> SocketAddr {
    let cfg = HeadConfig {
        nodes,
        key_dir: tmp.path().join("head"),
        node_timeout_seconds: timeout_secs,
        ..HeadConfig::default()
    };
    let (router, _state) = head::build(cfg).expect("build head");
    serve_router(router).await
}

pub fn create_task_body(title: &str) -> Value {
    serde_json::json!({
        "title": title,
        "instructions": "open the site and complete the checkout flow",
        "model": "gpt-5",
        "max_steps": 10,
        "leave_browser_open": false,
    })
}
