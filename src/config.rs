//! Environment-driven configuration for the node and head services.
//!
//! Every knob has a default so a bare `browsergrid standalone` starts with
//! local paths; deployments override through the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

pub const DEFAULT_NODE_PORT: u16 = 7790;
pub const DEFAULT_HEAD_PORT: u16 = 7780;
pub const DEFAULT_MAX_STEPS: u32 = 80;
pub const DEFAULT_SCHEDULE_CHECK_SECONDS: u64 = 5;
pub const DEFAULT_NODE_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_ASSIST_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_STOP_GRACE_SECONDS: u64 = 15;
pub const DEFAULT_MODEL: &str = "gpt-5-mini";

/// Configuration for a worker node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub node_id: String,
    pub node_name: String,
    pub require_auth: bool,
    /// Trusted head keys: file paths or literal PEM blocks.
    pub head_public_keys: Vec<String>,
    pub data_root: PathBuf,
    pub max_steps_default: u32,
    pub default_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub schedule_check_seconds: u64,
    pub vnc_target_host: String,
    pub vnc_target_port: u16,
    pub enroll_token: Option<String>,
    pub worker_concurrency: Option<usize>,
    pub assist_timeout_seconds: u64,
    pub stop_grace_seconds: u64,
    pub agent_driver: String,
    pub refresh_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_NODE_PORT,
            node_id: "node-1".into(),
            node_name: "node-1".into(),
            require_auth: true,
            head_public_keys: Vec::new(),
            data_root: PathBuf::from("./data"),
            max_steps_default: DEFAULT_MAX_STEPS,
            default_model: DEFAULT_MODEL.into(),
            openai_api_key: None,
            openai_base_url: None,
            schedule_check_seconds: DEFAULT_SCHEDULE_CHECK_SECONDS,
            vnc_target_host: "127.0.0.1".into(),
            vnc_target_port: 5902,
            enroll_token: None,
            worker_concurrency: None,
            assist_timeout_seconds: DEFAULT_ASSIST_TIMEOUT_SECONDS,
            stop_grace_seconds: DEFAULT_STOP_GRACE_SECONDS,
            agent_driver: "scripted".into(),
            refresh_seconds: 3,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(port) = env_parse::<u16>("APP_PORT")? {
            cfg.port = port;
        }
        if let Some(id) = env_string("NODE_ID") {
            cfg.node_id = id;
        }
        cfg.node_name = env_string("NODE_NAME").unwrap_or_else(|| cfg.node_id.clone());
        if let Some(require) = env_parse::<bool>("NODE_REQUIRE_AUTH")? {
            cfg.require_auth = require;
        }
        if let Some(raw) = env_string("HEAD_PUBLIC_KEYS") {
            cfg.head_public_keys = split_key_sources(&raw);
        }
        if let Some(root) = env_string("DATA_ROOT") {
            cfg.data_root = PathBuf::from(root);
        }
        if let Some(steps) = env_parse::<u32>("MAX_STEPS_DEFAULT")? {
            if steps == 0 {
                bail!("MAX_STEPS_DEFAULT must be at least 1");
            }
            cfg.max_steps_default = steps;
        }
        if let Some(model) = env_string("OPENAI_MODEL") {
            cfg.default_model = model;
        }
        cfg.openai_api_key = env_string("OPENAI_API_KEY");
        cfg.openai_base_url = env_string("OPENAI_BASE_URL");
        if let Some(secs) = env_parse::<u64>("SCHEDULE_CHECK_SECONDS")? {
            if secs == 0 {
                bail!("SCHEDULE_CHECK_SECONDS must be at least 1");
            }
            cfg.schedule_check_seconds = secs;
        }
        if let Some(host) = env_string("VNC_TARGET_HOST") {
            cfg.vnc_target_host = host;
        }
        if let Some(port) = env_parse::<u16>("VNC_TARGET_PORT")? {
            cfg.vnc_target_port = port;
        }
        cfg.enroll_token = env_string("NODE_ENROLL_TOKEN");
        cfg.worker_concurrency = env_parse::<usize>("WORKER_CONCURRENCY")?;
        if let Some(secs) = env_parse::<u64>("ASSIST_TIMEOUT_SECONDS")? {
            cfg.assist_timeout_seconds = secs;
        }
        if let Some(secs) = env_parse::<u64>("STOP_GRACE_SECONDS")? {
            cfg.stop_grace_seconds = secs;
        }
        if let Some(driver) = env_string("AGENT_DRIVER") {
            cfg.agent_driver = driver;
        }
        if let Some(secs) = env_parse::<u64>("REFRESH_SECONDS")? {
            cfg.refresh_seconds = secs;
        }

        Ok(cfg)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_root.join("tasks")
    }

    pub fn trust_dir(&self) -> PathBuf {
        self.data_root.join("trust")
    }

    pub fn assist_timeout(&self) -> Duration {
        Duration::from_secs(self.assist_timeout_seconds)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

/// One node descriptor in the head's registry, seeded from `HEAD_NODES`.
///
/// `enabled` is the configured admin toggle that takes a node out of
/// rotation without removing it; `last_seen`/`last_error` track the most
/// recent round-trip and are updated by the head at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl NodeTarget {
    /// Fresh descriptor with no round-trip history; `name` defaults to the
    /// id and the node starts enabled.
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let id = id.into();
        let base_url = base_url.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            enabled: true,
            last_seen: None,
            last_error: None,
        }
    }
}

/// Configuration for the head service.
#[derive(Debug, Clone)]
pub struct HeadConfig {
    pub port: u16,
    pub nodes: Vec<NodeTarget>,
    pub key_dir: PathBuf,
    pub enroll_token: Option<String>,
    pub node_timeout_seconds: u64,
    pub assets_dir: Option<PathBuf>,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HEAD_PORT,
            nodes: Vec::new(),
            key_dir: PathBuf::from("./data/head"),
            enroll_token: None,
            node_timeout_seconds: DEFAULT_NODE_TIMEOUT_SECONDS,
            assets_dir: None,
        }
    }
}

impl HeadConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(port) = env_parse::<u16>("HEAD_PORT")? {
            cfg.port = port;
        }
        if let Some(raw) = env_string("HEAD_NODES") {
            cfg.nodes = parse_head_nodes(&raw)?;
        }
        if let Some(dir) = env_string("HEAD_KEY_DIR") {
            cfg.key_dir = PathBuf::from(dir);
        }
        cfg.enroll_token = env_string("HEAD_ENROLL_TOKEN");
        if let Some(secs) = env_parse::<u64>("HEAD_NODE_TIMEOUT_SECONDS")? {
            if secs == 0 {
                bail!("HEAD_NODE_TIMEOUT_SECONDS must be at least 1");
            }
            cfg.node_timeout_seconds = secs;
        }
        cfg.assets_dir = env_string("HEAD_ASSETS_DIR").map(PathBuf::from);

        Ok(cfg)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join("head_private.pem")
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.key_dir.join("head_public.pem")
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_seconds)
    }
}

/// `HEAD_NODES` grammar: comma-separated `url|id[|enabled]` entries; the id
/// doubles as the display name. Entries without an id get `node-N` by
/// position; the enabled flag defaults to `true` and lets a node be kept in
/// the registry while out of rotation.
pub fn parse_head_nodes(raw: &str) -> Result<Vec<NodeTarget>> {
    let mut nodes = Vec::new();
    for (idx, entry) in raw.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let segments: Vec<&str> = entry.split('|').map(str::trim).collect();
        if segments.len() > 3 {
            bail!("HEAD_NODES entry {entry:?} has too many segments (url|id[|enabled])");
        }
        let url = segments[0];
        if url.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("HEAD_NODES entry {entry:?} must start with an http(s) URL");
        }
        let id = segments
            .get(1)
            .copied()
            .filter(|s| !s.is_empty())
            .map_or_else(|| format!("node-{}", idx + 1), ToOwned::to_owned);
        let enabled = match segments.get(2).copied().filter(|s| !s.is_empty()) {
            None | Some("true") => true,
            Some("false") => false,
            Some(other) => {
                bail!("HEAD_NODES enabled flag must be true or false, got {other:?}")
            }
        };
        let mut node = NodeTarget::new(id, url);
        node.enabled = enabled;
        nodes.push(node);
    }
    let mut ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != nodes.len() {
        bail!("HEAD_NODES contains duplicate node ids");
    }
    Ok(nodes)
}

/// `HEAD_PUBLIC_KEYS` is a comma-separated list of paths or literal PEM
/// blocks. Literal blocks contain commas inside base64 never, so a plain
/// split is safe as long as each entry is either a path or one PEM block.
fn split_key_sources(raw: &str) -> Vec<String> {
    if raw.contains("-----BEGIN") {
        // Treat the whole value as literal PEM material; one key per block.
        return raw
            .split_inclusive("-----END PUBLIC KEY-----")
            .map(str::trim)
            .filter(|s| s.contains("-----BEGIN"))
            .map(ToOwned::to_owned)
            .collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(error) => bail!("invalid {name}={raw}: {error}"),
        },
    }
}
