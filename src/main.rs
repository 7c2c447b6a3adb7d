#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use browsergrid::config::{HeadConfig, NodeConfig, NodeTarget};
use browsergrid::{gateway, head};

/// Exit code for unusable configuration.
const EXIT_INVALID_CONFIG: i32 = 2;
/// Exit code for a node that requires auth but has no path to trust material.
const EXIT_MISSING_TRUST: i32 = 3;

#[derive(Parser)]
#[command(
    name = "browsergrid",
    version,
    about = "Head/node control plane for AI browser-automation tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker node: owns tasks, browsers, VNC access, and schedules.
    Node,
    /// Run the head: UI API, node registry, request signing.
    Head,
    /// Run the head and one node collocated in a single process.
    Standalone,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let cli = Cli::parse();
    match cli.command {
        Command::Node => run_node().await,
        Command::Head => run_head().await,
        Command::Standalone => run_standalone().await,
    }
}

fn invalid_config(error: &anyhow::Error) -> ! {
    eprintln!("invalid configuration: {error:#}");
    std::process::exit(EXIT_INVALID_CONFIG);
}

async fn run_node() -> Result<()> {
    let cfg = NodeConfig::from_env().unwrap_or_else(|e| invalid_config(&e));
    let app = gateway::build(cfg).unwrap_or_else(|e| invalid_config(&e));
    if gateway::trust_is_hopeless(&app.state.cfg, &app.state.ring) {
        eprintln!(
            "node requires auth but has no trusted keys, no HEAD_PUBLIC_KEYS sources, \
             and no NODE_ENROLL_TOKEN; refusing to start"
        );
        std::process::exit(EXIT_MISSING_TRUST);
    }
    gateway::run(app).await
}

async fn run_head() -> Result<()> {
    let cfg = HeadConfig::from_env().unwrap_or_else(|e| invalid_config(&e));
    match head::serve(cfg).await {
        Ok(()) => Ok(()),
        Err(error) => invalid_config(&error),
    }
}

/// Single-process build: the head and one node share the address space but
/// keep talking through the same signed HTTP interfaces.
async fn run_standalone() -> Result<()> {
    let mut node_cfg = NodeConfig::from_env().unwrap_or_else(|e| invalid_config(&e));
    let mut head_cfg = HeadConfig::from_env().unwrap_or_else(|e| invalid_config(&e));

    if head_cfg.nodes.is_empty() {
        let mut node = NodeTarget::new(
            node_cfg.node_id.clone(),
            format!("http://127.0.0.1:{}", node_cfg.port),
        );
        node.name = node_cfg.node_name.clone();
        head_cfg.nodes = vec![node];
    }
    if node_cfg.head_public_keys.is_empty() {
        // Trust the collocated head's key; the ring picks the file up once
        // the head has written it.
        node_cfg.head_public_keys = vec![head_cfg.public_key_path().display().to_string()];
    }

    let node_app = gateway::build(node_cfg).unwrap_or_else(|e| invalid_config(&e));
    tokio::try_join!(gateway::run(node_app), head::serve(head_cfg))?;
    Ok(())
}
