//! sandbox-exec-engine daemon
//!
//! MCP server that runs untrusted Python and JavaScript in network-isolated
//! containers. Configuration comes from `--config` or the
//! `SANDBOX_ENGINE_CONFIG` env var.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_exec_engine::{
    backend::DockerCli, config::Config, engine::Engine, history::InMemoryHistory, mcp,
    registry::InMemoryRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "sandbox-exec-engine")]
#[command(about = "MCP server for measured, isolated code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// JSON configuration file
    #[arg(long, env = "SANDBOX_ENGINE_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        docker_bin = %config.docker_bin,
        memory_limit_mb = config.memory_limit_mb,
        max_timeout_ms = config.max_timeout_ms,
        "Loaded configuration"
    );

    let runtime = Arc::new(DockerCli::from_config(&config));
    let engine = Arc::new(Engine::new(runtime, &config));

    match engine.check_runtime().await {
        Ok(()) => info!(runtime = engine.runtime_name(), "Container runtime connected"),
        Err(e) => warn!(
            runtime = engine.runtime_name(),
            error = %e,
            "Container runtime disconnected, executions will fail until it is reachable"
        ),
    }

    let served = mcp::serve_stdio(
        Arc::clone(&engine),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryHistory::new()),
    )
    .await;

    engine.shutdown().await;
    served
}
