//! Standalone demo agent.
//!
//! Joins the fleet with an `echo` custom handler so the control plane can be
//! exercised end to end without embedding the worker in a real agent:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379/0 fleet-agent --agent-id echo-1 --roles demo
//! ```

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use fleet_protocol::Task;
use fleet_worker::{TaskHandler, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(about = "Standalone fleet worker agent")]
struct Cli {
    /// Unique agent identifier
    #[arg(long, default_value = "echo-1")]
    agent_id: String,

    /// Comma-separated roles for role-scoped targeting
    #[arg(long, default_value = "")]
    roles: String,

    /// Comma-separated groups beyond the fleet-wide default
    #[arg(long, default_value = "")]
    groups: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task) -> Result<Value> {
        Ok(json!({ "echo": task.payload, "sender": task.sender }))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = WorkerConfig::from_env();
    let mut worker = Worker::new(
        &cli.agent_id,
        split_list(&cli.roles),
        split_list(&cli.groups),
        config,
    );
    worker.register("echo", Arc::new(EchoHandler));

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.store(false, Ordering::SeqCst);
        }
    });

    worker.run().await
}
