//! IRC-facing fleet commander.
//!
//! Two loops per session: ingress reads channel lines and turns signed
//! commands into broker tasks; egress tails the result stream and relays
//! each outcome back to the primary channel. Sessions reconnect forever
//! until a shutdown signal arrives.

mod commands;
mod config;
mod irc;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::timeout;
use tracing::{error, info, warn};

use fleet_broker::{AgentPresence, Broker, BrokerConfig};
use fleet_protocol::{now_ts, TaskResult};

use commands::{CommandGate, Outcome};
use config::CommanderConfig;
use irc::{parse_line, IrcConnection, IrcWriter};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
// No traffic for this long means the link is probably dead; probe it.
const READ_IDLE: Duration = Duration::from_secs(240);
const RESULT_BATCH: usize = 20;
const RESULT_BLOCK_MS: usize = 2000;

#[derive(Parser, Debug)]
#[command(name = "fleet-commander")]
#[command(about = "IRC control-plane bridge for the fleet")]
struct Cli {
    /// HMAC secret (overrides FLEET_HMAC_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut cfg = CommanderConfig::from_env();
    if let Some(secret) = cli.secret {
        cfg.secret = secret;
    }
    cfg.validate()?;

    let broker = connect_broker(&cfg).await?;
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    let mut gate = CommandGate::new(
        cfg.secret.clone(),
        cfg.allowed_users.clone(),
        cfg.privileged_users.clone(),
        cfg.rate_limit_requests,
        cfg.rate_limit_window_secs,
    );

    while running.load(Ordering::SeqCst) {
        let conn = match IrcConnection::connect(&cfg).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("IRC connect failed: {:#}", err);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        if let Err(err) = run_session(conn, &cfg, &broker, &mut gate, &running).await {
            warn!("Session ended: {:#}", err);
        }
        if running.load(Ordering::SeqCst) {
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    info!("Commander stopped");
    Ok(())
}

async fn connect_broker(cfg: &CommanderConfig) -> Result<Broker> {
    let broker_cfg = BrokerConfig::with_url(&cfg.redis_url);
    loop {
        match Broker::connect(broker_cfg.clone()).await {
            Ok(broker) => return Ok(broker),
            Err(err) => {
                warn!("Broker connect failed, retrying: {}", err);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// One connected IRC session: announce, relay results, process commands.
async fn run_session(
    mut conn: IrcConnection,
    cfg: &CommanderConfig,
    broker: &Broker,
    gate: &mut CommandGate,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let writer = conn.writer();
    let channel = cfg.primary_channel().to_string();
    writer
        .privmsg(&channel, "Fleet commander online. !help for commands")
        .await?;

    let egress = tokio::spawn(relay_results(
        broker.clone(),
        writer.clone(),
        channel.clone(),
        running.clone(),
    ));

    let result = ingress_loop(&mut conn, cfg, broker, gate, running).await;

    egress.abort();
    if !running.load(Ordering::SeqCst) {
        let _ = writer.quit("shutting down").await;
    }
    result
}

async fn ingress_loop(
    conn: &mut IrcConnection,
    cfg: &CommanderConfig,
    broker: &Broker,
    gate: &mut CommandGate,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let writer = conn.writer();
    while running.load(Ordering::SeqCst) {
        let line = match timeout(READ_IDLE, conn.read_line()).await {
            Ok(read) => read?,
            Err(_) => {
                writer.send_raw(&format!("PING :{}", now_ts())).await?;
                continue;
            }
        };

        let msg = parse_line(&line);
        match msg.command.as_str() {
            "PING" => writer.pong(&msg.trailing).await?,
            "PRIVMSG" => {
                let channel = msg.channel().to_string();
                if !cfg.irc_channels.iter().any(|c| c == &channel) {
                    continue;
                }
                let outcome = gate.evaluate(&msg.nick, &msg.trailing);
                apply_outcome(outcome, &msg.nick, &channel, broker, &writer).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn apply_outcome(
    outcome: Outcome,
    nick: &str,
    channel: &str,
    broker: &Broker,
    writer: &IrcWriter,
) -> Result<()> {
    match outcome {
        Outcome::Ignore => {}
        Outcome::Replies(lines) => {
            for line in lines {
                writer.privmsg(channel, &line).await?;
            }
        }
        Outcome::ListAgents => match broker.online_agents().await {
            Ok(agents) => {
                for line in format_agents(&agents) {
                    writer.privmsg(channel, &line).await?;
                }
            }
            Err(err) => {
                error!("Presence query failed: {}", err);
                writer
                    .privmsg(channel, &format!("{}: Broker unavailable", nick))
                    .await?;
            }
        },
        Outcome::Enqueue { task, ack } => match broker.append_task(&task).await {
            Ok(_) => writer.privmsg(channel, &ack).await?,
            Err(err) => {
                error!(task_id = %task.task_id, "Enqueue failed: {}", err);
                writer
                    .privmsg(channel, &format!("{}: Failed to enqueue task", nick))
                    .await?;
            }
        },
    }
    Ok(())
}

/// Presence list as chat lines, chunked to stay within one IRC message.
fn format_agents(agents: &[AgentPresence]) -> Vec<String> {
    if agents.is_empty() {
        return vec!["No agents online".to_string()];
    }

    let mut lines = Vec::new();
    let mut current = String::from("Agents:");
    for agent in agents {
        let age = agent.age_secs();
        let entry = if age <= 90 {
            format!(" {}:OK", agent.agent_id)
        } else {
            format!(" {}:STALE({}s)", agent.agent_id, age)
        };
        if current.len() + entry.len() > 380 {
            lines.push(current);
            current = String::from("Agents:");
        }
        current.push_str(&entry);
    }
    lines.push(current);
    lines
}

/// Tail the result stream from "now" and relay each result to the channel.
async fn relay_results(
    broker: Broker,
    writer: IrcWriter,
    channel: String,
    running: Arc<AtomicBool>,
) {
    let mut last_id = "$".to_string();
    while running.load(Ordering::SeqCst) {
        match broker
            .tail_results(&last_id, RESULT_BATCH, RESULT_BLOCK_MS)
            .await
        {
            Ok((entries, next)) => {
                last_id = next;
                for entry in entries {
                    match TaskResult::from_record(&entry.record) {
                        Ok(result) => {
                            let line = result.to_chat_line(380);
                            if let Err(err) = writer.privmsg(&channel, &line).await {
                                warn!("Result relay write failed: {}", err);
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(entry_id = %entry.id, "Undecodable result entry: {}", err)
                        }
                    }
                }
            }
            Err(err) => {
                warn!("Result tail failed: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
