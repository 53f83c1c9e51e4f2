// # -----------------------------
// # crates/worker/src/lib.rs
// # -----------------------------
//! Per-agent worker: consumes tasks from the broker, dispatches them to a
//! registered handler table, and emits results.
//!
//! Embedded in every agent process. Two loops run concurrently: a heartbeat
//! loop refreshing the agent's presence record, and a consumption loop
//! reading the shared task stream through a consumer group. Delivery is
//! at-least-once; handlers should be idempotent where feasible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use fleet_broker::{Broker, BrokerConfig, Entry};
use fleet_protocol::{
    Command, Task, TaskResult, TaskStatus, TargetMatcher, CONSUMER_GROUP, HEARTBEAT_TTL_SECS,
};

/// Handler for one action name. Returning `Err` yields a `failed` result;
/// it never kills the consumption loop.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<Value>;
}

/// Optional seam to the embedding agent's resources, used by the built-in
/// balance/status/health handlers.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Balance or resource snapshot for the `balance` command.
    async fn balance(&self) -> anyhow::Result<Value>;

    /// Extra fields merged into the `status` output.
    fn status_extras(&self) -> Value {
        json!({})
    }

    /// Liveness of agent-owned resources for the `health` command.
    async fn healthy(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl_secs: usize,
    pub task_batch: usize,
    pub block_ms: usize,
    /// Shared by the whole fleet by default (competing consumers). Give each
    /// worker its own group to get broadcast fan-out instead.
    pub consumer_group: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_ttl_secs: HEARTBEAT_TTL_SECS,
            task_batch: 5,
            block_ms: 2000,
            consumer_group: CONSUMER_GROUP.to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            cfg.redis_url = url;
        }
        if let Some(secs) = env_parse::<u64>("FLEET_HEARTBEAT_INTERVAL") {
            cfg.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("FLEET_TASK_BATCH") {
            cfg.task_batch = n;
        }
        if let Some(ms) = env_parse::<usize>("FLEET_BLOCK_MS") {
            cfg.block_ms = ms;
        }
        if let Ok(group) = std::env::var("FLEET_CONSUMER_GROUP") {
            if !group.trim().is_empty() {
                cfg.consumer_group = group;
            }
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Invalid {} value '{}': {}", name, raw, err);
                None
            }
        },
        Err(_) => None,
    }
}

/// Event attached to a processed task (halt/resume notices).
#[derive(Debug, Clone)]
pub struct FleetEvent {
    pub kind: String,
    pub data: Value,
}

/// What the consumption loop should do with one decoded task.
#[derive(Debug)]
pub enum Disposition {
    /// Not addressed to this worker; acknowledge without processing.
    Ignored,
    /// Emit the result (and event, if any), then acknowledge.
    Done {
        result: TaskResult,
        event: Option<FleetEvent>,
    },
}

pub struct Worker {
    agent_id: String,
    matcher: TargetMatcher,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    halted: AtomicBool,
    running: Arc<AtomicBool>,
    started_at: Instant,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(agent_id: &str, roles: Vec<String>, groups: Vec<String>, config: WorkerConfig) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            matcher: TargetMatcher::new(agent_id, roles, groups),
            handlers: HashMap::new(),
            probe: None,
            halted: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
            config,
        }
    }

    /// Register a custom handler. Registering an action twice replaces the
    /// earlier handler; built-in actions can be overridden the same way.
    pub fn register(&mut self, action: &str, handler: Arc<dyn TaskHandler>) {
        debug!(agent_id = %self.agent_id, action, "handler registered");
        self.handlers.insert(action.to_string(), handler);
    }

    pub fn set_probe(&mut self, probe: Arc<dyn ResourceProbe>) {
        self.probe = Some(probe);
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Flag checked by both loops each iteration; store `false` to stop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    fn broker_config(&self) -> BrokerConfig {
        let mut cfg = BrokerConfig::with_url(&self.config.redis_url);
        cfg.group = self.config.consumer_group.clone();
        cfg
    }

    /// Run heartbeat and consumption loops until the shutdown flag drops.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config.clone();
        let broker_cfg = self.broker_config();
        let worker = Arc::new(self);

        info!(agent_id = %worker.agent_id, group = %broker_cfg.group, "worker starting");

        let hb_worker = worker.clone();
        let hb_cfg = broker_cfg.clone();
        let hb = tokio::spawn(async move {
            hb_worker.heartbeat_loop(hb_cfg).await;
        });

        worker.consume_loop(broker_cfg, &config).await;
        hb.await.ok();
        info!(agent_id = %worker.agent_id, "worker stopped");
        Ok(())
    }

    async fn heartbeat_loop(&self, cfg: BrokerConfig) {
        let mut broker: Option<Broker> = None;
        while self.running.load(Ordering::SeqCst) {
            if broker.is_none() {
                match Broker::connect(cfg.clone()).await {
                    Ok(b) => broker = Some(b),
                    Err(err) => warn!(agent_id = %self.agent_id, "heartbeat broker unavailable: {}", err),
                }
            }
            if let Some(b) = &broker {
                if let Err(err) = b
                    .publish_heartbeat(&self.agent_id, self.config.heartbeat_ttl_secs)
                    .await
                {
                    warn!(agent_id = %self.agent_id, "heartbeat failed: {}", err);
                    broker = None;
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }

    async fn consume_loop(&self, cfg: BrokerConfig, config: &WorkerConfig) {
        while self.running.load(Ordering::SeqCst) {
            let broker = match Broker::connect(cfg.clone()).await {
                Ok(b) => b,
                Err(err) => {
                    warn!(agent_id = %self.agent_id, "broker unavailable: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if let Err(err) = broker.ensure_group().await {
                warn!(agent_id = %self.agent_id, "consumer group setup failed: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            // Inner loop: read batches until the connection breaks or we stop.
            while self.running.load(Ordering::SeqCst) {
                let entries = match broker
                    .read_group(&self.agent_id, config.task_batch, config.block_ms)
                    .await
                {
                    Ok(entries) => entries,
                    Err(err) => {
                        error!(agent_id = %self.agent_id, "task read failed: {}", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        break;
                    }
                };

                for entry in entries {
                    self.handle_entry(&broker, entry).await;
                }
            }
        }
    }

    async fn handle_entry(&self, broker: &Broker, entry: Entry) {
        let task = match Task::from_record(&entry.record) {
            Ok(task) => task,
            Err(err) => {
                // Redelivery cannot fix a malformed record; drop it.
                warn!(entry_id = %entry.id, "undecodable task record: {}", err);
                self.ack(broker, &entry.id).await;
                return;
            }
        };

        match self.process(&task).await {
            Disposition::Ignored => {}
            Disposition::Done { result, event } => {
                if let Err(err) = broker.append_result(&result).await {
                    error!(task_id = %task.task_id, "failed to emit result: {}", err);
                }
                if let Some(ev) = event {
                    if let Err(err) = broker.append_event(&self.agent_id, &ev.kind, ev.data).await {
                        warn!(task_id = %task.task_id, "failed to emit event: {}", err);
                    }
                }
            }
        }
        self.ack(broker, &entry.id).await;
    }

    async fn ack(&self, broker: &Broker, entry_id: &str) {
        if let Err(err) = broker.ack(entry_id).await {
            warn!(entry_id, "ack failed: {}", err);
        }
    }

    /// Pure dispatch pipeline: addressing, TTL, halt gate, handler lookup,
    /// failure containment. No broker I/O.
    pub async fn process(&self, task: &Task) -> Disposition {
        if !self.matcher.matches(&task.target) {
            return Disposition::Ignored;
        }

        if task.is_expired() {
            return Disposition::Done {
                result: TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Expired)
                    .with_error("Task TTL exceeded"),
                event: None,
            };
        }

        let is_resume = task.action == Command::Resume.as_str();
        if self.is_halted() && !is_resume {
            return Disposition::Done {
                result: TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Rejected)
                    .with_error("Agent is halted"),
                event: None,
            };
        }

        let started = Instant::now();

        // Custom registrations shadow built-ins, matching original
        // registration-table semantics.
        if let Some(handler) = self.handlers.get(&task.action) {
            let handler = handler.clone();
            info!(agent_id = %self.agent_id, task_id = %task.task_id, action = %task.action, "processing task");
            let mut result = match handler.handle(task).await {
                Ok(output) => TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed)
                    .with_output(output),
                Err(err) => {
                    error!(task_id = %task.task_id, action = %task.action, "handler error: {}", err);
                    TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Failed)
                        .with_error(err.to_string())
                }
            };
            result.execution_ms = started.elapsed().as_millis() as i64;
            return Disposition::Done {
                result,
                event: None,
            };
        }

        let (mut result, event) = match Command::parse(&task.action) {
            Ok(Command::Ping) => (self.builtin_ping(task), None),
            Ok(Command::Status) => (self.builtin_status(task), None),
            Ok(Command::Health) => (self.builtin_health(task).await, None),
            Ok(Command::Balance) => (self.builtin_balance(task).await, None),
            Ok(Command::Halt) => self.builtin_halt(task),
            Ok(Command::Resume) => self.builtin_resume(task),
            _ => (
                TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Rejected)
                    .with_error(format!("Unknown action: {}", task.action)),
                None,
            ),
        };
        result.execution_ms = started.elapsed().as_millis() as i64;
        Disposition::Done { result, event }
    }

    // -------- built-in handlers --------

    fn builtin_ping(&self, task: &Task) -> TaskResult {
        TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed).with_output(json!({
            "pong": true,
            "agent_id": self.agent_id,
            "ts": fleet_protocol::now_ts(),
        }))
    }

    fn builtin_status(&self, task: &Task) -> TaskResult {
        let mut status = json!({
            "agent_id": self.agent_id,
            "halted": self.is_halted(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "ts": fleet_protocol::now_ts(),
        });
        if let Some(probe) = &self.probe {
            if let (Value::Object(base), Value::Object(extras)) =
                (&mut status, probe.status_extras())
            {
                base.extend(extras);
            }
        }
        TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed).with_output(status)
    }

    async fn builtin_health(&self, task: &Task) -> TaskResult {
        let healthy = match &self.probe {
            Some(probe) => probe.healthy().await,
            None => true,
        };
        TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed).with_output(json!({
            "healthy": healthy,
            "agent_id": self.agent_id,
            "halted": self.is_halted(),
        }))
    }

    async fn builtin_balance(&self, task: &Task) -> TaskResult {
        let Some(probe) = &self.probe else {
            return TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Failed)
                .with_error("Balance not available (no resource probe configured)");
        };
        match probe.balance().await {
            Ok(output) => TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed)
                .with_output(output),
            Err(err) => TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Failed)
                .with_error(err.to_string()),
        }
    }

    fn builtin_halt(&self, task: &Task) -> (TaskResult, Option<FleetEvent>) {
        let reason = task
            .payload
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("No reason provided")
            .to_string();
        self.halted.store(true, Ordering::SeqCst);
        warn!(agent_id = %self.agent_id, sender = %task.sender, "HALTED: {}", reason);

        let result = TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed)
            .with_output(json!({ "halted": true, "reason": reason.clone() }));
        let event = FleetEvent {
            kind: "agent_halted".to_string(),
            data: json!({ "reason": reason, "sender": task.sender }),
        };
        (result, Some(event))
    }

    fn builtin_resume(&self, task: &Task) -> (TaskResult, Option<FleetEvent>) {
        let was_halted = self.halted.swap(false, Ordering::SeqCst);
        info!(agent_id = %self.agent_id, sender = %task.sender, "resumed");

        let result = TaskResult::new(&task.task_id, &self.agent_id, TaskStatus::Completed)
            .with_output(json!({ "resumed": true, "was_halted": was_halted }));
        let event = FleetEvent {
            kind: "agent_resumed".to_string(),
            data: json!({ "sender": task.sender, "was_halted": was_halted }),
        };
        (result, Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the vars are process-global and tests run in parallel.
    #[test]
    fn worker_config_reads_tuning_knobs_from_env() {
        std::env::set_var("FLEET_TASK_BATCH", "9");
        std::env::set_var("FLEET_BLOCK_MS", "750");
        std::env::set_var("FLEET_HEARTBEAT_INTERVAL", "7");

        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.task_batch, 9);
        assert_eq!(cfg.block_ms, 750);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(7));

        // Malformed values fall back to the defaults.
        std::env::set_var("FLEET_TASK_BATCH", "lots");
        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.task_batch, WorkerConfig::default().task_batch);

        std::env::remove_var("FLEET_TASK_BATCH");
        std::env::remove_var("FLEET_BLOCK_MS");
        std::env::remove_var("FLEET_HEARTBEAT_INTERVAL");
    }
}
