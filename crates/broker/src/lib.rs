// # -----------------------------
// # crates/broker/src/lib.rs
// # -----------------------------
//! Redis Streams broker client.
//!
//! Three append-only streams (tasks, results, events), a shared consumer
//! group over the task stream for acknowledgable at-least-once delivery, and
//! TTL-keyed presence records per agent. Connections are multiplexed and
//! cheap to clone, so each loop in a process can hold its own handle.

use std::collections::BTreeMap;

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use thiserror::Error;
use tracing::debug;

use fleet_protocol::{
    now_ts, Record, Task, TaskResult, CONSUMER_GROUP, HEARTBEAT_PREFIX, HEARTBEAT_TTL_SECS,
    STREAM_EVENTS, STREAM_RESULTS, STREAM_TASKS,
};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("non-string field {field} in stream entry {entry}")]
    BadEntry { entry: String, field: String },
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub task_stream: String,
    pub result_stream: String,
    pub event_stream: String,
    pub group: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            task_stream: STREAM_TASKS.to_string(),
            result_stream: STREAM_RESULTS.to_string(),
            event_stream: STREAM_EVENTS.to_string(),
            group: CONSUMER_GROUP.to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }
}

/// One stream entry: broker-assigned id plus the flat record.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub record: Record,
}

/// A single agent's presence record.
#[derive(Debug, Clone)]
pub struct AgentPresence {
    pub agent_id: String,
    pub last_seen: i64,
}

impl AgentPresence {
    pub fn age_secs(&self) -> i64 {
        now_ts() - self.last_seen
    }
}

#[derive(Clone)]
pub struct Broker {
    conn: MultiplexedConnection,
    cfg: BrokerConfig,
}

impl Broker {
    /// Open a connection and validate it with a PING.
    pub async fn connect(cfg: BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        debug!(url = %cfg.url, "broker connected");
        Ok(Self { conn, cfg })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    // -------- stream appends --------

    pub async fn append_task(&self, task: &Task) -> Result<String> {
        let id = self.xadd(&self.cfg.task_stream, task.to_record()).await?;
        debug!(task_id = %task.task_id, action = %task.action, target = %task.target, "task enqueued");
        Ok(id)
    }

    pub async fn append_result(&self, result: &TaskResult) -> Result<String> {
        self.xadd(&self.cfg.result_stream, result.to_record()).await
    }

    /// Free-form fleet event (halt/resume notices and the like).
    pub async fn append_event(
        &self,
        agent_id: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<String> {
        let mut rec = Record::new();
        rec.insert("agent_id".into(), agent_id.to_string());
        rec.insert("event_type".into(), kind.to_string());
        rec.insert("data".into(), data.to_string());
        rec.insert("ts".into(), now_ts().to_string());
        self.xadd(&self.cfg.event_stream, rec).await
    }

    async fn xadd(&self, stream: &str, rec: Record) -> Result<String> {
        let items: Vec<(String, String)> = rec.into_iter().collect();
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &items).await?;
        Ok(id)
    }

    // -------- consumer-group delivery --------

    /// Create the task-stream consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.cfg.task_stream, &self.cfg.group, "0")
            .await;
        match created {
            Ok(_) => Ok(()),
            // Group already exists; another worker got there first.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Block up to `block_ms` for new task entries assigned to `consumer`.
    pub async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<Entry>> {
        let opts = StreamReadOptions::default()
            .group(&self.cfg.group, consumer)
            .count(count)
            .block(block_ms);
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.cfg.task_stream], &[">"], &opts)
            .await?;
        flatten_reply(reply)
    }

    /// Acknowledge one delivered task entry.
    pub async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.cfg.task_stream, &self.cfg.group, &[entry_id])
            .await?;
        Ok(())
    }

    // -------- result tailing --------

    /// Read result entries appended after `last_id` (`"$"` to start at now).
    /// Returns the entries and the id to resume from.
    pub async fn tail_results(
        &self,
        last_id: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<(Vec<Entry>, String)> {
        let opts = StreamReadOptions::default().count(count).block(block_ms);
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.cfg.result_stream], &[last_id], &opts)
            .await?;
        let entries = flatten_reply(reply)?;
        let next = entries
            .last()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| last_id.to_string());
        Ok((entries, next))
    }

    // -------- presence --------

    /// Write/refresh this agent's liveness record.
    pub async fn publish_heartbeat(&self, agent_id: &str, ttl_secs: usize) -> Result<()> {
        let key = format!("{}{}", HEARTBEAT_PREFIX, agent_id);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, now_ts().to_string(), ttl_secs as u64)
            .await?;
        Ok(())
    }

    pub async fn default_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.publish_heartbeat(agent_id, HEARTBEAT_TTL_SECS).await
    }

    /// Agents whose presence key has not yet expired, with last-seen stamps.
    pub async fn online_agents(&self) -> Result<Vec<AgentPresence>> {
        let pattern = format!("{}*", HEARTBEAT_PREFIX);
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut agents = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            let last_seen = raw.and_then(|v| v.parse().ok()).unwrap_or(0);
            let agent_id = key
                .strip_prefix(HEARTBEAT_PREFIX)
                .unwrap_or(&key)
                .to_string();
            agents.push(AgentPresence { agent_id, last_seen });
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }
}

fn flatten_reply(reply: Option<StreamReadReply>) -> Result<Vec<Entry>> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for key in reply.keys {
        for sid in key.ids {
            let mut record = BTreeMap::new();
            for (field, value) in sid.map {
                let text: String =
                    redis::from_redis_value(&value).map_err(|_| BrokerError::BadEntry {
                        entry: sid.id.clone(),
                        field: field.clone(),
                    })?;
                record.insert(field, text);
            }
            entries.push(Entry {
                id: sid.id,
                record,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::TaskStatus;

    fn test_broker_url() -> String {
        std::env::var("FLEET_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
    }

    #[test]
    fn default_config_uses_well_known_names() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.task_stream, "fleet:tasks");
        assert_eq!(cfg.result_stream, "fleet:results");
        assert_eq!(cfg.event_stream, "fleet:events");
        assert_eq!(cfg.group, "fleet:workers");
    }

    #[tokio::test]
    #[ignore] // requires a running redis instance
    async fn task_append_and_group_read_round_trip() -> std::result::Result<(), BrokerError> {
        let mut cfg = BrokerConfig::with_url(&test_broker_url());
        cfg.task_stream = format!("fleet:test:tasks:{}", fleet_protocol::make_nonce());
        cfg.group = "fleet:test:workers".to_string();
        let broker = Broker::connect(cfg).await?;
        broker.ensure_group().await?;

        let task = Task::ping("agent:all", "itest");
        broker.append_task(&task).await?;

        let entries = broker.read_group("itest-consumer", 5, 500).await?;
        assert_eq!(entries.len(), 1);
        let decoded = Task::from_record(&entries[0].record).unwrap();
        assert_eq!(decoded.task_id, task.task_id);
        broker.ack(&entries[0].id).await?;
        Ok(())
    }

    #[tokio::test]
    #[ignore] // requires a running redis instance
    async fn results_tail_from_now() -> std::result::Result<(), BrokerError> {
        let mut cfg = BrokerConfig::with_url(&test_broker_url());
        cfg.result_stream = format!("fleet:test:results:{}", fleet_protocol::make_nonce());
        let broker = Broker::connect(cfg).await?;

        let result = TaskResult::new("task-x", "agent-y", TaskStatus::Completed);
        broker.append_result(&result).await?;

        let (entries, next) = broker.tail_results("0", 10, 100).await?;
        assert_eq!(entries.len(), 1);
        assert_ne!(next, "0");
        Ok(())
    }
}
