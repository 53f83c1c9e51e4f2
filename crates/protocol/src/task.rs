//! Task and TaskResult records.
//!
//! A `Task` is immutable once created; its lifecycle lives entirely in the
//! broker (delivery state) and in the `TaskResult`s derived from it. Both
//! types encode to the broker's native record shape, a flat map of string
//! keys to string values, with structured payloads carried as JSON text.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::Command;

/// Flat record shape used on the broker.
pub type Record = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("malformed JSON in field {field}: {source}")]
    BadJson {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("missing signature marker (|sig=)")]
    MissingSignature,
    #[error("unknown task status: {0}")]
    UnknownStatus(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Generate a unique task id: `<prefix>-<unix_ts>-<8 hex chars>`.
pub fn make_task_id(prefix: &str) -> String {
    let rand: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", prefix, now_ts(), rand)
}

/// Random nonce carried on each task for future replay protection.
pub fn make_nonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "expired" => Ok(TaskStatus::Expired),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }
}

/// A command addressed to one or more workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub target: String,
    pub action: String,
    pub payload: Value,
    pub sender: String,
    pub ttl_secs: i64,
    pub priority: i64,
    pub created_at: i64,
    pub nonce: String,
}

impl Task {
    pub fn new(prefix: &str, target: &str, action: &str, payload: Value, sender: &str) -> Self {
        Self {
            task_id: make_task_id(prefix),
            target: target.to_string(),
            action: action.to_string(),
            payload,
            sender: sender.to_string(),
            ttl_secs: 60,
            priority: 1,
            created_at: now_ts(),
            nonce: make_nonce(),
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ts())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now - self.created_at > self.ttl_secs
    }

    pub fn to_record(&self) -> Record {
        let mut rec = Record::new();
        rec.insert("task_id".into(), self.task_id.clone());
        rec.insert("target".into(), self.target.clone());
        rec.insert("action".into(), self.action.clone());
        rec.insert("payload".into(), self.payload.to_string());
        rec.insert("sender".into(), self.sender.clone());
        rec.insert("ttl_secs".into(), self.ttl_secs.to_string());
        rec.insert("priority".into(), self.priority.to_string());
        rec.insert("created_at".into(), self.created_at.to_string());
        rec.insert("nonce".into(), self.nonce.clone());
        rec
    }

    pub fn from_record(rec: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            task_id: required(rec, "task_id")?.to_string(),
            target: required(rec, "target")?.to_string(),
            action: required(rec, "action")?.to_string(),
            payload: parse_json(required(rec, "payload")?, "payload")?,
            sender: rec.get("sender").cloned().unwrap_or_default(),
            ttl_secs: parse_int(required(rec, "ttl_secs")?, "ttl_secs")?,
            priority: match rec.get("priority") {
                Some(raw) => parse_int(raw, "priority")?,
                None => 1,
            },
            created_at: parse_int(required(rec, "created_at")?, "created_at")?,
            nonce: rec.get("nonce").cloned().unwrap_or_default(),
        })
    }

    /// Ping task with a short TTL.
    pub fn ping(target: &str, sender: &str) -> Self {
        Self::new("ping", target, Command::Ping.as_str(), Value::Object(Default::default()), sender)
            .with_ttl(30)
    }

    /// Status query task.
    pub fn status(target: &str, sender: &str) -> Self {
        Self::new(
            "status",
            target,
            Command::Status.as_str(),
            Value::Object(Default::default()),
            sender,
        )
        .with_ttl(30)
    }

    /// High-priority halt task.
    pub fn halt(target: &str, sender: &str, reason: &str) -> Self {
        Self::new(
            "halt",
            target,
            Command::Halt.as_str(),
            serde_json::json!({ "reason": reason }),
            sender,
        )
        .with_priority(2)
    }
}

/// The outcome of one worker's attempt at a task.
///
/// Results form a stream keyed by `task_id`, not a 1:1 mapping; more than
/// one worker may have processed the same task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub output: Value,
    pub error: Option<String>,
    pub execution_ms: i64,
    pub ts: i64,
}

impl TaskResult {
    pub fn new(task_id: &str, agent_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            status,
            output: Value::Object(Default::default()),
            error: None,
            execution_ms: 0,
            ts: now_ts(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_record(&self) -> Record {
        let mut rec = Record::new();
        rec.insert("task_id".into(), self.task_id.clone());
        rec.insert("agent_id".into(), self.agent_id.clone());
        rec.insert("status".into(), self.status.as_str().to_string());
        rec.insert("output".into(), self.output.to_string());
        rec.insert("error".into(), self.error.clone().unwrap_or_default());
        rec.insert("execution_ms".into(), self.execution_ms.to_string());
        rec.insert("ts".into(), self.ts.to_string());
        rec
    }

    pub fn from_record(rec: &Record) -> Result<Self, ProtocolError> {
        let error = rec.get("error").cloned().unwrap_or_default();
        Ok(Self {
            task_id: required(rec, "task_id")?.to_string(),
            agent_id: required(rec, "agent_id")?.to_string(),
            status: TaskStatus::parse(required(rec, "status")?)?,
            output: match rec.get("output") {
                Some(raw) => parse_json(raw, "output")?,
                None => Value::Object(Default::default()),
            },
            error: if error.is_empty() { None } else { Some(error) },
            execution_ms: match rec.get("execution_ms") {
                Some(raw) => parse_int(raw, "execution_ms")?,
                None => 0,
            },
            ts: match rec.get("ts") {
                Some(raw) => parse_int(raw, "ts")?,
                None => 0,
            },
        })
    }

    /// Single bounded chat line for relaying this result back to humans.
    pub fn to_chat_line(&self, max_len: usize) -> String {
        let tag = match self.status {
            TaskStatus::Completed => "[OK]",
            TaskStatus::Failed => "[FAIL]",
            TaskStatus::Expired => "[EXPIRED]",
            TaskStatus::Rejected => "[REJECTED]",
            _ => "[?]",
        };

        let mut output = self.output.to_string();
        if output.len() > 200 {
            truncate_at_boundary(&mut output, 197);
            output.push_str("...");
        }

        let mut line = format!("{} {} agent={} ", tag, self.task_id, self.agent_id);
        match &self.error {
            Some(err) => line.push_str(&format!("error={}", err)),
            None => line.push_str(&format!("output={}", output)),
        }
        if self.execution_ms > 0 {
            line.push_str(&format!(" ({}ms)", self.execution_ms));
        }

        truncate_at_boundary(&mut line, max_len);
        line
    }
}

/// Byte-bounded truncation that never splits a UTF-8 character. Output and
/// error text are arbitrary; a raw `String::truncate` would panic mid-char.
fn truncate_at_boundary(s: &mut String, mut cut: usize) {
    if s.len() <= cut {
        return;
    }
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn required<'a>(rec: &'a Record, field: &'static str) -> Result<&'a String, ProtocolError> {
    rec.get(field).ok_or(ProtocolError::MissingField(field))
}

fn parse_int(raw: &str, field: &'static str) -> Result<i64, ProtocolError> {
    raw.parse().map_err(|_| ProtocolError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn parse_json(raw: &str, field: &'static str) -> Result<Value, ProtocolError> {
    serde_json::from_str(raw).map_err(|source| ProtocolError::BadJson { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_record_round_trip() {
        let task = Task::new(
            "dispatch",
            "agent:worker-1",
            "summarize",
            serde_json::json!({"stream": "abc", "n": 3}),
            "operator",
        )
        .with_ttl(45)
        .with_priority(2);

        let decoded = Task::from_record(&task.to_record()).unwrap();
        assert_eq!(decoded.task_id, task.task_id);
        assert_eq!(decoded.target, task.target);
        assert_eq!(decoded.action, task.action);
        assert_eq!(decoded.payload, task.payload);
        assert_eq!(decoded.sender, task.sender);
        assert_eq!(decoded.ttl_secs, 45);
        assert_eq!(decoded.priority, 2);
        assert_eq!(decoded.created_at, task.created_at);
        assert_eq!(decoded.nonce, task.nonce);
    }

    #[test]
    fn task_decode_rejects_missing_fields() {
        let mut rec = Task::ping("agent:all", "op").to_record();
        rec.remove("task_id");
        assert!(matches!(
            Task::from_record(&rec),
            Err(ProtocolError::MissingField("task_id"))
        ));

        let mut rec = Task::ping("agent:all", "op").to_record();
        rec.remove("created_at");
        assert!(Task::from_record(&rec).is_err());
    }

    #[test]
    fn task_decode_applies_documented_defaults_only() {
        let mut rec = Task::ping("agent:all", "op").to_record();
        rec.remove("priority");
        rec.remove("sender");
        let task = Task::from_record(&rec).unwrap();
        assert_eq!(task.priority, 1);
        assert_eq!(task.sender, "");
    }

    #[test]
    fn task_decode_rejects_malformed_payload() {
        let mut rec = Task::ping("agent:all", "op").to_record();
        rec.insert("payload".into(), "{not json".into());
        assert!(matches!(
            Task::from_record(&rec),
            Err(ProtocolError::BadJson { field: "payload", .. })
        ));
    }

    #[test]
    fn task_expiry_is_relative_to_creation() {
        let mut task = Task::ping("agent:all", "op").with_ttl(5);
        task.created_at = now_ts() - 10;
        assert!(task.is_expired());

        let fresh = Task::ping("agent:all", "op").with_ttl(5);
        assert!(!fresh.is_expired());
    }

    #[test]
    fn result_record_round_trip() {
        let result = TaskResult::new("task-1-aa", "worker-1", TaskStatus::Failed)
            .with_output(serde_json::json!({"partial": true}))
            .with_error("boom");
        let decoded = TaskResult::from_record(&result.to_record()).unwrap();
        assert_eq!(decoded.task_id, result.task_id);
        assert_eq!(decoded.status, TaskStatus::Failed);
        assert_eq!(decoded.output, result.output);
        assert_eq!(decoded.error.as_deref(), Some("boom"));
    }

    #[test]
    fn result_decode_requires_status() {
        let mut rec = TaskResult::new("t", "a", TaskStatus::Completed).to_record();
        rec.insert("status".into(), "exploded".into());
        assert!(matches!(
            TaskResult::from_record(&rec),
            Err(ProtocolError::UnknownStatus(_))
        ));
    }

    #[test]
    fn chat_line_truncates_long_output() {
        let big = serde_json::json!({"data": "x".repeat(500)});
        let result =
            TaskResult::new("task-9", "worker-2", TaskStatus::Completed).with_output(big);
        let line = result.to_chat_line(400);
        assert!(line.len() <= 400);
        assert!(line.starts_with("[OK] task-9 agent=worker-2"));
        assert!(line.contains("..."));
    }

    #[test]
    fn chat_line_output_cut_lands_on_char_boundary() {
        // The 197-byte output cut falls inside a 2-byte character here.
        let big = serde_json::json!({"data": format!("x{}", "é".repeat(200))});
        let result =
            TaskResult::new("task-u", "worker-1", TaskStatus::Completed).with_output(big);
        let line = result.to_chat_line(400);
        assert!(line.len() <= 400);
        assert!(line.contains("..."));
    }

    #[test]
    fn chat_line_length_cut_lands_on_char_boundary() {
        // max_len lands inside the first character of the error text.
        let result = TaskResult::new("t", "w", TaskStatus::Rejected).with_error("é".repeat(9));
        let line = result.to_chat_line(28);
        assert!(line.len() <= 28);
        assert!(line.starts_with("[REJECTED] t agent=w"));
    }

    #[test]
    fn chat_line_prefers_error_over_output() {
        let result = TaskResult::new("task-3", "w", TaskStatus::Rejected).with_error("halted");
        let line = result.to_chat_line(400);
        assert!(line.contains("[REJECTED]"));
        assert!(line.contains("error=halted"));
        assert!(!line.contains("output="));
    }

    #[test]
    fn task_ids_are_unique() {
        let a = make_task_id("ping");
        let b = make_task_id("ping");
        assert_ne!(a, b);
        assert!(a.starts_with("ping-"));
    }
}
