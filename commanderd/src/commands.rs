//! Signed-command gate.
//!
//! Pure translation from a chat line to an outcome: a set of reply lines, a
//! presence query, or a task to enqueue. Every rejection is a single
//! specific reply; nothing state-changing happens before signature,
//! allow-list, and vocabulary checks all pass.

use std::collections::HashSet;

use serde_json::Value;

use fleet_protocol::{split_signed, verify, Command, RateLimiter, Task};

pub const COMMAND_PREFIX: char = '!';

#[derive(Debug)]
pub enum Outcome {
    /// Not a command line at all.
    Ignore,
    /// Reply these lines to the originating channel and stop.
    Replies(Vec<String>),
    /// Answer with the presence list (read-only, unsigned).
    ListAgents,
    /// Append the task to the broker, then send the acknowledgement line.
    Enqueue { task: Task, ack: String },
}

fn replies(line: String) -> Outcome {
    Outcome::Replies(vec![line])
}

pub struct CommandGate {
    secret: String,
    allowed_users: HashSet<String>,
    privileged_users: HashSet<String>,
    limiter: RateLimiter,
}

impl CommandGate {
    pub fn new(
        secret: String,
        allowed_users: HashSet<String>,
        privileged_users: HashSet<String>,
        rate_limit_requests: usize,
        rate_limit_window_secs: i64,
    ) -> Self {
        Self {
            secret,
            allowed_users,
            privileged_users,
            limiter: RateLimiter::new(rate_limit_requests, rate_limit_window_secs),
        }
    }

    fn is_privileged_sender(&self, nick: &str) -> bool {
        // Empty list is the permissive default: any signed sender.
        self.privileged_users.is_empty() || self.privileged_users.contains(nick)
    }

    pub fn evaluate(&mut self, nick: &str, text: &str) -> Outcome {
        let text = text.trim();
        if !text.starts_with(COMMAND_PREFIX) {
            return Outcome::Ignore;
        }

        if !self.limiter.check(nick) {
            return replies(format!("{}: Rate limit exceeded. Try again later.", nick));
        }

        // Unsigned read-only commands.
        if text == "!help" || text.starts_with("!help ") {
            return Outcome::Replies(help_lines(nick));
        }
        if text == "!agents" || text.starts_with("!agents ") {
            return Outcome::ListAgents;
        }

        // Everything else requires a signature.
        let (raw, sig) = match split_signed(text) {
            Ok(parts) => parts,
            Err(err) => return replies(format!("{}: {}", nick, err)),
        };
        if !verify(&self.secret, raw, sig) {
            return replies(format!("{}: Invalid signature", nick));
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(nick) {
            return replies(format!("{}: Not authorized", nick));
        }

        let parts: Vec<&str> = raw.splitn(4, char::is_whitespace).collect();
        match parts[0] {
            "!ping" => self.simple_query(nick, &parts, Command::Ping),
            "!status" => self.simple_query(nick, &parts, Command::Status),
            "!health" => self.simple_query(nick, &parts, Command::Health),
            "!balance" => self.simple_query(nick, &parts, Command::Balance),
            "!halt" => self.halt(nick, &parts),
            "!resume" => self.resume(nick, &parts),
            "!dispatch" => self.dispatch(nick, &parts),
            _ => replies(format!("{}: Unknown command. Try !help", nick)),
        }
    }

    fn simple_query(&self, nick: &str, parts: &[&str], command: Command) -> Outcome {
        let Some(target) = parts.get(1) else {
            return replies(format!(
                "{}: Usage: {}{} <target> |sig=...",
                nick,
                COMMAND_PREFIX,
                command.as_str()
            ));
        };
        let task = Task::new(
            command.as_str(),
            target,
            command.as_str(),
            Value::Object(Default::default()),
            nick,
        )
        .with_ttl(30);
        let ack = format!(
            "{}: {} sent to {} id={}",
            nick,
            command.as_str(),
            target,
            task.task_id
        );
        Outcome::Enqueue { task, ack }
    }

    fn halt(&self, nick: &str, parts: &[&str]) -> Outcome {
        if !self.is_privileged_sender(nick) {
            return replies(format!("{}: HALT requires elevated access", nick));
        }
        let Some(target) = parts.get(1) else {
            return replies(format!("{}: Usage: !halt <target> [reason] |sig=...", nick));
        };
        let reason = if parts.len() > 2 {
            parts[2..].join(" ")
        } else {
            format!("Halted by {}", nick)
        };
        let task = Task::halt(target, nick, &reason);
        let ack = format!("{}: HALT sent to {} id={}", nick, target, task.task_id);
        Outcome::Enqueue { task, ack }
    }

    fn resume(&self, nick: &str, parts: &[&str]) -> Outcome {
        if !self.is_privileged_sender(nick) {
            return replies(format!("{}: RESUME requires elevated access", nick));
        }
        let Some(target) = parts.get(1) else {
            return replies(format!("{}: Usage: !resume <target> |sig=...", nick));
        };
        let task = Task::new(
            "resume",
            target,
            Command::Resume.as_str(),
            Value::Object(Default::default()),
            nick,
        )
        .with_priority(2);
        let ack = format!("{}: RESUME sent to {} id={}", nick, target, task.task_id);
        Outcome::Enqueue { task, ack }
    }

    fn dispatch(&self, nick: &str, parts: &[&str]) -> Outcome {
        if parts.len() < 4 {
            return replies(format!(
                "{}: Usage: !dispatch <target> <action> <json> |sig=...",
                nick
            ));
        }
        let (target, action_raw, payload_raw) = (parts[1], parts[2], parts[3]);

        let action = match Command::parse(action_raw) {
            Ok(action) => action,
            Err(_) => return replies(format!("{}: Action not allowed: {}", nick, action_raw)),
        };
        if action.is_privileged() && !self.is_privileged_sender(nick) {
            return replies(format!(
                "{}: Privileged action requires elevated access",
                nick
            ));
        }

        let payload: Value = match serde_json::from_str(payload_raw) {
            Ok(value) => value,
            Err(err) => return replies(format!("{}: Invalid JSON: {}", nick, err)),
        };

        let ttl = payload
            .get("ttl_secs")
            .and_then(Value::as_i64)
            .unwrap_or(60);
        let priority = payload
            .get("priority")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let task = Task::new("dispatch", target, action.as_str(), payload, nick)
            .with_ttl(ttl)
            .with_priority(priority);
        let ack = format!(
            "{}: Dispatched {} to {} id={}",
            nick,
            action.as_str(),
            target,
            task.task_id
        );
        Outcome::Enqueue { task, ack }
    }
}

fn help_lines(nick: &str) -> Vec<String> {
    vec![
        format!("{}: Fleet control commands (append |sig=<hmac> where noted):", nick),
        "  !agents - List online agents (no sig required)".to_string(),
        "  !ping <target> |sig=... - Ping agent(s)".to_string(),
        "  !status <target> |sig=... - Get status".to_string(),
        "  !health <target> |sig=... - Health check".to_string(),
        "  !balance <target> |sig=... - Check balance".to_string(),
        "  !dispatch <target> <action> <json> |sig=... - Send command".to_string(),
        "  !halt <target> [reason] |sig=... - Halt agent(s)".to_string(),
        "  !resume <target> |sig=... - Resume agent(s)".to_string(),
        "Targets: agent:<id>, agent:all, fleet:all, role:<role>, group:<group>".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::format_signed;

    fn gate(privileged: &[&str]) -> CommandGate {
        CommandGate::new(
            "test-secret".to_string(),
            HashSet::new(),
            privileged.iter().map(|s| s.to_string()).collect(),
            10,
            60,
        )
    }

    fn signed(raw: &str) -> String {
        format_signed(raw, "test-secret")
    }

    #[test]
    fn non_command_lines_are_ignored() {
        let mut g = gate(&[]);
        assert!(matches!(g.evaluate("alice", "hello there"), Outcome::Ignore));
        assert!(matches!(g.evaluate("alice", ""), Outcome::Ignore));
    }

    #[test]
    fn unsigned_ping_is_a_parse_failure_not_verification() {
        let mut g = gate(&[]);
        match g.evaluate("alice", "!ping agent:all") {
            Outcome::Replies(lines) => {
                assert!(lines[0].contains("missing signature"), "{:?}", lines)
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut g = gate(&[]);
        match g.evaluate("alice", "!ping agent:all |sig=deadbeef") {
            Outcome::Replies(lines) => assert!(lines[0].contains("Invalid signature")),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn valid_ping_enqueues_task() {
        let mut g = gate(&[]);
        match g.evaluate("alice", &signed("!ping agent:worker-1")) {
            Outcome::Enqueue { task, ack } => {
                assert_eq!(task.action, "ping");
                assert_eq!(task.target, "agent:worker-1");
                assert_eq!(task.sender, "alice");
                assert!(ack.contains(&task.task_id));
            }
            other => panic!("expected enqueue, got {:?}", other),
        }
    }

    #[test]
    fn allow_list_gates_signed_senders() {
        let mut g = CommandGate::new(
            "test-secret".to_string(),
            ["alice".to_string()].into_iter().collect(),
            HashSet::new(),
            10,
            60,
        );
        match g.evaluate("mallory", &signed("!ping agent:all")) {
            Outcome::Replies(lines) => assert!(lines[0].contains("Not authorized")),
            other => panic!("expected reply, got {:?}", other),
        }
        assert!(matches!(
            g.evaluate("alice", &signed("!ping agent:all")),
            Outcome::Enqueue { .. }
        ));
    }

    #[test]
    fn halt_requires_privilege_when_list_set() {
        let mut g = gate(&["root"]);
        match g.evaluate("alice", &signed("!halt agent:all")) {
            Outcome::Replies(lines) => {
                assert!(lines[0].contains("elevated access"));
                assert_eq!(lines.len(), 1);
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        match g.evaluate("root", &signed("!halt agent:all fire drill")) {
            Outcome::Enqueue { task, .. } => {
                assert_eq!(task.action, "halt");
                assert_eq!(task.priority, 2);
                assert_eq!(task.payload["reason"], serde_json::json!("fire drill"));
            }
            other => panic!("expected enqueue, got {:?}", other),
        }
    }

    #[test]
    fn dispatch_validates_action_and_payload() {
        let mut g = gate(&[]);
        match g.evaluate("alice", &signed("!dispatch agent:all format_disk {}")) {
            Outcome::Replies(lines) => assert!(lines[0].contains("Action not allowed")),
            other => panic!("expected reply, got {:?}", other),
        }

        match g.evaluate("alice", &signed("!dispatch agent:all summarize {not-json")) {
            Outcome::Replies(lines) => assert!(lines[0].contains("Invalid JSON")),
            other => panic!("expected reply, got {:?}", other),
        }

        match g.evaluate(
            "alice",
            &signed("!dispatch agent:all summarize {\"n\": 3, \"ttl_secs\": 120}"),
        ) {
            Outcome::Enqueue { task, .. } => {
                assert_eq!(task.action, "summarize");
                assert_eq!(task.ttl_secs, 120);
                assert_eq!(task.payload["n"], serde_json::json!(3));
            }
            other => panic!("expected enqueue, got {:?}", other),
        }
    }

    #[test]
    fn dispatch_of_privileged_action_checks_tier() {
        let mut g = gate(&["root"]);
        match g.evaluate("alice", &signed("!dispatch agent:all halt {}")) {
            Outcome::Replies(lines) => assert!(lines[0].contains("elevated access")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn agents_and_help_need_no_signature() {
        let mut g = gate(&[]);
        assert!(matches!(g.evaluate("alice", "!agents"), Outcome::ListAgents));
        match g.evaluate("alice", "!help") {
            Outcome::Replies(lines) => assert!(lines.len() > 3),
            other => panic!("expected help, got {:?}", other),
        }
    }

    #[test]
    fn rate_limit_applies_per_sender() {
        let mut g = CommandGate::new("s".to_string(), HashSet::new(), HashSet::new(), 2, 60);
        assert!(matches!(g.evaluate("alice", "!agents"), Outcome::ListAgents));
        assert!(matches!(g.evaluate("alice", "!agents"), Outcome::ListAgents));
        match g.evaluate("alice", "!agents") {
            Outcome::Replies(lines) => assert!(lines[0].contains("Rate limit")),
            other => panic!("expected rate-limit reply, got {:?}", other),
        }
        // Other senders unaffected.
        assert!(matches!(g.evaluate("bob", "!agents"), Outcome::ListAgents));
    }

    #[tokio::test]
    async fn signed_ping_flows_through_worker_to_chat_line() {
        use fleet_worker::{Disposition, Worker, WorkerConfig};

        let mut g = gate(&[]);
        let task = match g.evaluate("alice", &signed("!ping agent:worker-1")) {
            Outcome::Enqueue { task, .. } => task,
            other => panic!("expected enqueue, got {:?}", other),
        };

        let w = Worker::new("worker-1", vec![], vec![], WorkerConfig::default());
        let result = match w.process(&task).await {
            Disposition::Done { result, .. } => result,
            other => panic!("expected a result, got {:?}", other),
        };

        let line = result.to_chat_line(400);
        assert!(line.starts_with("[OK]"));
        assert!(line.contains("agent=worker-1"));
        assert!(line.contains("pong"));
        assert!(line.contains(&task.task_id));
    }

    #[tokio::test]
    async fn halt_then_query_relays_rejected_line() {
        use fleet_worker::{Disposition, Worker, WorkerConfig};

        let mut g = gate(&["root"]);
        let halt = match g.evaluate("root", &signed("!halt agent:worker-1 drill")) {
            Outcome::Enqueue { task, .. } => task,
            other => panic!("expected enqueue, got {:?}", other),
        };

        let w = Worker::new("worker-1", vec![], vec![], WorkerConfig::default());
        match w.process(&halt).await {
            Disposition::Done { .. } => {}
            other => panic!("expected a result, got {:?}", other),
        }
        assert!(w.is_halted());

        let ping = match g.evaluate("root", &signed("!ping agent:worker-1")) {
            Outcome::Enqueue { task, .. } => task,
            other => panic!("expected enqueue, got {:?}", other),
        };
        let result = match w.process(&ping).await {
            Disposition::Done { result, .. } => result,
            other => panic!("expected a result, got {:?}", other),
        };

        let line = result.to_chat_line(400);
        assert!(line.contains("[REJECTED]"));
        assert!(line.contains("halted"));
    }

    #[test]
    fn unknown_signed_command_gets_help_pointer() {
        let mut g = gate(&[]);
        match g.evaluate("alice", &signed("!teleport agent:all")) {
            Outcome::Replies(lines) => assert!(lines[0].contains("Unknown command")),
            other => panic!("expected reply, got {:?}", other),
        }
    }
}
