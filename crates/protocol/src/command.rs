//! Closed command vocabulary.
//!
//! Actions outside this set are rejected at the commander before a task is
//! ever enqueued; workers additionally reject unknown actions at dispatch.

use serde::{Deserialize, Serialize};

use crate::task::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    // Query commands (read-only)
    Ping,
    Status,
    Agents,
    Logs,
    Balance,
    Health,

    // Action commands (state-changing)
    Dispatch,
    Halt,
    Resume,
    Summarize,
    Ingest,
    Validate,

    // Domain-specific
    Buy,
    Sell,
    Rate,
}

/// Commands that require the sender to be on the privileged allow-list.
pub const PRIVILEGED_COMMANDS: &[Command] = &[Command::Halt, Command::Resume, Command::Dispatch];

/// Commands safe for any authenticated sender.
pub const PUBLIC_COMMANDS: &[Command] = &[
    Command::Ping,
    Command::Status,
    Command::Agents,
    Command::Health,
    Command::Balance,
];

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Status => "status",
            Command::Agents => "agents",
            Command::Logs => "logs",
            Command::Balance => "balance",
            Command::Health => "health",
            Command::Dispatch => "dispatch",
            Command::Halt => "halt",
            Command::Resume => "resume",
            Command::Summarize => "summarize",
            Command::Ingest => "ingest",
            Command::Validate => "validate",
            Command::Buy => "buy",
            Command::Sell => "sell",
            Command::Rate => "rate",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "ping" => Ok(Command::Ping),
            "status" => Ok(Command::Status),
            "agents" => Ok(Command::Agents),
            "logs" => Ok(Command::Logs),
            "balance" => Ok(Command::Balance),
            "health" => Ok(Command::Health),
            "dispatch" => Ok(Command::Dispatch),
            "halt" => Ok(Command::Halt),
            "resume" => Ok(Command::Resume),
            "summarize" => Ok(Command::Summarize),
            "ingest" => Ok(Command::Ingest),
            "validate" => Ok(Command::Validate),
            "buy" => Ok(Command::Buy),
            "sell" => Ok(Command::Sell),
            "rate" => Ok(Command::Rate),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn is_privileged(&self) -> bool {
        PRIVILEGED_COMMANDS.contains(self)
    }
}
