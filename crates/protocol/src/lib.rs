// # -----------------------------
// # crates/protocol/src/lib.rs
// # -----------------------------
//! Fleet control protocol.
//!
//! Message shapes, command vocabulary, and security primitives shared by the
//! commander bridge and every worker process. The broker carries flat
//! string-keyed records; everything here encodes to and decodes from that
//! shape, and nothing here touches the network.

pub mod auth;
pub mod command;
pub mod target;
pub mod task;

pub use auth::{format_signed, sign, split_signed, verify, RateLimiter, SIG_MARKER};
pub use command::{Command, PRIVILEGED_COMMANDS, PUBLIC_COMMANDS};
pub use target::TargetMatcher;
pub use task::{make_nonce, make_task_id, now_ts, ProtocolError, Record, Task, TaskResult, TaskStatus};

// Well-known broker names shared by the whole fleet. Workers and the
// commander must agree on these or tasks are silently never consumed.
pub const STREAM_TASKS: &str = "fleet:tasks";
pub const STREAM_RESULTS: &str = "fleet:results";
pub const STREAM_EVENTS: &str = "fleet:events";
pub const CONSUMER_GROUP: &str = "fleet:workers";
pub const HEARTBEAT_PREFIX: &str = "fleet:agent:hb:";
pub const HEARTBEAT_TTL_SECS: usize = 120;

// Every worker is implicitly a member of this group.
pub const FLEET_GROUP: &str = "fleet";

pub const CHANNEL_COMMANDS: &str = "#fleet-ops";
pub const CHANNEL_ALERTS: &str = "#fleet-alerts";
pub const CHANNEL_LOGS: &str = "#fleet-logs";
