//! Committed log entry types.
//!
//! Entries arrive from the replication layer in committed order and are
//! the only input that mutates replicated state. Each entry is applied at
//! its log index; timestamps inside entries are the sole clock for session
//! expiration.

use crate::core::time::LogTime;
use crate::rpc::Member;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Log entry types understood by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    /// Create a new session.
    Register(RegisterEntry),

    /// Refresh a session's liveness.
    KeepAlive(KeepAliveEntry),

    /// A state-mutating, exactly-once operation.
    Command(CommandEntry),

    /// A read-only operation with a staleness bound. Queries usually
    /// bypass the log but share the entry shape.
    Query(QueryEntry),

    /// Advance the applied index without side effects.
    NoOp(NoOpEntry),
}

/// Session registration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub timestamp: LogTime,
    /// Descriptor of the registering client endpoint, if known.
    pub member: Option<Member>,
}

/// Session keep-alive entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    pub session_id: u64,
    pub timestamp: LogTime,
}

/// Command entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEntry {
    pub session_id: u64,
    /// Client-assigned monotonic request number, the dedup key.
    pub request_no: u64,
    /// Highest request number the client has seen a response for; cached
    /// responses at or below it are dropped.
    pub response_ack: u64,
    pub timestamp: LogTime,
    pub payload: Bytes,
}

/// Query entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEntry {
    pub session_id: u64,
    /// Do not answer from state earlier than this applied index.
    pub version: u64,
    pub timestamp: LogTime,
    pub payload: Bytes,
}

/// No-op entry, used to advance the applied index so queries can be
/// answered linearizably without side effects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoOpEntry {}

impl LogEntry {
    /// Short tag for logging and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            LogEntry::Register(_) => "register",
            LogEntry::KeepAlive(_) => "keep-alive",
            LogEntry::Command(_) => "command",
            LogEntry::Query(_) => "query",
            LogEntry::NoOp(_) => "no-op",
        }
    }

    /// The session this entry is addressed to, if any.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            LogEntry::KeepAlive(e) => Some(e.session_id),
            LogEntry::Command(e) => Some(e.session_id),
            LogEntry::Query(e) => Some(e.session_id),
            LogEntry::Register(_) | LogEntry::NoOp(_) => None,
        }
    }

    /// The log-derived timestamp this entry carries, if any.
    pub fn timestamp(&self) -> Option<LogTime> {
        match self {
            LogEntry::Register(e) => Some(e.timestamp),
            LogEntry::KeepAlive(e) => Some(e.timestamp),
            LogEntry::Command(e) => Some(e.timestamp),
            LogEntry::Query(e) => Some(e.timestamp),
            LogEntry::NoOp(_) => None,
        }
    }
}
