//! Trellis - session-oriented replicated state machine runtime.
//!
//! Trellis is the execution half of a consensus system: given an ordered,
//! committed log produced by a Raft-style replication layer, it
//! materializes a deterministic, session-aware state machine on every
//! replica and exposes that state to clients through linearizable
//! sessions with exactly-once command semantics and bounded-staleness
//! queries.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Client Application                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ submit
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Client Session Runtime                      │
//! │   register │ keep-alive │ leader tracking │ retry │ watermarks  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ transport (external)
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Serial Machine Executor                      │
//! │  entry dispatch │ sessions │ dedup │ queries │ filter │ events  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ committed entries
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Raft Log / Replication (external)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Operational parameters and validation
//! - [`core::error`] - Error taxonomy and retry classification
//! - [`core::time`] - Log-derived time
//!
//! ## Machine (server side)
//! - [`machine::entry`] - Committed log entry types
//! - [`machine::session`] - Session registry and response caches
//! - [`machine::state_machine`] - User state-machine contract
//! - [`machine::apply`] - Apply core: dispatch, dedup, query scheduling
//! - [`machine::executor`] - Serial executor
//! - [`machine::filter`] - Compaction filtering context
//! - [`machine::publish`] - Best-effort session event delivery
//!
//! ## Client
//! - [`client::member`] - Cluster view and member selection
//! - [`client::session`] - Watermarks and event listeners
//! - [`client::runtime`] - Session lifecycle
//! - [`client::pipeline`] - Command and query submission
//!
//! ## RPC
//! - [`rpc`] - Message shapes and the transport seam
//!
//! # Key Invariants
//!
//! - Entries apply in strict log order; the applied index is strictly
//!   monotonic.
//! - A command is applied to the user machine at most once per
//!   `(session, request_no)`; replays answer from the response cache
//!   byte-for-byte.
//! - A query never executes before its required version is applied, and
//!   executes before any query requiring a later version.
//! - Session expiration derives from entry timestamps only, so every
//!   replica expires every session at the same entry.
//! - Compaction filter decisions depend only on replicated state.

// Core infrastructure
pub mod core;

// Server-side machine runtime
pub mod machine;

// Client session runtime
pub mod client;

// RPC shapes and transport seam
pub mod rpc;

// Re-exports for convenience
pub use self::core::config::{ClientConfig, Config, MachineConfig};
pub use self::core::error::{TrellisError, TrellisResult, UserError};
pub use self::core::time::LogTime;
pub use client::runtime::SessionClient;
pub use machine::apply::{ApplyCore, ApplyOutcome, PendingQuery};
pub use machine::entry::{
    CommandEntry, KeepAliveEntry, LogEntry, NoOpEntry, QueryEntry, RegisterEntry,
};
pub use machine::executor::{MachineExecutor, MachineHandle};
pub use machine::filter::{Compaction, CompactionKind};
pub use machine::session::{Session, SessionRegistry, SessionState};
pub use machine::state_machine::{Commit, MachineSnapshot, SessionEvent, StateMachine};
pub use rpc::{Member, MemberKind, QueryConsistency};
