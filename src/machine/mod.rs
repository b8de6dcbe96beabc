//! Server-side session-aware state machine runtime.
//!
//! This module materializes a deterministic state machine from a
//! committed, ordered log:
//! - [`entry`] - Committed log entry types
//! - [`session`] - Session records and registry
//! - [`state_machine`] - User state-machine contract
//! - [`apply`] - Entry application core and query scheduling
//! - [`executor`] - Serial executor wrapping the core
//! - [`filter`] - Compaction context types
//! - [`publish`] - Best-effort session event delivery

pub mod apply;
pub mod entry;
pub mod executor;
pub mod filter;
pub mod publish;
pub mod session;
pub mod state_machine;
