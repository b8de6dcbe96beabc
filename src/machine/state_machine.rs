//! The user state-machine contract.
//!
//! The runtime drives an application-defined state machine through four
//! callbacks plus a snapshot pair. All callbacks run on the serial apply
//! executor: no two callbacks ever execute concurrently for the same
//! machine, so implementations need no internal locking.

use crate::core::error::UserError;
use crate::core::time::LogTime;
use crate::machine::filter::Compaction;
use crate::machine::session::Session;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A committed operation handed to the user state machine.
#[derive(Debug)]
pub struct Commit<'a> {
    /// Log index of the operation.
    pub index: u64,

    /// The session that submitted it.
    ///
    /// During compaction filtering this may be a session in the `Expired`
    /// state synthesized for a client that is long gone; filters must
    /// tolerate that.
    pub session: &'a Session,

    /// Log-derived time of the operation.
    pub timestamp: LogTime,

    /// Opaque operation payload.
    pub payload: &'a Bytes,
}

/// An event emitted by the user state machine, addressed to a session.
///
/// Delivery is best-effort over the session's open connection; the
/// decision to emit must be deterministic, the delivery is not replicated.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: u64,
    pub payload: Bytes,
}

/// Application-defined replicated state machine.
///
/// `apply` is invoked for both commands and queries; queries must not
/// mutate state. `filter` decides per-command retention during log
/// compaction and must be deterministic given identical commit and
/// compaction context on every replica.
pub trait StateMachine: Send + 'static {
    /// Called once when a session is created.
    fn register(&mut self, session: &Session);

    /// Called once when a session transitions to expired.
    fn expire(&mut self, session: &Session);

    /// Apply a committed command or query and produce its result.
    fn apply(&mut self, commit: Commit<'_>) -> Result<Bytes, UserError>;

    /// Decide whether a command entry survives compaction.
    fn filter(&mut self, commit: Commit<'_>, compaction: &Compaction) -> bool;

    /// Drain events emitted since the last call.
    ///
    /// Machines that never publish keep the default.
    fn drain_events(&mut self) -> Vec<SessionEvent> {
        Vec::new()
    }

    /// Serialize machine state for a snapshot.
    fn snapshot(&self) -> Bytes;

    /// Replace machine state from a snapshot.
    fn restore(&mut self, data: Bytes);
}

/// A complete snapshot of the apply core: applied index, session set
/// (including cached responses), and user machine state.
///
/// Replaying a log suffix over a restored snapshot reproduces the same
/// applied index, session set, and response caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub last_applied: u64,
    pub sessions: Vec<Session>,
    pub machine: Bytes,
}
