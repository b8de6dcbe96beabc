//! Entry application core.
//!
//! `ApplyCore` owns the user state machine, the session registry, and the
//! pending query table, and processes committed entries in strict log
//! order. All state changes derive from entries; session expiration is
//! evaluated against entry timestamps only.
//!
//! The core is synchronous and single-owner. Serial execution of user
//! callbacks is provided by the executor wrapping it, which feeds the core
//! from exactly one task.

use crate::core::config::MachineConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::time::LogTime;
use crate::machine::entry::{CommandEntry, KeepAliveEntry, LogEntry, QueryEntry, RegisterEntry};
use crate::machine::filter::Compaction;
use crate::machine::session::{Session, SessionRegistry, TouchOutcome};
use crate::machine::state_machine::{Commit, MachineSnapshot, SessionEvent, StateMachine};
use bytes::Bytes;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Result of applying a committed entry.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// A session was created; carries the new session id.
    SessionRegistered(u64),

    /// A session's liveness was refreshed.
    SessionKeptAlive,

    /// A command was applied (or answered from the response cache).
    CommandResult(Bytes),

    /// A log-carried query was dispatched to the query scheduler; its
    /// result, if anyone is waiting, travels through the query's reply
    /// channel.
    QueryDispatched,

    /// A no-op advanced the applied index; carries that index.
    NoOp(u64),
}

/// A query waiting on (or ready for) the apply core.
#[derive(Debug)]
pub struct PendingQuery {
    pub session_id: u64,

    /// Do not answer from state earlier than this applied index.
    pub version: u64,

    pub timestamp: LogTime,
    pub payload: Bytes,

    /// Completion channel for directly submitted queries. Log-carried
    /// queries replayed from the log have no waiter.
    pub reply: Option<oneshot::Sender<TrellisResult<Bytes>>>,
}

/// The session-aware apply core.
pub struct ApplyCore<M: StateMachine> {
    machine: M,
    sessions: SessionRegistry,

    /// Parked queries keyed by required version, fired in ascending key
    /// order, insertion order within a key.
    pending_queries: BTreeMap<u64, Vec<PendingQuery>>,

    last_applied: u64,
}

impl<M: StateMachine> ApplyCore<M> {
    /// Create an apply core around a user state machine.
    pub fn new(machine: M, config: &MachineConfig) -> Self {
        Self {
            machine,
            sessions: SessionRegistry::new(config.session_timeout_ms),
            pending_queries: BTreeMap::new(),
            last_applied: 0,
        }
    }

    /// The last log index applied to the state machine.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The user state machine.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Apply a committed entry at its log index.
    ///
    /// Must be called in strict log order.
    pub fn apply(&mut self, index: u64, entry: LogEntry) -> TrellisResult<ApplyOutcome> {
        tracing::trace!(index, kind = entry.kind(), "applying entry");
        match entry {
            LogEntry::Register(e) => self.apply_register(index, e),
            LogEntry::KeepAlive(e) => self.apply_keep_alive(index, e),
            LogEntry::Command(e) => self.apply_command(index, e),
            LogEntry::Query(e) => self.apply_query_entry(e),
            LogEntry::NoOp(_) => self.apply_noop(index),
        }
    }

    /// Submit a query directly, bypassing the log.
    ///
    /// If the required version has not been applied yet the query parks
    /// until the applied index reaches it; the result travels through the
    /// query's reply channel either way.
    pub fn submit_query(&mut self, query: PendingQuery) {
        if query.version > self.last_applied {
            tracing::debug!(
                session = query.session_id,
                version = query.version,
                last_applied = self.last_applied,
                "parking query until version is applied"
            );
            self.pending_queries
                .entry(query.version)
                .or_default()
                .push(query);
        } else {
            self.execute_query(query);
        }
    }

    /// Decide whether an entry survives compaction.
    pub fn filter(&mut self, index: u64, entry: &LogEntry, compaction: &Compaction) -> bool {
        match entry {
            // A registration is only useful while its session lives.
            LogEntry::Register(_) => self.sessions.contains(index),

            // Only the latest keep-alive per session survives.
            LogEntry::KeepAlive(e) => self
                .sessions
                .lookup(e.session_id)
                .map(|s| s.last_index == index)
                .unwrap_or(false),

            LogEntry::Command(e) => match self.sessions.lookup(e.session_id) {
                Some(session) => {
                    let commit = Commit {
                        index,
                        session,
                        timestamp: e.timestamp,
                        payload: &e.payload,
                    };
                    self.machine.filter(commit, compaction)
                }
                None => {
                    // The session is gone; hand the filter a synthetic
                    // expired session so it can still decide.
                    let mut session = Session::new(e.session_id, None, e.timestamp);
                    session.expire();
                    let commit = Commit {
                        index,
                        session: &session,
                        timestamp: e.timestamp,
                        payload: &e.payload,
                    };
                    self.machine.filter(commit, compaction)
                }
            },

            LogEntry::Query(_) | LogEntry::NoOp(_) => false,
        }
    }

    /// Drain events emitted by the user machine since the last drain.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.machine.drain_events()
    }

    /// Snapshot the applied index, session set, and user machine state.
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            last_applied: self.last_applied,
            sessions: self.sessions.snapshot(),
            machine: self.machine.snapshot(),
        }
    }

    /// Replace all state from a snapshot.
    ///
    /// Parked queries are volatile and are cancelled by dropping their
    /// reply channels.
    pub fn restore(&mut self, snapshot: MachineSnapshot) {
        self.pending_queries.clear();
        self.last_applied = snapshot.last_applied;
        self.sessions.restore(snapshot.sessions);
        self.machine.restore(snapshot.machine);
    }

    /// Core statistics.
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            last_applied: self.last_applied,
            open_sessions: self.sessions.len(),
            cached_responses: self.sessions.stats().cached_responses,
            pending_queries: self.pending_queries.values().map(Vec::len).sum(),
        }
    }

    // ========================================================================
    // Entry appliers
    // ========================================================================

    fn apply_register(&mut self, index: u64, entry: RegisterEntry) -> TrellisResult<ApplyOutcome> {
        self.expire_due(entry.timestamp);

        let session_id = self.sessions.register(index, entry.timestamp, entry.member);
        self.set_last_applied(index);

        if let Some(session) = self.sessions.lookup(session_id) {
            self.machine.register(session);
        }
        tracing::debug!(session = session_id, "session registered");
        Ok(ApplyOutcome::SessionRegistered(session_id))
    }

    fn apply_keep_alive(
        &mut self,
        index: u64,
        entry: KeepAliveEntry,
    ) -> TrellisResult<ApplyOutcome> {
        self.expire_due(entry.timestamp);
        self.set_last_applied(index);

        match self.sessions.touch(entry.session_id, index, entry.timestamp) {
            TouchOutcome::Ok => Ok(ApplyOutcome::SessionKeptAlive),
            TouchOutcome::Expired(session) => {
                self.notify_expired(session);
                Err(TrellisError::unknown_session(entry.session_id))
            }
            TouchOutcome::Missing => Err(TrellisError::unknown_session(entry.session_id)),
        }
    }

    fn apply_command(&mut self, index: u64, entry: CommandEntry) -> TrellisResult<ApplyOutcome> {
        self.expire_due(entry.timestamp);

        match self.sessions.touch(entry.session_id, index, entry.timestamp) {
            TouchOutcome::Ok => {}
            TouchOutcome::Expired(session) => {
                self.notify_expired(session);
                return Err(TrellisError::unknown_session(entry.session_id));
            }
            TouchOutcome::Missing => {
                return Err(TrellisError::unknown_session(entry.session_id));
            }
        }

        // Retried command: answer from the response cache without invoking
        // the user machine and without advancing the applied index.
        if let Some(cached) = self.sessions.cached_response(entry.session_id, entry.request_no) {
            tracing::debug!(
                session = entry.session_id,
                request = entry.request_no,
                "returning cached command result"
            );
            return Ok(ApplyOutcome::CommandResult(cached.clone()));
        }

        self.set_last_applied(index);

        let Some(session) = self.sessions.lookup(entry.session_id) else {
            return Err(TrellisError::unknown_session(entry.session_id));
        };
        let commit = Commit {
            index,
            session,
            timestamp: entry.timestamp,
            payload: &entry.payload,
        };
        match self.machine.apply(commit) {
            Ok(result) => {
                self.sessions
                    .cache_response(entry.session_id, entry.request_no, result.clone());
                self.sessions
                    .trim_responses(entry.session_id, entry.response_ack);
                Ok(ApplyOutcome::CommandResult(result))
            }
            // User errors are not cached; the session remains open and a
            // retry re-applies.
            Err(err) => Err(TrellisError::from(err)),
        }
    }

    fn apply_query_entry(&mut self, entry: QueryEntry) -> TrellisResult<ApplyOutcome> {
        self.submit_query(PendingQuery {
            session_id: entry.session_id,
            version: entry.version,
            timestamp: entry.timestamp,
            payload: entry.payload,
            reply: None,
        });
        Ok(ApplyOutcome::QueryDispatched)
    }

    fn apply_noop(&mut self, index: u64) -> TrellisResult<ApplyOutcome> {
        self.set_last_applied(index);
        Ok(ApplyOutcome::NoOp(index))
    }

    // ========================================================================
    // Query scheduling
    // ========================================================================

    /// Advance the applied index and fire any queries it unblocks.
    fn set_last_applied(&mut self, index: u64) {
        debug_assert!(
            index > self.last_applied,
            "entries must apply in strict log order: {} <= {}",
            index,
            self.last_applied
        );
        self.last_applied = index;
        self.fire_ready_queries();
    }

    fn fire_ready_queries(&mut self) {
        loop {
            let Some((&version, _)) = self.pending_queries.first_key_value() else {
                break;
            };
            if version > self.last_applied {
                break;
            }
            let Some(batch) = self.pending_queries.remove(&version) else {
                break;
            };
            for query in batch {
                self.execute_query(query);
            }
        }
    }

    fn execute_query(&mut self, mut query: PendingQuery) {
        let result = self.run_query(&query);
        if let Err(err) = &result {
            tracing::debug!(session = query.session_id, error = %err, "query failed");
        }
        if let Some(reply) = query.reply.take() {
            // The waiter may have given up; that is not an error here.
            let _ = reply.send(result);
        }
    }

    fn run_query(&mut self, query: &PendingQuery) -> TrellisResult<Bytes> {
        match self.sessions.refresh(query.session_id, query.timestamp) {
            TouchOutcome::Missing => Err(TrellisError::unknown_session(query.session_id)),
            TouchOutcome::Expired(session) => {
                self.notify_expired(session);
                Err(TrellisError::unknown_session(query.session_id))
            }
            TouchOutcome::Ok => {
                let Some(session) = self.sessions.lookup(query.session_id) else {
                    return Err(TrellisError::unknown_session(query.session_id));
                };
                let commit = Commit {
                    index: self.last_applied,
                    session,
                    timestamp: query.timestamp,
                    payload: &query.payload,
                };
                self.machine.apply(commit).map_err(TrellisError::from)
            }
        }
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Expire every session whose idle window has elapsed at the given
    /// log-derived time.
    fn expire_due(&mut self, now: LogTime) {
        for session in self.sessions.expire_all_due(now) {
            self.notify_expired(session);
        }
    }

    fn notify_expired(&mut self, session: Session) {
        tracing::debug!(session = session.id, "session expired");
        self.machine.expire(&session);
    }
}

/// Apply core statistics.
#[derive(Debug, Clone)]
pub struct CoreStats {
    /// Last applied log index.
    pub last_applied: u64,
    /// Number of live sessions.
    pub open_sessions: usize,
    /// Cached command results across all sessions.
    pub cached_responses: usize,
    /// Queries parked waiting for their required version.
    pub pending_queries: usize,
}
