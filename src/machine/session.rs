//! Session records and the session registry.
//!
//! A session is created by a `Register` entry and identified by that
//! entry's log index. The registry tracks liveness against log-derived
//! time and holds each session's response cache, which is what makes
//! command retries idempotent.
//!
//! Invariants:
//! - `last_timestamp` is monotonic.
//! - Response cache keys strictly increase.
//! - An expired session is removed and never re-opened; a client must
//!   register a new one.

use crate::core::time::LogTime;
use crate::rpc::Member;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Live and accepting operations.
    Open,
    /// Idle past the session timeout; terminal.
    Expired,
    /// Closed by the client; terminal.
    Closed,
}

/// A server-side session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session id, equal to the log index of the `Register` entry that
    /// created it.
    pub id: u64,

    /// Descriptor of the client endpoint, if known.
    pub member: Option<Member>,

    /// Greatest log index at which this session was observed alive.
    pub last_index: u64,

    /// Log-derived time of last observed activity.
    pub last_timestamp: LogTime,

    /// Cached command results keyed by request number, ascending.
    pub responses: BTreeMap<u64, Bytes>,

    /// Lifecycle state.
    pub state: SessionState,
}

impl Session {
    /// Create a new open session.
    pub fn new(id: u64, member: Option<Member>, timestamp: LogTime) -> Self {
        Self {
            id,
            member,
            last_index: id,
            last_timestamp: timestamp,
            responses: BTreeMap::new(),
            state: SessionState::Open,
        }
    }

    /// Check whether the session is open.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Check whether the idle window has elapsed at the given time.
    pub fn has_expired_at(&self, now: LogTime, timeout_ms: u64) -> bool {
        now.elapsed_since(self.last_timestamp) > timeout_ms
    }

    /// Mark the session expired.
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
    }

    /// Mark the session closed.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Record activity at the given index and time.
    ///
    /// Returns `false` without updating if the idle window had already
    /// elapsed; the caller expires the session.
    pub fn touch(&mut self, index: u64, timestamp: LogTime, timeout_ms: u64) -> bool {
        if self.has_expired_at(timestamp, timeout_ms) {
            return false;
        }
        self.last_index = index;
        self.last_timestamp = self.last_timestamp.later(timestamp);
        true
    }

    /// Record activity at the given time only, leaving `last_index`
    /// untouched. Queries refresh liveness but do not count as indexed
    /// activity.
    pub fn refresh(&mut self, timestamp: LogTime, timeout_ms: u64) -> bool {
        if self.has_expired_at(timestamp, timeout_ms) {
            return false;
        }
        self.last_timestamp = self.last_timestamp.later(timestamp);
        true
    }

    /// Cache a command result.
    pub fn cache_response(&mut self, request_no: u64, result: Bytes) {
        self.responses.insert(request_no, result);
    }

    /// Look up a cached command result.
    pub fn cached_response(&self, request_no: u64) -> Option<&Bytes> {
        self.responses.get(&request_no)
    }

    /// Drop all cached results with request number at or below the ack.
    pub fn trim_responses(&mut self, response_ack: u64) {
        self.responses = self.responses.split_off(&(response_ack + 1));
    }
}

/// Outcome of touching a session in the registry.
#[derive(Debug)]
pub enum TouchOutcome {
    /// The session is live and was updated.
    Ok,
    /// The idle window elapsed; the session was removed and is returned
    /// for the expiry callback.
    Expired(Session),
    /// No such session.
    Missing,
}

/// Registry of live sessions, owned by the apply core.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<u64, Session>,
    session_timeout_ms: u64,
}

impl SessionRegistry {
    /// Create a registry with the given idle timeout.
    pub fn new(session_timeout_ms: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            session_timeout_ms,
        }
    }

    /// The configured idle timeout in milliseconds.
    pub fn session_timeout_ms(&self) -> u64 {
        self.session_timeout_ms
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check whether a session exists.
    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Create a new open session keyed by the registration index.
    pub fn register(&mut self, index: u64, timestamp: LogTime, member: Option<Member>) -> u64 {
        let session = Session::new(index, member, timestamp);
        self.sessions.insert(index, session);
        index
    }

    /// Look up a session.
    pub fn lookup(&self, session_id: u64) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    /// Look up a session mutably.
    pub fn lookup_mut(&mut self, session_id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// Remove a session.
    pub fn remove(&mut self, session_id: u64) -> Option<Session> {
        self.sessions.remove(&session_id)
    }

    /// Record indexed activity on a session, expiring it if its idle
    /// window has elapsed.
    pub fn touch(&mut self, session_id: u64, index: u64, timestamp: LogTime) -> TouchOutcome {
        let timeout = self.session_timeout_ms;
        let updated = match self.sessions.get_mut(&session_id) {
            None => return TouchOutcome::Missing,
            Some(session) => session.touch(index, timestamp, timeout),
        };
        if updated {
            TouchOutcome::Ok
        } else {
            self.take_expired(session_id)
        }
    }

    /// Record timestamp-only activity on a session, expiring it if its
    /// idle window has elapsed.
    pub fn refresh(&mut self, session_id: u64, timestamp: LogTime) -> TouchOutcome {
        let timeout = self.session_timeout_ms;
        let updated = match self.sessions.get_mut(&session_id) {
            None => return TouchOutcome::Missing,
            Some(session) => session.refresh(timestamp, timeout),
        };
        if updated {
            TouchOutcome::Ok
        } else {
            self.take_expired(session_id)
        }
    }

    fn take_expired(&mut self, session_id: u64) -> TouchOutcome {
        match self.sessions.remove(&session_id) {
            Some(mut session) => {
                session.expire();
                TouchOutcome::Expired(session)
            }
            None => TouchOutcome::Missing,
        }
    }

    /// Cache a command result on a session.
    pub fn cache_response(&mut self, session_id: u64, request_no: u64, result: Bytes) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.cache_response(request_no, result);
        }
    }

    /// Look up a cached command result.
    pub fn cached_response(&self, session_id: u64, request_no: u64) -> Option<&Bytes> {
        self.sessions
            .get(&session_id)
            .and_then(|s| s.cached_response(request_no))
    }

    /// Drop a session's cached results at or below the ack.
    pub fn trim_responses(&mut self, session_id: u64, response_ack: u64) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.trim_responses(response_ack);
        }
    }

    /// Remove and return every session whose idle window has elapsed at
    /// the given log-derived time, marked expired, in ascending id order.
    ///
    /// Ordering keeps the expiry callbacks deterministic across replicas.
    pub fn expire_all_due(&mut self, now: LogTime) -> Vec<Session> {
        let timeout = self.session_timeout_ms;
        let mut due: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| s.has_expired_at(now, timeout))
            .map(|s| s.id)
            .collect();
        due.sort_unstable();

        due.into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .map(|mut session| {
                session.expire();
                session
            })
            .collect()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Snapshot all sessions, sorted by id.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Replace the registry contents from a snapshot.
    pub fn restore(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions.into_iter().map(|s| (s.id, s)).collect();
    }

    /// Registry statistics.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            open_sessions: self.sessions.len(),
            cached_responses: self.sessions.values().map(|s| s.responses.len()).sum(),
        }
    }
}

/// Session registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of live sessions.
    pub open_sessions: usize,
    /// Cached command results across all sessions.
    pub cached_responses: usize,
}
