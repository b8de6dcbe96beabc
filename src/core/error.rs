//! Error types and retry classification.
//!
//! The runtime distinguishes failures the client recovers from
//! transparently (timeouts, transport drops, missing leaders) from
//! failures that demand a new session and from failures that surface to
//! the caller. Classification predicates on [`TrellisError`] drive the
//! client's retry ladder.

use thiserror::Error;

/// Common runtime error conditions.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// The session is not in the registry or has just expired.
    ///
    /// The client resets its session id, re-registers, and resubmits.
    #[error("unknown session {session_id}")]
    UnknownSession { session_id: u64 },

    /// The known cluster view has no leader.
    #[error("no leader known")]
    NoLeader,

    /// A request deadline elapsed.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// A connection-level failure.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// A malformed or unrecognized entry or message. Fatal on the server,
    /// surfaced on the client.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// An error raised inside the user state machine. Propagates to the
    /// requesting client; the session remains open.
    #[error("state machine error: {message}")]
    User { message: String },

    /// The runtime or client has been closed.
    #[error("closed")]
    Closed,
}

impl TrellisError {
    /// Create an `UnknownSession` error.
    pub fn unknown_session(session_id: u64) -> Self {
        Self::UnknownSession { session_id }
    }

    /// Create a `Timeout` error.
    pub fn timeout(elapsed_ms: u64) -> Self {
        Self::Timeout { elapsed_ms }
    }

    /// Create a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a `ProtocolViolation` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create a `User` error.
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
        }
    }

    /// Check whether the operation may be retried as-is.
    ///
    /// Retrying a command with the same request number is safe because the
    /// server deduplicates through the session response cache.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NoLeader | Self::Transport { .. }
        )
    }

    /// Check whether the client must establish a new session before
    /// retrying.
    pub fn requires_reregister(&self) -> bool {
        matches!(self, Self::UnknownSession { .. })
    }
}

/// An error raised by a user state machine callback.
///
/// Kept distinct from [`TrellisError`] so user machines cannot forge
/// runtime conditions such as `UnknownSession`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
}

impl UserError {
    /// Create a user error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<UserError> for TrellisError {
    fn from(err: UserError) -> Self {
        TrellisError::User {
            message: err.message,
        }
    }
}

/// Result type using [`TrellisError`].
pub type TrellisResult<T> = Result<T, TrellisError>;
