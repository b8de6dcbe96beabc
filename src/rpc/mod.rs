//! RPC message shapes and the transport seam.
//!
//! The shapes of requests, responses, and server-pushed events are part of
//! the session protocol; their wire encoding is not. A concrete transport
//! implements [`Transport`] and [`Connection`] over whatever framing it
//! likes, as long as request/response pairing and the server-push channel
//! are preserved.

use crate::core::error::{TrellisError, TrellisResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// Cluster members
// ============================================================================

/// A cluster member descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member identifier. Zero is reserved for "no member".
    pub id: u64,

    /// Endpoint address, opaque to this layer.
    pub address: String,

    /// Member kind.
    pub kind: MemberKind,
}

impl Member {
    /// Create a voting member.
    pub fn voting(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Voting,
        }
    }

    /// Create an observer member.
    pub fn observer(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Observer,
        }
    }
}

/// Role of a member in the replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Participates in quorum; eligible for keep-alive traffic.
    Voting,
    /// Receives the log without voting.
    Observer,
}

// ============================================================================
// Wire errors
// ============================================================================

/// Wire-level error kind.
///
/// The client maps these back onto [`TrellisError`] for its retry ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownSession,
    NoLeader,
    Timeout,
    Transport,
    ProtocolViolation,
    User,
}

/// A wire-level error: kind plus a human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    /// Create a wire error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&TrellisError> for RpcError {
    fn from(err: &TrellisError) -> Self {
        let kind = match err {
            TrellisError::UnknownSession { .. } => ErrorKind::UnknownSession,
            TrellisError::NoLeader => ErrorKind::NoLeader,
            TrellisError::Timeout { .. } => ErrorKind::Timeout,
            TrellisError::Transport { .. } => ErrorKind::Transport,
            TrellisError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            TrellisError::User { .. } => ErrorKind::User,
            TrellisError::Closed => ErrorKind::Transport,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<RpcError> for TrellisError {
    fn from(err: RpcError) -> Self {
        match err.kind {
            // The original session id is not on the wire; zero marks
            // "reported by the server".
            ErrorKind::UnknownSession => TrellisError::UnknownSession { session_id: 0 },
            ErrorKind::NoLeader => TrellisError::NoLeader,
            ErrorKind::Timeout => TrellisError::Timeout { elapsed_ms: 0 },
            ErrorKind::Transport => TrellisError::Transport {
                message: err.message,
            },
            ErrorKind::ProtocolViolation => TrellisError::ProtocolViolation {
                message: err.message,
            },
            ErrorKind::User => TrellisError::User {
                message: err.message,
            },
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Consistency demanded by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryConsistency {
    /// Must be answered by the leader.
    Linearizable,
    /// May be answered by any member, bounded by the client's version
    /// watermark.
    BoundedStaleness,
}

impl QueryConsistency {
    /// Check whether this consistency level requires the leader.
    pub fn requires_leader(&self) -> bool {
        matches!(self, Self::Linearizable)
    }
}

/// Session registration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {}

/// Session registration response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub error: Option<RpcError>,
    pub term: u64,
    pub leader: u64,
    pub session_id: u64,
    pub members: Vec<Member>,
}

/// Keep-alive request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: u64,
}

/// Keep-alive response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub error: Option<RpcError>,
    pub term: u64,
    pub leader: u64,
    pub version: u64,
    pub members: Vec<Member>,
}

/// Command submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session_id: u64,
    pub request_no: u64,
    pub response_ack: u64,
    pub payload: Bytes,
}

/// Command submission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub error: Option<RpcError>,
    pub result: Bytes,
    pub version: u64,
}

/// Query submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session_id: u64,
    pub version: u64,
    pub consistency: QueryConsistency,
    pub payload: Bytes,
}

/// Query submission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub error: Option<RpcError>,
    pub result: Bytes,
    pub version: u64,
}

/// A server-pushed event addressed to a session. Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub session_id: u64,
    pub payload: Bytes,
}

/// Client-originated requests, one variant per RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Command(CommandRequest),
    Query(QueryRequest),
}

/// Responses paired with [`ClientRequest`] variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Command(CommandResponse),
    Query(QueryResponse),
}

// ============================================================================
// Transport seam
// ============================================================================

/// Factory for connections to cluster members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to the given member.
    ///
    /// Returns the connection handle together with the stream of
    /// server-pushed [`Publish`] events arriving on it.
    async fn connect(
        &self,
        member: &Member,
    ) -> TrellisResult<(ConnectionHandle, mpsc::UnboundedReceiver<Publish>)>;
}

/// A single open connection to a member.
///
/// Request/response pairing is the implementation's concern; `request`
/// takes `&self` so independent requests may be multiplexed over one
/// connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The member this connection is bound to.
    fn member_id(&self) -> u64;

    /// Send a request and await its response.
    async fn request(&self, request: ClientRequest) -> TrellisResult<ClientResponse>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Shared handle to a live connection.
pub type ConnectionHandle = std::sync::Arc<dyn Connection>;
