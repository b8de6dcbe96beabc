//! Common test utilities.
//!
//! An in-process cluster stand-in: a totally ordered committed log feeding
//! a machine executor, fronted by a loopback transport so the client
//! runtime can be exercised without real networking. Import with
//! `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis::core::error::{TrellisError, TrellisResult, UserError};
use trellis::machine::executor::{MachineExecutor, MachineHandle};
use trellis::rpc::{
    ClientRequest, ClientResponse, CommandResponse, ConnectionHandle, Connection, ErrorKind,
    KeepAliveResponse, Member, Publish, QueryResponse, RegisterResponse, RpcError, Transport,
};
use trellis::{Commit, Compaction, LogEntry, LogTime, MachineConfig, SessionEvent, StateMachine};

// ============================================================================
// Controllable log-derived clock
// ============================================================================

/// A manually advanced clock stamping entries with log-derived time.
#[derive(Debug, Default)]
pub struct TestClock {
    ms: AtomicU64,
}

impl TestClock {
    pub fn now(&self) -> LogTime {
        LogTime::new(self.ms.load(Ordering::Acquire))
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }
}

// ============================================================================
// Instrumented KV state machine
// ============================================================================

/// Observation points shared between a [`KvMachine`] and the test body.
#[derive(Debug, Default)]
pub struct MachineProbe {
    pub applies: AtomicU64,
    pub registers: AtomicU64,
    pub expires: AtomicU64,
    pub filters: AtomicU64,
    /// Payloads applied, in order.
    pub applied_order: Mutex<Vec<String>>,
}

impl MachineProbe {
    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::Acquire)
    }

    pub fn registers(&self) -> u64 {
        self.registers.load(Ordering::Acquire)
    }

    pub fn expires(&self) -> u64 {
        self.expires.load(Ordering::Acquire)
    }
}

/// A small key-value machine with a line-oriented command language:
///
/// - `put <key> <value>` stores a value and answers `ok`
/// - `get <key>` answers the stored value, or `nil`
/// - `notify <message>` publishes `<message>` to the submitting session
/// - `fail <message>` raises a user error
///
/// The compaction filter keeps a `put` only while it is the latest write
/// for its key.
pub struct KvMachine {
    data: BTreeMap<String, String>,
    events: Vec<SessionEvent>,
    probe: Arc<MachineProbe>,
}

impl KvMachine {
    pub fn new(probe: Arc<MachineProbe>) -> Self {
        Self {
            data: BTreeMap::new(),
            events: Vec::new(),
            probe,
        }
    }
}

impl StateMachine for KvMachine {
    fn register(&mut self, _session: &trellis::Session) {
        self.probe.registers.fetch_add(1, Ordering::AcqRel);
    }

    fn expire(&mut self, _session: &trellis::Session) {
        self.probe.expires.fetch_add(1, Ordering::AcqRel);
    }

    fn apply(&mut self, commit: Commit<'_>) -> Result<Bytes, UserError> {
        self.probe.applies.fetch_add(1, Ordering::AcqRel);
        let text = String::from_utf8_lossy(commit.payload).into_owned();
        self.probe.applied_order.lock().push(text.clone());

        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("put"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(Bytes::from_static(b"ok"))
            }
            (Some("get"), Some(key), None) => Ok(self
                .data
                .get(key)
                .map(|v| Bytes::from(v.clone()))
                .unwrap_or_else(|| Bytes::from_static(b"nil"))),
            (Some("notify"), Some(message), None) => {
                self.events.push(SessionEvent {
                    session_id: commit.session.id,
                    payload: Bytes::from(message.to_string()),
                });
                Ok(Bytes::from_static(b"ok"))
            }
            (Some("fail"), Some(message), None) => Err(UserError::new(message)),
            _ => Err(UserError::new(format!("unknown command: {text}"))),
        }
    }

    fn filter(&mut self, commit: Commit<'_>, _compaction: &Compaction) -> bool {
        self.probe.filters.fetch_add(1, Ordering::AcqRel);
        let text = String::from_utf8_lossy(commit.payload).into_owned();
        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("put"), Some(key), Some(value)) => {
                self.data.get(key).map(String::as_str) == Some(value)
            }
            _ => false,
        }
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn snapshot(&self) -> Bytes {
        let mut out = String::new();
        for (key, value) in &self.data {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        Bytes::from(out)
    }

    fn restore(&mut self, data: Bytes) {
        self.data.clear();
        for line in String::from_utf8_lossy(&data).lines() {
            if let Some((key, value)) = line.split_once('=') {
                self.data.insert(key.to_string(), value.to_string());
            }
        }
    }
}

// ============================================================================
// In-process cluster
// ============================================================================

/// A three-member cluster stand-in sharing one replicated machine.
pub struct TestCluster {
    inner: Arc<ClusterInner>,
}

pub struct ClusterInner {
    pub clock: TestClock,
    members: Vec<Member>,
    leader: AtomicU64,
    term: AtomicU64,
    down: Mutex<HashSet<u64>>,
    /// Members that have received at least one request.
    contacted: Mutex<HashSet<u64>>,
    /// Committed log; the lock provides total order for appends.
    log: tokio::sync::Mutex<Vec<(u64, LogEntry)>>,
    machine: MachineHandle,
}

impl TestCluster {
    /// Spawn a three-voting-member cluster over a [`KvMachine`] with the
    /// default session timeout.
    pub fn spawn(probe: Arc<MachineProbe>) -> (Self, MachineExecutor) {
        Self::spawn_with_members(
            probe,
            vec![
                Member::voting(1, "local:1"),
                Member::voting(2, "local:2"),
                Member::voting(3, "local:3"),
            ],
        )
    }

    /// Spawn a cluster with an explicit member set.
    pub fn spawn_with_members(
        probe: Arc<MachineProbe>,
        members: Vec<Member>,
    ) -> (Self, MachineExecutor) {
        let executor = MachineExecutor::spawn(KvMachine::new(probe), &MachineConfig::default());
        let cluster = Self {
            inner: Arc::new(ClusterInner {
                clock: TestClock::default(),
                members,
                leader: AtomicU64::new(1),
                term: AtomicU64::new(1),
                down: Mutex::new(HashSet::new()),
                contacted: Mutex::new(HashSet::new()),
                log: tokio::sync::Mutex::new(Vec::new()),
                machine: executor.handle(),
            }),
        };
        (cluster, executor)
    }

    /// Members that have received at least one request so far.
    pub fn contacted(&self) -> HashSet<u64> {
        self.inner.contacted.lock().clone()
    }

    pub fn clock(&self) -> &TestClock {
        &self.inner.clock
    }

    pub fn machine(&self) -> MachineHandle {
        self.inner.machine.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.members.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            cluster: self.inner.clone(),
        })
    }

    pub fn set_leader(&self, leader: u64, term: u64) {
        self.inner.leader.store(leader, Ordering::Release);
        self.inner.term.store(term, Ordering::Release);
    }

    pub fn kill(&self, member_id: u64) {
        self.inner.down.lock().insert(member_id);
        if self.inner.leader.load(Ordering::Acquire) == member_id {
            self.inner.leader.store(0, Ordering::Release);
        }
    }

    pub fn revive(&self, member_id: u64) {
        self.inner.down.lock().remove(&member_id);
    }

    /// Append a no-op entry and apply it.
    pub async fn append_noop(&self) -> u64 {
        let entry = LogEntry::NoOp(trellis::NoOpEntry::default());
        let (index, _) = self.inner.append_and_apply(entry).await;
        index
    }
}

impl ClusterInner {
    async fn append_and_apply(
        self: &Arc<Self>,
        entry: LogEntry,
    ) -> (u64, TrellisResult<trellis::ApplyOutcome>) {
        let mut log = self.log.lock().await;
        let index = log.len() as u64 + 1;
        log.push((index, entry.clone()));
        let outcome = self.machine.apply(index, entry).await;
        (index, outcome)
    }

    async fn last_applied(&self) -> u64 {
        self.machine
            .stats()
            .await
            .map(|s| s.last_applied)
            .unwrap_or(0)
    }

    fn view(&self) -> (u64, u64) {
        (
            self.term.load(Ordering::Acquire),
            self.leader.load(Ordering::Acquire),
        )
    }

    async fn handle_request(
        self: &Arc<Self>,
        request: ClientRequest,
    ) -> TrellisResult<ClientResponse> {
        let (term, leader) = self.view();
        match request {
            ClientRequest::Register(_) => {
                if leader == 0 {
                    return Ok(ClientResponse::Register(RegisterResponse {
                        error: Some(RpcError::new(ErrorKind::NoLeader, "no leader")),
                        term,
                        leader,
                        session_id: 0,
                        members: self.members.clone(),
                    }));
                }
                let entry = LogEntry::Register(trellis::RegisterEntry {
                    timestamp: self.clock.now(),
                    member: None,
                });
                let (_, outcome) = self.append_and_apply(entry).await;
                let session_id = match outcome? {
                    trellis::ApplyOutcome::SessionRegistered(id) => id,
                    other => panic!("unexpected register outcome: {other:?}"),
                };
                Ok(ClientResponse::Register(RegisterResponse {
                    error: None,
                    term,
                    leader,
                    session_id,
                    members: self.members.clone(),
                }))
            }
            ClientRequest::KeepAlive(req) => {
                let entry = LogEntry::KeepAlive(trellis::KeepAliveEntry {
                    session_id: req.session_id,
                    timestamp: self.clock.now(),
                });
                let (_, outcome) = self.append_and_apply(entry).await;
                let error = outcome.err().map(|e| RpcError::from(&e));
                Ok(ClientResponse::KeepAlive(KeepAliveResponse {
                    error,
                    term,
                    leader,
                    version: self.last_applied().await,
                    members: self.members.clone(),
                }))
            }
            ClientRequest::Command(req) => {
                if leader == 0 {
                    return Ok(ClientResponse::Command(CommandResponse {
                        error: Some(RpcError::new(ErrorKind::NoLeader, "no leader")),
                        result: Bytes::new(),
                        version: 0,
                    }));
                }
                let entry = LogEntry::Command(trellis::CommandEntry {
                    session_id: req.session_id,
                    request_no: req.request_no,
                    response_ack: req.response_ack,
                    timestamp: self.clock.now(),
                    payload: req.payload,
                });
                let (_, outcome) = self.append_and_apply(entry).await;
                let (error, result) = match outcome {
                    Ok(trellis::ApplyOutcome::CommandResult(result)) => (None, result),
                    Ok(other) => panic!("unexpected command outcome: {other:?}"),
                    Err(e) => (Some(RpcError::from(&e)), Bytes::new()),
                };
                Ok(ClientResponse::Command(CommandResponse {
                    error,
                    result,
                    version: self.last_applied().await,
                }))
            }
            ClientRequest::Query(req) => {
                let outcome = self
                    .machine
                    .query(req.session_id, req.version, self.clock.now(), req.payload)
                    .await;
                let (error, result) = match outcome {
                    Ok(result) => (None, result),
                    Err(e) => (Some(RpcError::from(&e)), Bytes::new()),
                };
                Ok(ClientResponse::Query(QueryResponse {
                    error,
                    result,
                    version: self.last_applied().await,
                }))
            }
        }
    }
}

// ============================================================================
// Loopback transport
// ============================================================================

struct LocalTransport {
    cluster: Arc<ClusterInner>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        member: &Member,
    ) -> TrellisResult<(ConnectionHandle, mpsc::UnboundedReceiver<Publish>)> {
        if self.cluster.down.lock().contains(&member.id) {
            return Err(TrellisError::transport(format!(
                "member {} unreachable",
                member.id
            )));
        }
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LocalConnection {
            cluster: self.cluster.clone(),
            member_id: member.id,
            closed: AtomicBool::new(false),
            publish_tx,
            subscribed: Mutex::new(HashSet::new()),
        });
        Ok((connection, publish_rx))
    }
}

struct LocalConnection {
    cluster: Arc<ClusterInner>,
    member_id: u64,
    closed: AtomicBool,
    publish_tx: mpsc::UnboundedSender<Publish>,
    subscribed: Mutex<HashSet<u64>>,
}

impl LocalConnection {
    /// Route machine-published events for a session onto this connection.
    fn ensure_subscribed(&self, session_id: u64) {
        if session_id == 0 || !self.subscribed.lock().insert(session_id) {
            return;
        }
        let mut events = self.cluster.machine.subscribe(session_id);
        let publish_tx = self.publish_tx.clone();
        tokio::spawn(async move {
            while let Some(payload) = events.recv().await {
                if publish_tx.send(Publish {
                    session_id,
                    payload,
                }).is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn member_id(&self) -> u64 {
        self.member_id
    }

    async fn request(&self, request: ClientRequest) -> TrellisResult<ClientResponse> {
        self.cluster.contacted.lock().insert(self.member_id);
        if self.closed.load(Ordering::Acquire)
            || self.cluster.down.lock().contains(&self.member_id)
        {
            return Err(TrellisError::transport(format!(
                "member {} unreachable",
                self.member_id
            )));
        }
        let request_session = match &request {
            ClientRequest::Register(_) => 0,
            ClientRequest::KeepAlive(r) => r.session_id,
            ClientRequest::Command(r) => r.session_id,
            ClientRequest::Query(r) => r.session_id,
        };
        let response = self.cluster.handle_request(request).await?;

        // Bind publish routing to the session served over this connection.
        match &response {
            ClientResponse::Register(resp) if resp.error.is_none() => {
                self.ensure_subscribed(resp.session_id);
            }
            ClientResponse::KeepAlive(resp) if resp.error.is_none() => {
                self.ensure_subscribed(request_session);
            }
            ClientResponse::Command(resp) if resp.error.is_none() => {
                self.ensure_subscribed(request_session);
            }
            _ => {}
        }
        Ok(response)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Install a test subscriber for `tracing` output (idempotent).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
