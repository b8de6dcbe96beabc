//! Client session runtime.
//!
//! `SessionClient` owns one registered session against the cluster:
//! it discovers a member to talk to, registers, keeps the session alive on
//! a timer, tracks the leader and term from responses, and survives
//! connection loss. Submission of commands and queries lives in
//! [`crate::client::pipeline`].

use crate::client::member::Membership;
use crate::client::session::{EventListeners, SessionState};
use crate::core::config::ClientConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::rpc::{
    ClientRequest, ClientResponse, ConnectionHandle, KeepAliveRequest, Member, RegisterRequest,
    Transport,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A linearizable client session against a replication group.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct SessionClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,

    /// Session identity and watermarks. Never held across an await.
    pub(crate) state: Mutex<SessionState>,

    /// Cluster view. Never held across an await.
    pub(crate) membership: Mutex<Membership>,

    /// The single live connection.
    pub(crate) connection: tokio::sync::Mutex<Option<ConnectionHandle>>,

    /// Serializes registration so concurrent callers share one attempt.
    pub(crate) register_gate: tokio::sync::Mutex<()>,

    /// At most one keep-alive in flight.
    keep_alive_inflight: AtomicBool,

    /// Cooperative shutdown signal.
    pub(crate) shutdown: watch::Sender<bool>,

    /// Server-pushed event fan-out.
    pub(crate) listeners: EventListeners,
}

impl SessionClient {
    /// Connect to the cluster: register a session and start the
    /// keep-alive timer.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        members: Vec<Member>,
        config: ClientConfig,
    ) -> TrellisResult<Self> {
        config
            .validate()
            .map_err(|err| TrellisError::protocol(format!("invalid client config: {err:#}")))?;

        let (shutdown, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                state: Mutex::new(SessionState::default()),
                membership: Mutex::new(Membership::new(members)),
                connection: tokio::sync::Mutex::new(None),
                register_gate: tokio::sync::Mutex::new(()),
                keep_alive_inflight: AtomicBool::new(false),
                shutdown,
                listeners: EventListeners::new(),
            }),
        };

        client.register().await?;
        client.inner.state.lock().open = true;

        let shutdown_rx = client.inner.shutdown.subscribe();
        tokio::spawn(client.clone().keep_alive_loop(shutdown_rx));

        Ok(client)
    }

    /// The current session id, zero while unregistered.
    pub fn session_id(&self) -> u64 {
        self.inner.state.lock().session_id
    }

    /// The highest applied index observed from the server.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    /// The known leader id, zero when unknown.
    pub fn leader(&self) -> u64 {
        self.inner.membership.lock().leader()
    }

    /// The highest term observed.
    pub fn term(&self) -> u64 {
        self.inner.membership.lock().term()
    }

    /// Whether the client accepts submissions.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// Subscribe to server-pushed session events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.inner.listeners.subscribe()
    }

    /// Close the client: cancel the keep-alive timer, mark the session
    /// closed, release the connection. In-flight requests finish or time
    /// out on their own.
    pub async fn close(&self) {
        if self.is_shut_down() {
            return;
        }
        self.inner.state.lock().open = false;
        let _ = self.inner.shutdown.send(true);

        if let Some(connection) = self.inner.connection.lock().await.take() {
            connection.close().await;
        }
        tracing::info!("session client closed");
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a session, retrying with exponential backoff until it
    /// succeeds or the client shuts down.
    ///
    /// Idempotent: concurrent callers share a single in-flight attempt,
    /// and a session registered while waiting is reused.
    pub(crate) async fn register(&self) -> TrellisResult<()> {
        let _gate = self.inner.register_gate.lock().await;
        if self.inner.state.lock().session_id != 0 {
            return Ok(());
        }

        let mut backoff = self.inner.config.backoff_min();
        loop {
            if self.is_shut_down() {
                return Err(TrellisError::Closed);
            }

            let member = self
                .inner
                .membership
                .lock()
                .select_for_command(&mut rand::thread_rng())
                .ok_or(TrellisError::NoLeader)?;

            match self
                .request_via(&member, ClientRequest::Register(RegisterRequest::default()))
                .await
            {
                Ok(ClientResponse::Register(resp)) if resp.error.is_none() => {
                    self.inner
                        .membership
                        .lock()
                        .configure(resp.term, resp.leader, resp.members);
                    self.inner.state.lock().adopt(resp.session_id);
                    tracing::info!(
                        session = resp.session_id,
                        leader = resp.leader,
                        term = resp.term,
                        "registered session"
                    );
                    return Ok(());
                }
                Ok(_) | Err(_) => {
                    tracing::debug!(member = member.id, "session registration failed, retrying");
                    self.inner.membership.lock().clear_leader();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.inner.config.backoff_max());
                }
            }
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    async fn keep_alive_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.keep_alive_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.keep_alive_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("keep-alive loop stopped");
    }

    async fn keep_alive_once(&self) {
        if self.inner.keep_alive_inflight.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drive_keep_alive().await;
        self.inner.keep_alive_inflight.store(false, Ordering::Release);
    }

    /// Send one keep-alive. Failures are left alone: the next command or
    /// query re-registers if the session is actually gone.
    async fn drive_keep_alive(&self) {
        let session_id = self.inner.state.lock().session_id;
        if session_id == 0 {
            return;
        }
        let Some(member) = self
            .inner
            .membership
            .lock()
            .select_for_keep_alive(&mut rand::thread_rng())
        else {
            return;
        };

        match self
            .request_via(
                &member,
                ClientRequest::KeepAlive(KeepAliveRequest { session_id }),
            )
            .await
        {
            Ok(ClientResponse::KeepAlive(resp)) if resp.error.is_none() => {
                self.inner
                    .membership
                    .lock()
                    .configure(resp.term, resp.leader, resp.members);
                self.inner.state.lock().observe_version(resp.version);
            }
            Ok(_) => {
                tracing::debug!(session = session_id, "keep-alive rejected");
            }
            Err(err) => {
                tracing::debug!(session = session_id, error = %err, "keep-alive failed");
            }
        }
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    /// Send a request to a member over the single live connection,
    /// bounded by the request timeout.
    pub(crate) async fn request_via(
        &self,
        member: &Member,
        request: ClientRequest,
    ) -> TrellisResult<ClientResponse> {
        let connection = self.connection_to(member).await?;
        let timeout = self.inner.config.request_timeout();
        match tokio::time::timeout(timeout, connection.request(request)).await {
            Ok(result) => result,
            Err(_) => Err(TrellisError::timeout(self.inner.config.request_timeout_ms)),
        }
    }

    /// Return the live connection to the given member, closing any prior
    /// connection to a different member first.
    async fn connection_to(&self, member: &Member) -> TrellisResult<ConnectionHandle> {
        let mut slot = self.inner.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.member_id() == member.id {
                return Ok(connection.clone());
            }
        }
        if let Some(prior) = slot.take() {
            prior.close().await;
        }

        let (connection, events) = self.inner.transport.connect(member).await?;
        *slot = Some(connection.clone());
        tracing::debug!(member = member.id, "connected");

        // Pump server-pushed events into the listener fan-out for the
        // lifetime of this connection.
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            pump_events(inner, events, &mut shutdown).await;
        });

        Ok(connection)
    }
}

async fn pump_events(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<crate::rpc::Publish>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(publish) => inner.listeners.broadcast(publish.payload),
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
