//! Serial state-machine executor.
//!
//! All entry application, query firing, and user callbacks run on exactly
//! one spawned task that owns the [`ApplyCore`]. Public operations post
//! work onto the task's queue and await a reply, which makes every user
//! callback observably atomic with respect to machine state.

use crate::core::config::MachineConfig;
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::time::LogTime;
use crate::machine::apply::{ApplyCore, ApplyOutcome, CoreStats, PendingQuery};
use crate::machine::entry::LogEntry;
use crate::machine::filter::Compaction;
use crate::machine::publish::EventPublisher;
use crate::machine::state_machine::{MachineSnapshot, StateMachine};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Work items posted to the executor task.
enum MachineTask {
    Apply {
        index: u64,
        entry: LogEntry,
        reply: oneshot::Sender<TrellisResult<ApplyOutcome>>,
    },
    Query {
        session_id: u64,
        version: u64,
        timestamp: LogTime,
        payload: Bytes,
        reply: oneshot::Sender<TrellisResult<Bytes>>,
    },
    Filter {
        index: u64,
        entry: LogEntry,
        compaction: Compaction,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<MachineSnapshot>,
    },
    Restore {
        snapshot: MachineSnapshot,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<CoreStats>,
    },
    Shutdown,
}

/// A running executor around a user state machine.
pub struct MachineExecutor {
    handle: MachineHandle,
    join: JoinHandle<()>,
}

impl MachineExecutor {
    /// Spawn the executor task for a user state machine.
    pub fn spawn<M: StateMachine>(machine: M, config: &MachineConfig) -> Self {
        let publisher = Arc::new(EventPublisher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let core = ApplyCore::new(machine, config);

        let join = tokio::spawn(run(core, rx, publisher.clone()));

        Self {
            handle: MachineHandle {
                tasks: tx,
                publisher,
            },
            join,
        }
    }

    /// A cloneable handle for posting work.
    pub fn handle(&self) -> MachineHandle {
        self.handle.clone()
    }

    /// Stop the executor and wait for queued work to drain.
    ///
    /// Parked queries are cancelled; their waiters observe `Closed`.
    pub async fn shutdown(self) {
        let MachineExecutor { handle, join } = self;
        let _ = handle.tasks.send(MachineTask::Shutdown);
        let _ = join.await;
    }
}

/// Cloneable handle to a running executor.
#[derive(Clone)]
pub struct MachineHandle {
    tasks: mpsc::UnboundedSender<MachineTask>,
    publisher: Arc<EventPublisher>,
}

impl MachineHandle {
    /// Apply a committed entry at its log index.
    pub async fn apply(&self, index: u64, entry: LogEntry) -> TrellisResult<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Apply { index, entry, reply })?;
        rx.await.map_err(|_| TrellisError::Closed)?
    }

    /// Submit a query, waiting if its required version is not applied yet.
    pub async fn query(
        &self,
        session_id: u64,
        version: u64,
        timestamp: LogTime,
        payload: Bytes,
    ) -> TrellisResult<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Query {
            session_id,
            version,
            timestamp,
            payload,
            reply,
        })?;
        rx.await.map_err(|_| TrellisError::Closed)?
    }

    /// Decide whether an entry survives compaction.
    pub async fn filter(
        &self,
        index: u64,
        entry: LogEntry,
        compaction: Compaction,
    ) -> TrellisResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Filter {
            index,
            entry,
            compaction,
            reply,
        })?;
        rx.await.map_err(|_| TrellisError::Closed)
    }

    /// Snapshot the applied index, session set, and machine state.
    pub async fn snapshot(&self) -> TrellisResult<MachineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Snapshot { reply })?;
        rx.await.map_err(|_| TrellisError::Closed)
    }

    /// Replace all state from a snapshot.
    pub async fn restore(&self, snapshot: MachineSnapshot) -> TrellisResult<()> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Restore { snapshot, reply })?;
        rx.await.map_err(|_| TrellisError::Closed)
    }

    /// Executor statistics.
    pub async fn stats(&self) -> TrellisResult<CoreStats> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineTask::Stats { reply })?;
        rx.await.map_err(|_| TrellisError::Closed)
    }

    /// Open the event delivery channel for a session.
    pub fn subscribe(&self, session_id: u64) -> mpsc::UnboundedReceiver<Bytes> {
        self.publisher.subscribe(session_id)
    }

    /// Drop a session's event delivery channel.
    pub fn unsubscribe(&self, session_id: u64) {
        self.publisher.unsubscribe(session_id);
    }

    /// The event publisher.
    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    fn post(&self, task: MachineTask) -> TrellisResult<()> {
        self.tasks.send(task).map_err(|_| TrellisError::Closed)
    }
}

/// Executor task body: drain the queue, run each item on the core, and
/// flush events the user machine emitted before answering the caller.
async fn run<M: StateMachine>(
    mut core: ApplyCore<M>,
    mut tasks: mpsc::UnboundedReceiver<MachineTask>,
    publisher: Arc<EventPublisher>,
) {
    while let Some(task) = tasks.recv().await {
        match task {
            MachineTask::Apply {
                index,
                entry,
                reply,
            } => {
                let outcome = core.apply(index, entry);
                flush_events(&mut core, &publisher);
                let _ = reply.send(outcome);
            }
            MachineTask::Query {
                session_id,
                version,
                timestamp,
                payload,
                reply,
            } => {
                core.submit_query(PendingQuery {
                    session_id,
                    version,
                    timestamp,
                    payload,
                    reply: Some(reply),
                });
                flush_events(&mut core, &publisher);
            }
            MachineTask::Filter {
                index,
                entry,
                compaction,
                reply,
            } => {
                let keep = core.filter(index, &entry, &compaction);
                let _ = reply.send(keep);
            }
            MachineTask::Snapshot { reply } => {
                let _ = reply.send(core.snapshot());
            }
            MachineTask::Restore { snapshot, reply } => {
                core.restore(snapshot);
                let _ = reply.send(());
            }
            MachineTask::Stats { reply } => {
                let _ = reply.send(core.stats());
            }
            MachineTask::Shutdown => break,
        }
    }
    tracing::debug!("machine executor stopped");
}

fn flush_events<M: StateMachine>(core: &mut ApplyCore<M>, publisher: &EventPublisher) {
    for event in core.drain_events() {
        publisher.publish(event);
    }
}
