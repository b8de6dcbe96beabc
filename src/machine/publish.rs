//! Session event publisher.
//!
//! The user state machine may emit events addressed to a session (a
//! leadership change notification, for instance). The decision to emit is
//! deterministic and happens on every replica; delivery happens only where
//! the session's connection is actually open, and is best-effort. A client
//! that misses events detects staleness through its version watermark and
//! re-queries on resume.

use crate::machine::state_machine::SessionEvent;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Best-effort event fan-out keyed by session id.
#[derive(Debug, Default)]
pub struct EventPublisher {
    /// Delivery channels for sessions with an open connection here.
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>,

    /// Events handed to a live channel.
    delivered: AtomicU64,

    /// Events with no live channel.
    dropped: AtomicU64,
}

impl EventPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a delivery channel for a session, replacing any prior one.
    pub fn subscribe(&self, session_id: u64) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(session_id, tx);
        rx
    }

    /// Drop a session's delivery channel.
    pub fn unsubscribe(&self, session_id: u64) {
        self.subscribers.lock().remove(&session_id);
    }

    /// Deliver an event to its session, if a channel is open.
    ///
    /// A session with no channel, or whose receiver has gone away, loses
    /// the event; dead channels are pruned as they are discovered.
    pub fn publish(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get(&event.session_id) {
            Some(tx) => {
                if tx.send(event.payload).is_ok() {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    subscribers.remove(&event.session_id);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of open delivery channels.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publisher statistics.
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            subscribers: self.subscribers.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Event publisher statistics.
#[derive(Debug, Clone)]
pub struct PublisherStats {
    /// Open delivery channels.
    pub subscribers: usize,
    /// Events handed to a live channel.
    pub delivered: u64,
    /// Events lost for lack of a live channel.
    pub dropped: u64,
}
