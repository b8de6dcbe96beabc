//! Client-side session state.
//!
//! Three counters implement the exactly-once contract with the server:
//! `request` is the monotonic sequence keying the server's response cache,
//! `response` acknowledges delivered results so the server can trim that
//! cache, and `version` is the highest applied index observed, bounding
//! query staleness. All three belong to one session; adopting a new
//! session resets them.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Watermarks and identity for the client's current session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current session id; zero means unregistered.
    pub session_id: u64,

    /// Last assigned outgoing request number.
    pub request: u64,

    /// Highest request number acknowledged as delivered.
    pub response: u64,

    /// Highest applied index observed from any server response.
    pub version: u64,

    /// Whether the client is open for submissions.
    pub open: bool,
}

impl SessionState {
    /// Assign the next request number.
    pub fn next_request_no(&mut self) -> u64 {
        self.request += 1;
        self.request
    }

    /// Acknowledge a delivered result.
    pub fn acknowledge(&mut self, request_no: u64) {
        if request_no > self.response {
            self.response = request_no;
        }
    }

    /// Observe an applied index from a server response; never decreases.
    pub fn observe_version(&mut self, version: u64) {
        if version > self.version {
            self.version = version;
        }
    }

    /// Adopt a freshly registered session, restarting all watermarks.
    pub fn adopt(&mut self, session_id: u64) {
        self.session_id = session_id;
        self.request = 0;
        self.response = 0;
        self.version = 0;
    }

    /// Forget the session after the server reported it unknown.
    pub fn reset(&mut self) {
        self.session_id = 0;
    }
}

/// Fan-out of server-pushed events to client subscribers.
///
/// Delivery is best-effort end to end; a subscriber that falls away is
/// pruned on the next broadcast.
#[derive(Debug, Default)]
pub struct EventListeners {
    senders: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl EventListeners {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver an event payload to every live subscriber.
    pub fn broadcast(&self, payload: Bytes) {
        self.senders
            .lock()
            .retain(|tx| tx.send(payload.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    /// Check whether anyone is listening.
    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }
}
