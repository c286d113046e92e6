//! Live Client Connections
//!
//! A [`Connection`] is the gateway-side handle of one open transport. It owns
//! the outbound queue feeding the transport writer task, the heartbeat
//! bookkeeping used by [`crate::health`], and the connection state machine:
//!
//! ```text
//! CONNECTING ──▶ OPEN ──▶ HEALTHY ◀──▶ DEGRADED
//!                  │         │            │
//!                  └─────────┴─────┬──────┘
//!                                  ▼
//!                               CLOSING ──▶ CLOSED
//! ```
//!
//! `CLOSED` is reachable from every state. A connection belongs to exactly
//! one user for its whole life; its conversation binding may change.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::ErrorKind;
use crate::messages::DeliveryMessage;

/// Outstanding pings remembered for pong matching
const MAX_OUTSTANDING_PINGS: usize = 4;

/// Unique identifier for a client connection
///
/// Each connection is assigned a unique ID when it connects.
/// This ID is stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport upgrade in progress
    Connecting,
    /// Upgraded, no heartbeat verdict yet
    Open,
    /// Heartbeats acknowledged in time
    Healthy,
    /// Missed a heartbeat window
    Degraded,
    /// Close initiated
    Closing,
    /// Gone; terminal
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Closing, Connecting, Degraded, Healthy, Open};
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Connecting, Open)
            | (Open | Degraded, Healthy)
            | (Open | Healthy, Degraded)
            | (Connecting | Open | Healthy | Degraded, Closing) => true,
            _ => false,
        }
    }

    /// Closing or closed
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Frame queued for the transport writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text frame
    Text(Arc<str>),
    /// Close the transport
    Close {
        /// Reason sent with the close frame
        reason: String,
    },
}

/// Failure sending to a single connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Writer side has gone away
    #[error("connection closed")]
    ConnectionClosed,

    /// Outbound queue stayed full for the whole send timeout
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl TransportError {
    /// Taxonomy classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransportFailure
    }
}

#[derive(Debug, Default)]
struct HeartbeatTimes {
    outstanding: VecDeque<(i64, Instant)>,
    last_ping_sent: Option<Instant>,
    last_ack: Option<Instant>,
    last_rtt: Option<Duration>,
}

/// Gateway-side handle of one open transport
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    conversation_id: RwLock<Option<String>>,
    tx: mpsc::Sender<Outbound>,
    connected_at: Instant,
    heartbeat: Mutex<HeartbeatTimes>,
    messages_sent: AtomicU64,
    state: Mutex<ConnectionState>,
    monitor: Mutex<Option<AbortHandle>>,
}

impl Connection {
    /// Create a connection in `CONNECTING` state
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            conversation_id: RwLock::new(conversation_id),
            tx,
            connected_at: Instant::now(),
            heartbeat: Mutex::new(HeartbeatTimes::default()),
            messages_sent: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Connecting),
            monitor: Mutex::new(None),
        }
    }

    /// Create an `OPEN` connection plus the receiving end of its queue
    #[must_use]
    pub fn open(
        user_id: impl Into<String>,
        conversation_id: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Arc::new(Self::new(user_id, conversation_id, tx));
        connection.transition(ConnectionState::Open);
        (connection, rx)
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Owning user
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Conversation currently bound, if any
    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.conversation_id.read().clone()
    }

    /// Only the registry rebinds, so both indexes stay in step
    pub(crate) fn set_conversation_id(&self, conversation_id: Option<String>) {
        *self.conversation_id.write() = conversation_id;
    }

    /// When the transport was upgraded
    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Messages successfully queued to this connection
    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if legal; returns whether the state changed
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let current = *state;
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            tracing::debug!(connection_id = %self.id, from = ?current, to = ?next, "Ignoring invalid state transition");
            return false;
        }
        *state = next;
        tracing::debug!(connection_id = %self.id, from = ?current, to = ?next, "Connection state changed");
        true
    }

    /// Whether the writer side is still attached
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.state().is_shutting_down()
    }

    /// Queue a serialized frame, waiting at most `timeout` for queue space
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the writer is gone or the connection is closing,
    /// `SendTimeout` if the queue stayed full.
    pub async fn send_frame(&self, frame: Arc<str>, timeout: Duration) -> Result<(), TransportError> {
        if self.state().is_shutting_down() {
            return Err(TransportError::ConnectionClosed);
        }
        match tokio::time::timeout(timeout, self.tx.send(Outbound::Text(frame))).await {
            Ok(Ok(())) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::SendTimeout(timeout)),
        }
    }

    /// Serialize and queue a message
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send_frame`], plus `Encode`.
    pub async fn send_message(
        &self,
        message: &DeliveryMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let json = message
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_frame(Arc::from(json), timeout).await
    }

    /// Ask the writer to close the transport
    ///
    /// Best effort: a full or closed queue is not an error, the writer goes
    /// away when its receiver is dropped anyway.
    pub fn close(&self, reason: &str) {
        self.transition(ConnectionState::Closing);
        let _ = self.tx.try_send(Outbound::Close {
            reason: reason.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Heartbeat bookkeeping
    // -------------------------------------------------------------------------

    /// Remember a ping carrying `timestamp` was just sent
    pub fn record_ping_sent(&self, timestamp: i64) {
        let mut hb = self.heartbeat.lock();
        let now = Instant::now();
        hb.outstanding.push_back((timestamp, now));
        while hb.outstanding.len() > MAX_OUTSTANDING_PINGS {
            hb.outstanding.pop_front();
        }
        hb.last_ping_sent = Some(now);
    }

    /// Record a pong; returns the round-trip time if it matches a sent ping
    ///
    /// Matching a ping also retires every older outstanding ping.
    pub fn record_pong(&self, timestamp: i64) -> Option<Duration> {
        let mut hb = self.heartbeat.lock();
        let position = hb.outstanding.iter().position(|(ts, _)| *ts == timestamp)?;
        let (_, sent_at) = hb.outstanding[position];
        hb.outstanding.drain(..=position);

        let rtt = sent_at.elapsed();
        hb.last_ack = Some(Instant::now());
        hb.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Time since the last acknowledged ping (or since connect, if none)
    #[must_use]
    pub fn last_ack_age(&self) -> Duration {
        self.heartbeat
            .lock()
            .last_ack
            .unwrap_or(self.connected_at)
            .elapsed()
    }

    /// When the last ping was sent
    #[must_use]
    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.heartbeat.lock().last_ping_sent
    }

    /// When the last matching pong arrived
    #[must_use]
    pub fn last_ack(&self) -> Option<Instant> {
        self.heartbeat.lock().last_ack
    }

    /// Most recent round-trip time
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.heartbeat.lock().last_rtt
    }

    // -------------------------------------------------------------------------
    // Monitor task
    // -------------------------------------------------------------------------

    /// Attach the health monitor task so eviction can stop it
    pub fn attach_monitor(&self, handle: AbortHandle) {
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the health monitor task, if any
    pub fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }

    /// Whether a monitor is attached
    #[must_use]
    pub fn has_monitor(&self) -> bool {
        self.monitor.lock().is_some()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("conversation_id", &*self.conversation_id.read())
            .field("state", &self.state())
            .field("messages_sent", &self.messages_sent())
            .finish_non_exhaustive()
    }
}
