//! Heartbeat-Based Connection Health
//!
//! Every registered connection gets its own monitoring task whose lifetime is
//! the connection's lifetime.
//!
//! # Protocol
//!
//! 1. The gateway sends `{"type":"ping","timestamp":T}` every `interval`
//! 2. The client answers `{"type":"pong","timestamp":T}` echoing `T`
//! 3. The matching pong records the ack time and round-trip latency
//! 4. A connection whose last ack is older than `interval × stale_multiplier`
//!    is evicted, unless it is still inside the grace period after connect
//!
//! Missing one window (`interval × 1.5` without an ack) moves the connection
//! to `DEGRADED`; the next matching pong moves it back to `HEALTHY`. Latency
//! above the warn threshold is logged but never fatal.
//!
//! Eviction closes the transport, unregisters the connection (which aborts
//! this very task) and emits [`HeartbeatEvent::Evicted`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::connection::{Connection, ConnectionId, ConnectionState, TransportError};
use crate::error::ErrorKind;
use crate::messages::{now_millis, DeliveryMessage};
use crate::registry::ConnectionRegistry;

/// Configuration for heartbeat behavior
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatConfig {
    /// Interval between pings (default: 30 seconds)
    pub interval: Duration,
    /// Last-ack age, in intervals, after which a connection is stale (default: 2.5)
    pub stale_multiplier: f64,
    /// Time after connect during which a connection is never evicted (default: 60 seconds)
    pub grace_period: Duration,
    /// Round-trip time above which a warning is logged (default: 1 second)
    pub latency_warn_threshold: Duration,
    /// Bound on queueing a single ping (default: 5 seconds)
    pub send_timeout: Duration,
    /// Whether monitoring runs at all
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_multiplier: 2.5,
            grace_period: Duration::from_secs(60),
            latency_warn_threshold: Duration::from_millis(1000),
            send_timeout: Duration::from_secs(5),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeat switched off
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Short intervals for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            stale_multiplier: 2.5,
            grace_period: Duration::from_millis(200),
            latency_warn_threshold: Duration::from_millis(50),
            send_timeout: Duration::from_millis(50),
            enabled: true,
        }
    }

    /// Set the ping interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the stale multiplier
    #[must_use]
    pub fn with_stale_multiplier(mut self, multiplier: f64) -> Self {
        self.stale_multiplier = multiplier;
        self
    }

    /// Set the grace period
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the latency warning threshold
    #[must_use]
    pub fn with_latency_warn_threshold(mut self, threshold: Duration) -> Self {
        self.latency_warn_threshold = threshold;
        self
    }

    /// Last-ack age beyond which a connection is evicted
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.interval.mul_f64(self.stale_multiplier)
    }

    /// Last-ack age beyond which a connection counts as degraded
    #[must_use]
    pub fn degraded_after(&self) -> Duration {
        self.interval.mul_f64(1.5)
    }
}

/// Events emitted by the monitor for observability
#[derive(Clone, Debug, PartialEq)]
pub enum HeartbeatEvent {
    /// A ping was queued
    PingSent {
        /// Target connection
        connection_id: ConnectionId,
        /// Timestamp carried by the ping
        timestamp: i64,
    },
    /// A matching pong arrived
    PongReceived {
        /// Source connection
        connection_id: ConnectionId,
        /// Round-trip time
        rtt: Duration,
    },
    /// Round-trip time exceeded the warning threshold
    HighLatency {
        /// Source connection
        connection_id: ConnectionId,
        /// Round-trip time
        rtt: Duration,
    },
    /// Connection moved between `HEALTHY` and `DEGRADED`
    HealthChanged {
        /// Affected connection
        connection_id: ConnectionId,
        /// New state
        state: ConnectionState,
    },
    /// Connection was evicted as stale
    Evicted {
        /// Evicted connection
        connection_id: ConnectionId,
        /// How long since the last ack (or connect)
        last_ack_age: Duration,
    },
}

/// Outcome of one health check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Acked within the window, or still in the grace period
    Healthy,
    /// Missed a window but not yet stale
    Degraded,
    /// Must be evicted
    Stale,
}

/// Spawns and drives per-connection heartbeat tasks
#[derive(Clone)]
pub struct HealthMonitor {
    config: HeartbeatConfig,
    registry: ConnectionRegistry,
    event_tx: Option<mpsc::UnboundedSender<HeartbeatEvent>>,
}

impl HealthMonitor {
    /// Monitor evicting through `registry`
    #[must_use]
    pub fn new(config: HeartbeatConfig, registry: ConnectionRegistry) -> Self {
        Self {
            config,
            registry,
            event_tx: None,
        }
    }

    /// Monitor plus a receiver for its events
    #[must_use]
    pub fn with_events(
        config: HeartbeatConfig,
        registry: ConnectionRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<HeartbeatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            config,
            registry,
            event_tx: Some(tx),
        };
        (monitor, rx)
    }

    /// Heartbeat configuration
    #[must_use]
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start the monitoring task for `connection`
    ///
    /// The task's abort handle is attached to the connection, so
    /// unregistering the connection stops the task. Returns `None` when
    /// heartbeat is disabled.
    pub fn spawn(&self, connection: &Arc<Connection>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            return None;
        }

        let monitor = self.clone();
        let conn = Arc::clone(connection);
        let span = tracing::info_span!("heartbeat", connection_id = %connection.id());
        let handle = tokio::spawn(async move { monitor.run(conn).await }.instrument(span));
        connection.attach_monitor(handle.abort_handle());
        Some(handle)
    }

    async fn run(self, connection: Arc<Connection>) {
        let id = connection.id();
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_timestamp = 0_i64;

        tracing::debug!(interval_ms = self.config.interval.as_millis() as u64, "Heartbeat started");

        loop {
            ticker.tick().await;

            if !self.registry.contains(id) || connection.state().is_shutting_down() {
                break;
            }

            if self.check(&connection) == HealthVerdict::Stale {
                self.evict(&connection);
                break;
            }

            // Strictly increasing so every outstanding ping is distinguishable
            let timestamp = now_millis().max(last_timestamp + 1);
            last_timestamp = timestamp;

            let ping = DeliveryMessage::Ping { timestamp };
            match connection.send_message(&ping, self.config.send_timeout).await {
                Ok(()) => {
                    connection.record_ping_sent(timestamp);
                    tracing::trace!(timestamp, "Ping sent");
                    self.emit(HeartbeatEvent::PingSent {
                        connection_id: id,
                        timestamp,
                    });
                }
                Err(TransportError::ConnectionClosed) => {
                    tracing::debug!("Transport gone, evicting");
                    self.evict(&connection);
                    break;
                }
                Err(e) => {
                    // Staleness decides; a slow reader may still catch up
                    tracing::warn!(error = %e, "Failed to queue ping");
                }
            }
        }

        tracing::debug!("Heartbeat stopped");
    }

    /// Judge `connection` and apply the `HEALTHY`/`DEGRADED` transition
    ///
    /// Eviction itself is left to the caller.
    pub fn check(&self, connection: &Connection) -> HealthVerdict {
        let verdict = self.assess(connection);
        if verdict == HealthVerdict::Degraded && connection.transition(ConnectionState::Degraded) {
            tracing::info!(
                connection_id = %connection.id(),
                last_ack_age_ms = connection.last_ack_age().as_millis() as u64,
                "Connection degraded"
            );
            self.emit(HeartbeatEvent::HealthChanged {
                connection_id: connection.id(),
                state: ConnectionState::Degraded,
            });
        }
        verdict
    }

    /// Judge `connection` without side effects
    #[must_use]
    pub fn assess(&self, connection: &Connection) -> HealthVerdict {
        if connection.connected_at().elapsed() < self.config.grace_period {
            return HealthVerdict::Healthy;
        }
        let age = connection.last_ack_age();
        if age > self.config.stale_after() {
            HealthVerdict::Stale
        } else if age > self.config.degraded_after() {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Healthy
        }
    }

    /// Close, unregister and report a stale connection
    pub fn evict(&self, connection: &Connection) {
        let id = connection.id();
        let last_ack_age = connection.last_ack_age();
        tracing::warn!(
            connection_id = %id,
            user_id = %connection.user_id(),
            last_ack_age_ms = last_ack_age.as_millis() as u64,
            code = ErrorKind::StaleConnection.code(),
            "Evicting stale connection"
        );

        self.emit(HeartbeatEvent::Evicted {
            connection_id: id,
            last_ack_age,
        });
        connection.close("heartbeat timeout");
        // Also aborts this connection's monitor task
        self.registry.unregister(id);
    }

    /// Record a pong from `connection`
    ///
    /// Returns the round-trip time when the timestamp matches an outstanding
    /// ping; unmatched pongs are ignored.
    pub fn handle_pong(&self, connection: &Connection, timestamp: i64) -> Option<Duration> {
        let id = connection.id();
        let Some(rtt) = connection.record_pong(timestamp) else {
            tracing::debug!(connection_id = %id, timestamp, "Ignoring unmatched pong");
            return None;
        };

        tracing::trace!(connection_id = %id, rtt_ms = rtt.as_millis() as u64, "Pong received");
        self.emit(HeartbeatEvent::PongReceived {
            connection_id: id,
            rtt,
        });

        if rtt > self.config.latency_warn_threshold {
            tracing::warn!(
                connection_id = %id,
                rtt_ms = rtt.as_millis() as u64,
                threshold_ms = self.config.latency_warn_threshold.as_millis() as u64,
                "High heartbeat latency"
            );
            self.emit(HeartbeatEvent::HighLatency {
                connection_id: id,
                rtt,
            });
        }

        if connection.transition(ConnectionState::Healthy) {
            self.emit(HeartbeatEvent::HealthChanged {
                connection_id: id,
                state: ConnectionState::Healthy,
            });
        }

        Some(rtt)
    }

    fn emit(&self, event: HeartbeatEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("has_events", &self.event_tx.is_some())
            .finish_non_exhaustive()
    }
}
