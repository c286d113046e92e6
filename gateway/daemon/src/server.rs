//! Daemon Server Implementation
//!
//! This module provides the core server loop for the gateway daemon:
//! - Accepts TCP connections and performs the WebSocket upgrade
//! - Registers each client in the shared ConnectionRegistry
//! - Spawns a writer task, a heartbeat monitor and a reader loop per client
//! - Supports graceful shutdown
//!
//! # Per-Connection Tasks
//!
//! ```text
//!   WebSocket ──▶ reader loop ──▶ ChatOrchestrator ──▶ Broadcaster
//!                     │              (chat requests                │
//!                     │               run as their own task)       │
//!                     ▼                                            ▼
//!              HealthMonitor ─── ping ──▶ Connection queue ──▶ writer task ──▶ WebSocket
//! ```
//!
//! Identity comes from the upgrade request: `/?user=<id>&conversation=<id>`.
//! The daemon does not authenticate; a missing `user` is refused with 400.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn, Instrument};

use gateway_core::{
    AdmissionController, Broadcaster, ChatOrchestrator, ClientMessage, Connection,
    ConnectionRegistry, GatewayConfig, HealthMonitor, InMemorySessionStore, Outbound,
};

/// How long a closing writer may take to flush its queue
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Connection state tracking (internal to server, separate from `Connection`)
struct ConnectionState {
    /// When the TCP connection was accepted
    connected_at: Instant,
    /// Handle to abort the connection task
    abort_handle: Option<tokio::task::AbortHandle>,
}

/// Who is connecting, taken from the upgrade request query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Owning user
    pub user_id: String,
    /// Conversation to bind to, if any
    pub conversation_id: Option<String>,
}

impl Identity {
    /// Parse `user=..&conversation=..` from a request query string
    ///
    /// Values are percent-decoded; a value that does not decode to UTF-8
    /// counts as absent.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let mut user_id = None;
        let mut conversation_id = None;
        for pair in query.unwrap_or_default().split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = urlencoding::decode(value) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "user" => user_id = Some(value.into_owned()),
                "conversation" => conversation_id = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(Self {
            user_id: user_id?,
            conversation_id,
        })
    }
}

/// Components shared by every connection task
#[derive(Clone)]
struct Shared {
    registry: ConnectionRegistry,
    orchestrator: ChatOrchestrator,
    monitor: HealthMonitor,
    outbound_queue: usize,
}

/// The main daemon server
pub struct DaemonServer {
    config: GatewayConfig,
    shared: Shared,
    /// Active connection state keyed by peer address
    connection_states: Arc<DashMap<SocketAddr, ConnectionState>>,
}

impl DaemonServer {
    /// Wire every gateway component from a resolved configuration
    pub fn new(config: GatewayConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let admission = Arc::new(AdmissionController::new(
            config.admission.clone(),
            config.model.loader(),
        ));
        let monitor = HealthMonitor::new(config.heartbeat.clone(), registry.clone());
        let orchestrator = ChatOrchestrator::new(
            admission,
            registry.clone(),
            Broadcaster::new(registry.clone(), config.delivery.clone()),
            monitor.clone(),
            Arc::new(InMemorySessionStore::new()),
            config.model.orchestrator_config(),
        );

        Self {
            shared: Shared {
                registry,
                orchestrator,
                monitor,
                outbound_queue: config.server.outbound_queue,
            },
            config,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Bind the configured address and serve until `shutdown` is raised
    pub async fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.bind)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.server.bind))?;
        self.serve(listener, shutdown, reload_config).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &mut self,
        listener: TcpListener,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()> {
        let local_addr = listener.local_addr().context("Listener has no address")?;
        info!(
            addr = %local_addr,
            runtime = %self.config.model.runtime,
            model = %self.config.model.model,
            max_concurrent = self.config.admission.max_concurrent,
            "Listening for WebSocket connections"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            if reload_config.swap(false, Ordering::SeqCst) {
                self.report_reload();
            }

            // Accept with timeout to allow checking the flags
            let (stream, peer) =
                match tokio::time::timeout(Duration::from_millis(100), listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                    Err(_) => continue,
                };

            if self.connection_states.len() >= self.config.server.max_connections {
                warn!(
                    %peer,
                    max_connections = self.config.server.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            // Insert before spawning: the task removes its own entry when it ends
            self.connection_states.insert(
                peer,
                ConnectionState {
                    connected_at: Instant::now(),
                    abort_handle: None,
                },
            );
            let shared = self.shared.clone();
            let connection_states = Arc::clone(&self.connection_states);
            let task = tokio::spawn(async move {
                Self::handle_connection(stream, peer, shared).await;
                connection_states.remove(&peer);
            });
            if let Some(mut state) = self.connection_states.get_mut(&peer) {
                state.abort_handle = Some(task.abort_handle());
            }
            debug!(%peer, active = self.connection_states.len(), "TCP connection accepted");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Upgrade, register, and pump frames until the client goes away
    async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Shared) {
        let mut identity = None;
        let upgrade = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                match Identity::from_query(request.uri().query()) {
                    Some(parsed) => {
                        identity = Some(parsed);
                        Ok(response)
                    }
                    None => {
                        let mut refusal = ErrorResponse::new(Some("missing user".to_string()));
                        *refusal.status_mut() = StatusCode::BAD_REQUEST;
                        Err(refusal)
                    }
                }
            },
        )
        .await;

        let ws = match upgrade {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let Some(identity) = identity else {
            return;
        };

        let (connection, outbound) = Connection::open(
            identity.user_id,
            identity.conversation_id,
            shared.outbound_queue,
        );
        let span = tracing::info_span!("connection", id = %connection.id());
        Self::run_connection(ws, connection, outbound, peer, shared)
            .instrument(span)
            .await;
    }

    async fn run_connection(
        ws: WebSocketStream<TcpStream>,
        connection: Arc<Connection>,
        outbound: mpsc::Receiver<Outbound>,
        peer: SocketAddr,
        shared: Shared,
    ) {
        if !shared.registry.register(&connection) {
            warn!("Connection id already registered");
            return;
        }
        info!(
            %peer,
            user_id = %connection.user_id(),
            conversation_id = ?connection.conversation_id(),
            active_connections = shared.registry.len(),
            "Client connected"
        );
        shared.monitor.spawn(&connection);

        let (sink, mut source) = ws.split();
        let writer = tokio::spawn(Self::write_frames(sink, outbound).in_current_span());
        // Dropped with this task, so an aborted connection takes its chats along
        let mut chats = JoinSet::new();

        while let Some(frame) = source.next().await {
            while chats.try_join_next().is_some() {}
            match frame {
                Ok(Message::Text(text)) => {
                    Self::dispatch(&shared.orchestrator, &connection, &text, &mut chats).await;
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Client sent close");
                    break;
                }
                Ok(Message::Binary(_)) => {
                    debug!("Ignoring binary frame");
                }
                // Protocol pings are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => {
                    debug!(error = %e, "Read error");
                    break;
                }
            }

            if !connection.is_connected() {
                debug!("Connection closed by the gateway");
                break;
            }
        }

        connection.close("client disconnected");
        shared.registry.unregister(connection.id());

        if !chats.is_empty() {
            debug!(in_flight = chats.len(), "Cancelling chats of a closed connection");
            chats.abort_all();
        }

        let writer_abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
            writer_abort.abort();
        }

        info!(
            messages_sent = connection.messages_sent(),
            connected_for_secs = connection.connected_at().elapsed().as_secs(),
            active_connections = shared.registry.len(),
            "Client disconnected"
        );
    }

    /// Route one text frame
    ///
    /// Chat requests run as their own task in `chats` so pongs and typing
    /// events keep flowing while a response streams.
    async fn dispatch(
        orchestrator: &ChatOrchestrator,
        connection: &Arc<Connection>,
        text: &str,
        chats: &mut JoinSet<()>,
    ) {
        match ClientMessage::parse(text) {
            Ok(message @ ClientMessage::Message { .. }) => {
                let orchestrator = orchestrator.clone();
                let connection = Arc::clone(connection);
                chats.spawn(
                    async move {
                        orchestrator
                            .handle_client_message(&connection, message)
                            .await;
                    }
                    .in_current_span(),
                );
            }
            Ok(message) => orchestrator.handle_client_message(connection, message).await,
            Err(e) => orchestrator.reject_frame(connection, &e).await,
        }
    }

    /// Drain the connection's outbound queue into the socket
    async fn write_frames<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>)
    where
        S: futures::Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.to_string())).await {
                        debug!(error = %e, "Write error");
                        break;
                    }
                }
                Outbound::Close { reason } => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(close))).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    break;
                }
            }
        }
    }

    fn report_reload(&self) {
        let summary = self.shared.registry.summary();
        let stats = self.shared.orchestrator.admission().stats();
        info!(
            config_path = ?self.config.config_file_path,
            connections = summary.total_connections,
            users = summary.users,
            conversations = summary.conversations,
            in_flight = stats.in_flight,
            queued = stats.queued,
            "Config reload requested; restart the daemon to apply file changes"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");

        let closed = self.shared.registry.close_all("server shutting down");
        info!(closed, "Closed client connections");

        // Give writers a moment to flush close frames
        tokio::time::sleep(Duration::from_millis(100)).await;

        let peers: Vec<SocketAddr> = self.connection_states.iter().map(|r| *r.key()).collect();
        for peer in peers {
            if let Some((_, state)) = self.connection_states.remove(&peer) {
                debug!(
                    %peer,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection task"
                );
                if let Some(handle) = state.abort_handle {
                    handle.abort();
                }
            }
        }

        let stats = self.shared.orchestrator.admission().stats();
        info!(
            admitted = stats.admitted,
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            rejected = stats.rejected,
            "Shutdown complete"
        );
    }

    /// Number of accepted TCP connections still being served
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}
