//! Gateway Core - Streaming Chat Inference Behind Persistent Connections
//!
//! This crate holds everything between a client's WebSocket and a blocking,
//! memory-heavy model runtime: admission control, the thread-to-async
//! streaming bridge, the live connection registry, heartbeat health
//! monitoring and fan-out delivery. The transport itself lives in the
//! `gateway-daemon` binary.
//!
//! # Architecture
//!
//! ```text
//!   client frames                                        delivery frames
//!        │                                                      ▲
//! ┌──────┼──────────────────────────────────────────────────────┼──────┐
//! │      ▼                                                      │      │
//! │ ┌─────────────────┐   ┌──────────────────────┐   ┌──────────┴────┐ │
//! │ │ ChatOrchestrator│──▶│ AdmissionController  │   │  Broadcaster  │ │
//! │ │ (one dispatch)  │   │ load · gate · budget │   │ timeout/evict │ │
//! │ └───────┬─────────┘   └──────────┬───────────┘   └──────┬────────┘ │
//! │         │      fragments         ▼                      │          │
//! │         │◀─────────────── Streaming Bridge              │          │
//! │         │                (bounded channel)              │          │
//! │         │                        ▲                      ▼          │
//! │         │               worker thread ──▶   ConnectionRegistry     │
//! │         │               ModelRuntime        user / conversation    │
//! │         └───────────────────────────────▶   indexes (one lock)     │
//! │                                                     ▲              │
//! │                                       HealthMonitor ┘ (evicts)     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`AdmissionController`]: lazy single-flight model load, priority
//!   concurrency gate, safe output length, per-request deadline
//! - [`bridge::spawn`](inference::bridge::spawn): blocking call on a worker
//!   thread, consumed as an async stream
//! - [`ConnectionRegistry`]: authoritative user/conversation index
//! - [`HealthMonitor`]: per-connection ping loop and stale eviction
//! - [`Broadcaster`]: scoped fan-out with per-send timeout and payload guard
//! - [`ChatOrchestrator`]: routes [`ClientMessage`]s, guarantees one
//!   terminal event per chat request

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod inference;
pub mod messages;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod session;

pub use broadcast::{BroadcastResult, Broadcaster, DeliveryConfig, DeliveryError};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GatewayConfig, ModelConfig, RuntimeKind, ServerConfig,
};
pub use connection::{Connection, ConnectionId, ConnectionState, Outbound, TransportError};
pub use error::ErrorKind;
pub use health::{HealthMonitor, HealthVerdict, HeartbeatConfig, HeartbeatEvent};
pub use inference::{
    AdmissionConfig, AdmissionController, AdmissionError, AdmissionStats, GenerationFragment,
    GenerationRequest, GenerationStream, OverloadPolicy, Priority, RequestState,
};
pub use messages::{ClientMessage, DeliveryMessage, DeliveryScope, MessageId};
pub use orchestrator::{ChatOrchestrator, ChatOutcome, ChatRequest, OrchestratorConfig};
pub use registry::{ConnectionRegistry, RegistrySummary};
pub use runtime::{
    Emission, GenerationParams, LoadError, ModelLoader, ModelRuntime, RuntimeError,
};
pub use session::{InMemorySessionStore, Role, SessionError, SessionStore, Turn};
