//! Error taxonomy shared by every gateway component
//!
//! Each component boundary has its own `thiserror` enum (see
//! [`crate::runtime::LoadError`], [`crate::inference::AdmissionError`],
//! [`crate::connection::TransportError`], [`crate::broadcast::DeliveryError`]).
//! They all map onto a single [`ErrorKind`] so callers can decide how to
//! propagate a failure without matching on every concrete variant.
//!
//! # Propagation Policy
//!
//! | Kind                | Visible to the client as            |
//! |---------------------|-------------------------------------|
//! | `LoadFailure`       | `error` event ("service unavailable") |
//! | `ResourceExhausted` | `error` event ("service unavailable") |
//! | `Overloaded`        | `error` event                       |
//! | `InvalidRequest`    | `error` event                       |
//! | `TimedOut`          | labeled degraded `end` event        |
//! | `GenerationFailed`  | labeled degraded `end` event        |
//! | `TransportFailure`  | nothing (offending connection evicted) |
//! | `StaleConnection`   | nothing (offending connection evicted) |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of every failure the gateway can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Model could not be loaded (missing artifact, unsupported environment)
    LoadFailure,
    /// Out of memory during load or generation
    ResourceExhausted,
    /// Concurrency ceiling reached with no queuing slot
    Overloaded,
    /// Per-request deadline exceeded
    TimedOut,
    /// The blocking model call itself failed
    GenerationFailed,
    /// Request refused before admission
    InvalidRequest,
    /// A single connection's send or receive failed
    TransportFailure,
    /// Connection evicted by the health monitor
    StaleConnection,
}

impl ErrorKind {
    /// Stable wire code, used as the `code` field of `error` events
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::LoadFailure => "load_failure",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Overloaded => "overloaded",
            Self::TimedOut => "timed_out",
            Self::GenerationFailed => "generation_failed",
            Self::InvalidRequest => "invalid_request",
            Self::TransportFailure => "transport_failure",
            Self::StaleConnection => "stale_connection",
        }
    }

    /// Whether the failure means the model service is unusable right now
    #[must_use]
    pub fn is_service_unavailable(self) -> bool {
        matches!(self, Self::LoadFailure | Self::ResourceExhausted)
    }

    /// Whether the failure is converted into a degraded textual response
    /// instead of an `error` event
    #[must_use]
    pub fn degrades_response(self) -> bool {
        matches!(self, Self::TimedOut | Self::GenerationFailed)
    }

    /// Whether the failure is handled locally and never reaches a client
    #[must_use]
    pub fn is_connection_local(self) -> bool {
        matches!(self, Self::TransportFailure | Self::StaleConnection)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
