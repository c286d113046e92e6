//! Delivery Broadcaster
//!
//! Fans one logical [`DeliveryMessage`] out to every connection of a user or
//! a conversation. The message is serialized once, each connection gets an
//! independent time-bounded send, and one dead connection never blocks or
//! fails delivery to the others.
//!
//! ```text
//! deliver(scope, msg)
//!   ├─ snapshot recipients from the registry
//!   ├─ serialize once, truncating content over the payload limit
//!   ├─ send to all concurrently, each bounded by send_timeout
//!   └─ evict every connection whose send failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use crate::connection::ConnectionId;
use crate::error::ErrorKind;
use crate::messages::{DeliveryMessage, DeliveryScope};
use crate::registry::ConnectionRegistry;

/// Appended to content cut by the payload guard
pub const TRUNCATION_MARKER: &str = "… [truncated]";

/// Delivery tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Bound on each individual send (default: 5 seconds)
    pub send_timeout: Duration,
    /// Largest serialized frame (default: 64 KiB)
    pub max_payload_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            max_payload_bytes: 65_536,
        }
    }
}

/// Delivery failure for a whole scope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Nobody is registered under the scope
    #[error("no connections for {scope}")]
    NoRecipients {
        /// Scope that resolved to nothing
        scope: String,
    },

    /// Every attempted send failed
    #[error("delivery to all {attempted} connections of {scope} failed")]
    AllFailed {
        /// Target scope
        scope: String,
        /// Connections attempted
        attempted: usize,
    },

    /// Message has no content to cut and is over the limit
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Serialized size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Serialization failed
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// Taxonomy classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PayloadTooLarge { .. } => ErrorKind::InvalidRequest,
            Self::NoRecipients { .. } | Self::AllFailed { .. } | Self::Encode(_) => {
                ErrorKind::TransportFailure
            }
        }
    }
}

/// Per-connection outcome of one delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Connections that accepted the message
    pub successful: usize,
    /// Connections that failed and were evicted
    pub failed: usize,
    /// IDs of the evicted connections
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if no recipients received the message
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.successful == 0
    }
}

/// Serialize `message`, cutting its content so the frame fits `max_bytes`
///
/// Content is cut on a character boundary and [`TRUNCATION_MARKER`] is
/// appended. JSON escaping makes frame size nonlinear in content length, so
/// the longest prefix that fits is found by binary search.
///
/// # Errors
///
/// `PayloadTooLarge` when the message has no content field or would not fit
/// even with empty content.
pub fn guard_payload(message: &DeliveryMessage, max_bytes: usize) -> Result<String, DeliveryError> {
    let json = encode(message)?;
    if json.len() <= max_bytes {
        return Ok(json);
    }

    let too_large = DeliveryError::PayloadTooLarge {
        size: json.len(),
        limit: max_bytes,
    };
    let mut template = message.clone();
    let original = match template.content_mut() {
        Some(content) => std::mem::take(content),
        None => return Err(too_large),
    };

    let render = |cut: usize| {
        let mut candidate = template.clone();
        if let Some(content) = candidate.content_mut() {
            *content = format!("{}{TRUNCATION_MARKER}", &original[..cut]);
        }
        encode(&candidate)
    };

    // Prefix lengths that end on a character boundary, shortest first
    let boundaries: Vec<usize> = original.char_indices().map(|(i, _)| i).collect();
    let mut best = None;
    let (mut lo, mut hi) = (0, boundaries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let candidate = render(boundaries[mid])?;
        if candidate.len() <= max_bytes {
            best = Some(candidate);
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    let truncated = best.ok_or(too_large)?;
    tracing::debug!(
        original_bytes = json.len(),
        truncated_bytes = truncated.len(),
        limit = max_bytes,
        "Truncated oversized payload"
    );
    Ok(truncated)
}

fn encode(message: &DeliveryMessage) -> Result<String, DeliveryError> {
    message
        .to_json()
        .map_err(|e| DeliveryError::Encode(e.to_string()))
}

/// Scoped fan-out over the registry
#[derive(Clone, Debug)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    config: DeliveryConfig,
}

impl Broadcaster {
    /// Broadcaster over `registry`
    #[must_use]
    pub fn new(registry: ConnectionRegistry, config: DeliveryConfig) -> Self {
        Self { registry, config }
    }

    /// Delivery configuration
    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Deliver to every connection of `user_id`
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::deliver`].
    pub async fn send_to_user(
        &self,
        message: &DeliveryMessage,
        user_id: &str,
    ) -> Result<BroadcastResult, DeliveryError> {
        self.deliver(&DeliveryScope::User(user_id.to_string()), message)
            .await
    }

    /// Deliver to every connection bound to `conversation_id`
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::deliver`].
    pub async fn send_to_conversation(
        &self,
        message: &DeliveryMessage,
        conversation_id: &str,
    ) -> Result<BroadcastResult, DeliveryError> {
        self.deliver(&DeliveryScope::Conversation(conversation_id.to_string()), message)
            .await
    }

    /// Deliver `message` to every connection in `scope`
    ///
    /// Succeeds when at least one connection accepted the message. Every
    /// connection whose send failed or timed out is closed and unregistered
    /// once the whole batch has been attempted.
    ///
    /// # Errors
    ///
    /// `NoRecipients` for an empty scope, `AllFailed` when no send
    /// succeeded, `PayloadTooLarge`/`Encode` from the payload guard.
    pub async fn deliver(
        &self,
        scope: &DeliveryScope,
        message: &DeliveryMessage,
    ) -> Result<BroadcastResult, DeliveryError> {
        let recipients = match scope {
            DeliveryScope::User(user_id) => self.registry.connections_for_user(user_id),
            DeliveryScope::Conversation(conversation_id) => {
                self.registry.connections_for_conversation(conversation_id)
            }
        };
        if recipients.is_empty() {
            return Err(DeliveryError::NoRecipients {
                scope: scope.to_string(),
            });
        }

        let frame: Arc<str> = Arc::from(guard_payload(message, self.config.max_payload_bytes)?);
        let timeout = self.config.send_timeout;

        let outcomes = join_all(recipients.iter().map(|connection| {
            let frame = Arc::clone(&frame);
            async move { (connection.id(), connection.send_frame(frame, timeout).await) }
        }))
        .await;

        let mut result = BroadcastResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        scope = %scope,
                        message_type = message.type_name(),
                        error = %e,
                        "Delivery failed, evicting connection"
                    );
                    result.failed += 1;
                    result.failed_ids.push(id);
                }
            }
        }

        for id in &result.failed_ids {
            if let Some(connection) = self.registry.get(*id) {
                connection.close("delivery failed");
            }
            self.registry.unregister(*id);
        }

        tracing::trace!(
            scope = %scope,
            message_type = message.type_name(),
            successful = result.successful,
            failed = result.failed,
            "Delivered"
        );

        if result.all_failed() {
            return Err(DeliveryError::AllFailed {
                scope: scope.to_string(),
                attempted: result.failed,
            });
        }
        Ok(result)
    }
}
