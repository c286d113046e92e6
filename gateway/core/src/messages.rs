//! Wire Messages
//!
//! JSON objects exchanged with clients, discriminated by a required `type`
//! field. Outbound traffic is a [`DeliveryMessage`]; inbound traffic is a
//! [`ClientMessage`]. Both are closed enums so every dispatch site is an
//! exhaustive `match` and adding a message type is a compile-time change.
//!
//! ```json
//! {"type":"start","message_id":"…","conversation_id":"42"}
//! {"type":"chunk","message_id":"…","index":0,"content":"Hello"}
//! {"type":"end","message_id":"…","content":"Hello world!"}
//! {"type":"ping","timestamp":1735689600000}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::inference::Priority;

/// Identifier of one assistant response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in milliseconds, as carried by ping/pong
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message sent from the gateway to clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryMessage {
    /// A response begins
    Start {
        /// Response id
        message_id: MessageId,
        /// Conversation the response belongs to
        conversation_id: String,
    },

    /// One ordered fragment of a response
    Chunk {
        /// Response id
        message_id: MessageId,
        /// Zero-based fragment index
        index: u32,
        /// Text delta
        content: String,
    },

    /// Response finished; terminal
    End {
        /// Response id
        message_id: MessageId,
        /// Complete response text
        content: String,
        /// Set when the text is a labeled substitute for model output
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degraded: Option<ErrorKind>,
    },

    /// Request failed; terminal
    Error {
        /// Response id, absent for failures unrelated to a response
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// Failure class
        code: ErrorKind,
        /// Human-readable description
        content: String,
    },

    /// Liveness probe
    Ping {
        /// Sender clock, milliseconds since the epoch
        timestamp: i64,
    },

    /// Liveness answer echoing the probe's timestamp
    Pong {
        /// Timestamp copied from the ping
        timestamp: i64,
    },

    /// Someone is typing in a conversation
    Typing {
        /// Conversation
        conversation_id: String,
        /// Who is typing
        user_id: String,
        /// Started (true) or stopped (false)
        typing: bool,
    },

    /// Connection's conversation binding changed
    SessionUpdate {
        /// New conversation (none = detached)
        #[serde(default)]
        conversation_id: Option<String>,
        /// Status note
        content: String,
    },
}

impl DeliveryMessage {
    /// Wire name of the variant
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Typing { .. } => "typing",
            Self::SessionUpdate { .. } => "session_update",
        }
    }

    /// The textual content field, if this variant has one
    pub fn content_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Chunk { content, .. }
            | Self::End { content, .. }
            | Self::Error { content, .. }
            | Self::SessionUpdate { content, .. } => Some(content),
            Self::Start { .. } | Self::Ping { .. } | Self::Pong { .. } | Self::Typing { .. } => {
                None
            }
        }
    }

    /// Whether this closes out a response
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Only fails if serde_json does (it does not for these types).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Where a message is delivered
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryScope {
    /// Every connection of one user
    User(String),
    /// Every connection bound to one conversation
    Conversation(String),
}

impl fmt::Display for DeliveryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

fn default_stream() -> bool {
    true
}

/// Message received from a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Chat message asking for a response
    Message {
        /// Conversation (defaults to the connection's binding)
        #[serde(default)]
        conversation_id: Option<String>,
        /// User text
        content: String,
        /// Requested output length
        #[serde(default)]
        max_tokens: Option<u32>,
        /// Sampling temperature
        #[serde(default)]
        temperature: Option<f32>,
        /// Nucleus sampling probability
        #[serde(default)]
        top_p: Option<f32>,
        /// Queue priority
        #[serde(default)]
        priority: Priority,
        /// Stream fragments (default) or deliver one chunk
        #[serde(default = "default_stream")]
        stream: bool,
    },

    /// Client liveness probe; answered with a pong
    Ping {
        /// Client clock
        timestamp: i64,
    },

    /// Answer to a gateway ping
    Pong {
        /// Timestamp echoed from the ping
        timestamp: i64,
    },

    /// Typing indicator to relay to the conversation
    Typing {
        /// Conversation (defaults to the connection's binding)
        #[serde(default)]
        conversation_id: Option<String>,
        /// Started or stopped
        typing: bool,
    },

    /// Bind the connection to another conversation
    SessionUpdate {
        /// Target conversation (none = detach)
        #[serde(default)]
        conversation_id: Option<String>,
    },
}

impl ClientMessage {
    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns the serde error for malformed JSON or an unknown `type`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
