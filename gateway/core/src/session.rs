//! Session Store Seam
//!
//! Conversation history and per-user credit live outside the gateway core.
//! The orchestrator reads prior turns to build a prompt, persists finished
//! turns and checks the user's balance before admitting a request, all
//! through [`SessionStore`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who authored a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions preceding the conversation
    System,
    /// The human
    User,
    /// The model
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One persisted message of a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Author
    pub role: Role,
    /// Text
    pub content: String,
    /// When it was stored
    pub at: DateTime<Utc>,
}

impl Turn {
    /// Turn stamped with the current time
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Store failure
#[derive(Debug, Error)]
pub enum SessionError {
    /// Backing store cannot be reached
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Conversation history and balance backend
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Prior turns of a conversation, oldest first
    async fn history(&self, conversation_id: &str) -> Result<Vec<Turn>, SessionError>;

    /// Persist a finished turn
    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<(), SessionError>;

    /// Whether the user may start another generation
    async fn has_balance(&self, user_id: &str) -> Result<bool, SessionError>;

    /// Charge the user for one completed generation
    async fn record_usage(&self, _user_id: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Process-local store
///
/// Users without an explicit balance are unmetered.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    histories: DashMap<String, Vec<Turn>>,
    balances: DashMap<String, u64>,
}

impl InMemorySessionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `user_id` exactly `credits` generations
    pub fn set_balance(&self, user_id: impl Into<String>, credits: u64) {
        self.balances.insert(user_id.into(), credits);
    }

    /// Remaining credits, `None` when unmetered
    #[must_use]
    pub fn balance(&self, user_id: &str) -> Option<u64> {
        self.balances.get(user_id).map(|credits| *credits)
    }

    /// Number of stored turns
    #[must_use]
    pub fn turn_count(&self, conversation_id: &str) -> usize {
        self.histories
            .get(conversation_id)
            .map_or(0, |turns| turns.len())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn history(&self, conversation_id: &str) -> Result<Vec<Turn>, SessionError> {
        Ok(self
            .histories
            .get(conversation_id)
            .map(|turns| turns.clone())
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<(), SessionError> {
        self.histories
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn has_balance(&self, user_id: &str) -> Result<bool, SessionError> {
        Ok(!matches!(self.balances.get(user_id), Some(credits) if *credits == 0))
    }

    async fn record_usage(&self, user_id: &str) -> Result<(), SessionError> {
        // Unmetered users are unaffected
        if let Some(mut credits) = self.balances.get_mut(user_id) {
            *credits = credits.saturating_sub(1);
        }
        Ok(())
    }
}
