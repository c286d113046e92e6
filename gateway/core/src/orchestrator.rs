//! Chat Orchestrator
//!
//! Glue between inbound client messages, the admission controller and the
//! broadcaster. Every [`ClientMessage`] is dispatched by one exhaustive
//! `match` in [`ChatOrchestrator::handle_client_message`].
//!
//! A chat message resolves to exactly one terminal event:
//!
//! ```text
//! start ─▶ chunk* ─▶ end                     model finished
//!                 └▶ end (degraded label)    timed out / generation failed
//!                 └▶ error                   load failure, out of memory,
//!                                            overloaded, invalid request
//! ```

use std::sync::Arc;

use futures::StreamExt;
use tracing::Instrument;

use crate::broadcast::{Broadcaster, DeliveryError};
use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::health::HealthMonitor;
use crate::inference::{
    AdmissionController, AdmissionError, GenerationFragment, GenerationRequest, Priority,
};
use crate::messages::{ClientMessage, DeliveryMessage, DeliveryScope, MessageId};
use crate::registry::ConnectionRegistry;
use crate::session::{Role, SessionStore, Turn};

/// Prompt construction settings
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Most recent stored turns included in the prompt
    pub history_turns: usize,
    /// Leading system instruction
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_turns: 20,
            system_prompt: None,
        }
    }
}

/// A chat message as submitted by a client
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    /// Target conversation; defaults to the connection's binding
    pub conversation_id: Option<String>,
    /// User text
    pub content: String,
    /// Requested output length
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling probability
    pub top_p: Option<f32>,
    /// Queue priority
    pub priority: Priority,
    /// Stream fragments or deliver one chunk
    pub stream: bool,
}

impl ChatRequest {
    /// Streaming request with default sampling
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            content: content.into(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            priority: Priority::default(),
            stream: true,
        }
    }

    /// Target a conversation
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// How a chat request ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatOutcome {
    /// Model output delivered with `end`
    Completed,
    /// Labeled substitute delivered with `end`
    Degraded(ErrorKind),
    /// `error` delivered
    Failed(ErrorKind),
    /// Nobody left to deliver to; generation abandoned
    Undeliverable,
}

/// Routes client messages through admission and delivery
#[derive(Clone)]
pub struct ChatOrchestrator {
    admission: Arc<AdmissionController>,
    registry: ConnectionRegistry,
    broadcaster: Broadcaster,
    monitor: HealthMonitor,
    sessions: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    /// Wire the orchestrator to its collaborators
    #[must_use]
    pub fn new(
        admission: Arc<AdmissionController>,
        registry: ConnectionRegistry,
        broadcaster: Broadcaster,
        monitor: HealthMonitor,
        sessions: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            admission,
            registry,
            broadcaster,
            monitor,
            sessions,
            config,
        }
    }

    /// Admission controller
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Parse and dispatch one inbound text frame
    ///
    /// Malformed frames are answered with an `error` on the sending
    /// connection only.
    pub async fn handle_frame(&self, connection: &Arc<Connection>, frame: &str) {
        match ClientMessage::parse(frame) {
            Ok(message) => self.handle_client_message(connection, message).await,
            Err(e) => self.reject_frame(connection, &e).await,
        }
    }

    /// Answer a frame that failed to parse with an `invalid_request` error
    pub async fn reject_frame(&self, connection: &Arc<Connection>, error: &serde_json::Error) {
        tracing::debug!(connection_id = %connection.id(), error = %error, "Malformed client message");
        let reply = DeliveryMessage::Error {
            message_id: None,
            code: ErrorKind::InvalidRequest,
            content: format!("malformed message: {error}"),
        };
        self.reply(connection, &reply).await;
    }

    /// Dispatch one inbound message
    pub async fn handle_client_message(&self, connection: &Arc<Connection>, message: ClientMessage) {
        match message {
            ClientMessage::Message {
                conversation_id,
                content,
                max_tokens,
                temperature,
                top_p,
                priority,
                stream,
            } => {
                let request = ChatRequest {
                    conversation_id,
                    content,
                    max_tokens,
                    temperature,
                    top_p,
                    priority,
                    stream,
                };
                self.handle_chat(connection, request).await;
            }
            ClientMessage::Ping { timestamp } => {
                self.reply(connection, &DeliveryMessage::Pong { timestamp })
                    .await;
            }
            ClientMessage::Pong { timestamp } => {
                self.monitor.handle_pong(connection, timestamp);
            }
            ClientMessage::Typing {
                conversation_id,
                typing,
            } => {
                let Some(conversation_id) = conversation_id.or_else(|| connection.conversation_id())
                else {
                    tracing::debug!(connection_id = %connection.id(), "Typing without a conversation");
                    return;
                };
                let event = DeliveryMessage::Typing {
                    conversation_id: conversation_id.clone(),
                    user_id: connection.user_id().to_string(),
                    typing,
                };
                if let Err(e) = self
                    .broadcaster
                    .send_to_conversation(&event, &conversation_id)
                    .await
                {
                    tracing::debug!(conversation_id = %conversation_id, error = %e, "Typing relay failed");
                }
            }
            ClientMessage::SessionUpdate { conversation_id } => {
                if !self.registry.rebind(connection.id(), conversation_id.clone()) {
                    return;
                }
                let content = match &conversation_id {
                    Some(id) => format!("bound to conversation {id}"),
                    None => "detached from conversation".to_string(),
                };
                let ack = DeliveryMessage::SessionUpdate {
                    conversation_id,
                    content,
                };
                self.reply(connection, &ack).await;
            }
        }
    }

    /// Run one chat request to its terminal event
    pub async fn handle_chat(&self, connection: &Arc<Connection>, request: ChatRequest) -> ChatOutcome {
        let span = tracing::debug_span!("chat", connection_id = %connection.id());
        self.run_chat(connection, request).instrument(span).await
    }

    async fn run_chat(&self, connection: &Arc<Connection>, request: ChatRequest) -> ChatOutcome {
        let user_id = connection.user_id().to_string();
        let conversation = request
            .conversation_id
            .clone()
            .or_else(|| connection.conversation_id());
        let scope = match &conversation {
            Some(id) => DeliveryScope::Conversation(id.clone()),
            None => DeliveryScope::User(user_id.clone()),
        };
        // History of an unbound connection is kept under the user
        let history_key = conversation.unwrap_or_else(|| user_id.clone());
        let message_id = MessageId::new();
        tracing::debug!(%message_id, user_id = %user_id, conversation_id = %history_key, "Chat request");

        match self.sessions.has_balance(&user_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(user_id = %user_id, "Rejecting chat, insufficient balance");
                return self
                    .fail(&scope, &user_id, message_id, ErrorKind::InvalidRequest, "insufficient balance".into())
                    .await;
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Balance check failed");
                return self
                    .fail(&scope, &user_id, message_id, ErrorKind::InvalidRequest, e.to_string())
                    .await;
            }
        }

        let prompt = self.build_prompt(&history_key, &request.content).await;
        if let Err(e) = self
            .sessions
            .append(&history_key, Turn::new(Role::User, request.content.clone()))
            .await
        {
            tracing::warn!(error = %e, "Failed to persist user turn");
        }

        let start = DeliveryMessage::Start {
            message_id,
            conversation_id: history_key.clone(),
        };
        if !self.deliver(&scope, &user_id, &start).await {
            return ChatOutcome::Undeliverable;
        }

        let mut generation = GenerationRequest::new(user_id.clone(), prompt)
            .with_priority(request.priority)
            .with_stream(request.stream);
        if let Some(max_tokens) = request.max_tokens {
            generation = generation.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            generation = generation.with_temperature(temperature);
        }
        if let Some(top_p) = request.top_p {
            generation = generation.with_top_p(top_p);
        }

        let mut stream = match self.admission.submit(generation).await {
            Ok(stream) => stream,
            Err(e) => return self.conclude_with_error(&scope, &user_id, &history_key, message_id, e, "").await,
        };

        let mut partial = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(GenerationFragment::Delta { index, text }) => {
                    partial.push_str(&text);
                    let chunk = DeliveryMessage::Chunk {
                        message_id,
                        index,
                        content: text,
                    };
                    if !self.deliver(&scope, &user_id, &chunk).await {
                        // Dropping the stream cancels the worker
                        tracing::info!(%message_id, "No recipients left, abandoning generation");
                        return ChatOutcome::Undeliverable;
                    }
                }
                Ok(GenerationFragment::Phase { name }) => {
                    tracing::trace!(%message_id, phase = %name, "Generation phase");
                }
                Ok(GenerationFragment::End { text }) => {
                    drop(stream);
                    let end = DeliveryMessage::End {
                        message_id,
                        content: text.clone(),
                        degraded: None,
                    };
                    self.deliver(&scope, &user_id, &end).await;
                    self.persist_reply(&history_key, text).await;
                    if let Err(e) = self.sessions.record_usage(&user_id).await {
                        tracing::warn!(error = %e, "Failed to record usage");
                    }
                    return ChatOutcome::Completed;
                }
                Err(e) => {
                    drop(stream);
                    return self
                        .conclude_with_error(&scope, &user_id, &history_key, message_id, e, &partial)
                        .await;
                }
            }
        }

        // A stream always yields a terminal item before ending
        self.conclude_with_error(
            &scope,
            &user_id,
            &history_key,
            message_id,
            AdmissionError::GenerationFailed("stream ended early".into()),
            &partial,
        )
        .await
    }

    async fn build_prompt(&self, history_key: &str, content: &str) -> String {
        let history = match self.sessions.history(history_key).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "History unavailable, prompting without it");
                Vec::new()
            }
        };

        let mut lines = Vec::with_capacity(self.config.history_turns + 2);
        if let Some(system) = &self.config.system_prompt {
            lines.push(format!("{}: {system}", Role::System));
        }
        let skip = history.len().saturating_sub(self.config.history_turns);
        for turn in history.into_iter().skip(skip) {
            lines.push(format!("{}: {}", turn.role, turn.content));
        }
        lines.push(format!("{}: {content}", Role::User));
        lines.join("\n")
    }

    async fn conclude_with_error(
        &self,
        scope: &DeliveryScope,
        user_id: &str,
        history_key: &str,
        message_id: MessageId,
        error: AdmissionError,
        partial: &str,
    ) -> ChatOutcome {
        let kind = error.kind();
        if !kind.degrades_response() {
            tracing::warn!(%message_id, error = %error, code = kind.code(), "Chat request failed");
            let content = if kind.is_service_unavailable() {
                format!("service unavailable: {error}")
            } else {
                error.to_string()
            };
            return self.fail(scope, user_id, message_id, kind, content).await;
        }

        tracing::warn!(%message_id, error = %error, "Substituting degraded response");
        let content = degraded_text(kind, partial);
        let end = DeliveryMessage::End {
            message_id,
            content: content.clone(),
            degraded: Some(kind),
        };
        self.deliver(scope, user_id, &end).await;
        self.persist_reply(history_key, content).await;
        ChatOutcome::Degraded(kind)
    }

    async fn fail(
        &self,
        scope: &DeliveryScope,
        user_id: &str,
        message_id: MessageId,
        kind: ErrorKind,
        content: String,
    ) -> ChatOutcome {
        let error = DeliveryMessage::Error {
            message_id: Some(message_id),
            code: kind,
            content,
        };
        if self.deliver(scope, user_id, &error).await {
            ChatOutcome::Failed(kind)
        } else {
            ChatOutcome::Undeliverable
        }
    }

    async fn persist_reply(&self, history_key: &str, content: String) {
        if let Err(e) = self
            .sessions
            .append(history_key, Turn::new(Role::Assistant, content))
            .await
        {
            tracing::warn!(error = %e, "Failed to persist assistant turn");
        }
    }

    /// Deliver to `scope`, falling back to the user when a conversation has
    /// no connections; returns whether anyone received it
    async fn deliver(&self, scope: &DeliveryScope, user_id: &str, message: &DeliveryMessage) -> bool {
        let result = match self.broadcaster.deliver(scope, message).await {
            Err(DeliveryError::NoRecipients { .. }) if matches!(scope, DeliveryScope::Conversation(_)) => {
                self.broadcaster.send_to_user(message, user_id).await
            }
            other => other,
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(scope = %scope, message_type = message.type_name(), error = %e, "Delivery failed");
                false
            }
        }
    }

    /// Answer the sending connection only; a failed reply evicts it
    async fn reply(&self, connection: &Connection, message: &DeliveryMessage) {
        let timeout = self.broadcaster.config().send_timeout;
        if let Err(e) = connection.send_message(message, timeout).await {
            tracing::warn!(connection_id = %connection.id(), error = %e, "Reply failed, evicting connection");
            connection.close("reply failed");
            self.registry.unregister(connection.id());
        }
    }
}

/// Visible stand-in for model output that never arrived
fn degraded_text(kind: ErrorKind, partial: &str) -> String {
    let label = match kind {
        ErrorKind::TimedOut => "[response timed out before the model finished]",
        _ => "[the model failed while generating this response]",
    };
    if partial.is_empty() {
        label.to_string()
    } else {
        format!("{partial}\n\n{label}")
    }
}
