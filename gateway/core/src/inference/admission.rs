//! Inference Admission Controller
//!
//! Gatekeeper in front of the scarce model. For each submitted
//! [`GenerationRequest`] it:
//!
//! 1. Refuses prompts that leave no room in the context window
//! 2. Loads the model lazily (single flight: one loader, everyone else waits)
//! 3. Takes a slot on the [`PriorityGate`] or fails with `Overloaded`
//! 4. Starts a [`bridge`](super::bridge) worker with a safe output length
//! 5. Returns a [`GenerationStream`] carrying the per-request deadline
//!
//! The slot is held by the stream and released the moment a terminal item
//! (end, error, timeout) is produced, or when the stream is dropped.
//!
//! # Request State Machine
//!
//! ```text
//! SUBMITTED ──▶ ADMITTED ──▶ STREAMING ──┬──▶ COMPLETED
//!                                        ├──▶ FAILED
//!                                        └──▶ TIMED_OUT
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::bridge::{self, BridgeError, BridgeEvent, BridgeReceiver};
use super::gate::{GateError, GatePermit, Priority, PriorityGate};
use crate::error::ErrorKind;
use crate::runtime::{GenerationParams, LoadError, ModelLoader, ModelRuntime, RuntimeError};

// =============================================================================
// Configuration
// =============================================================================

/// What to do when every slot is taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Queue (bounded by depth and wait time) until a slot frees up
    #[default]
    Wait,
    /// Fail immediately with `Overloaded`
    Reject,
}

impl fmt::Display for OverloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for OverloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown overload policy '{other}'")),
        }
    }
}

/// Admission controller settings
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Maximum concurrent generation calls
    pub max_concurrent: usize,
    /// Behaviour when saturated
    pub overload_policy: OverloadPolicy,
    /// Maximum requests waiting for a slot
    pub max_queue_depth: usize,
    /// Maximum time spent waiting for a slot
    pub queue_timeout: Duration,
    /// Per-request deadline, measured from admission
    pub request_timeout: Duration,
    /// Model context window in tokens
    pub context_window: u32,
    /// Heuristic characters per token for prompt estimation
    pub chars_per_token: u32,
    /// Tokens kept free on top of the prompt estimate
    pub safety_margin_tokens: u32,
    /// Output length used when the caller does not ask for one
    pub default_max_tokens: u32,
    /// Bridge hand-off channel capacity
    pub channel_capacity: usize,
    /// Stop sequences passed to every call
    pub stop_sequences: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            overload_policy: OverloadPolicy::Wait,
            max_queue_depth: 64,
            queue_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            context_window: 4096,
            chars_per_token: 4,
            safety_margin_tokens: 64,
            default_max_tokens: 512,
            channel_capacity: 64,
            stop_sequences: Vec::new(),
        }
    }
}

// =============================================================================
// Request / Fragment Types
// =============================================================================

/// One chat generation request
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Unique request id
    pub id: Uuid,
    /// Prompt text
    pub prompt: String,
    /// Requested output length (`None` = configured default)
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling probability
    pub top_p: f32,
    /// Queue priority
    pub priority: Priority,
    /// Stream deltas as they are produced
    pub stream: bool,
    /// Requesting user
    pub requester: String,
    /// When the request was created
    pub submitted_at: Instant,
}

impl GenerationRequest {
    /// New streaming request with default sampling
    pub fn new(requester: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            max_tokens: None,
            temperature: 0.7,
            top_p: 0.9,
            priority: Priority::Normal,
            stream: true,
            requester: requester.into(),
            submitted_at: Instant::now(),
        }
    }

    /// Set requested output length
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set nucleus sampling probability
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set queue priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Item of a [`GenerationStream`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationFragment {
    /// Ordered text delta
    Delta {
        /// Zero-based position in the stream
        index: u32,
        /// Text
        text: String,
    },
    /// Runtime phase marker
    Phase {
        /// Phase name
        name: String,
    },
    /// Normal end; carries the complete text
    End {
        /// Complete generated text
        text: String,
    },
}

/// Lifecycle of a generation request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Accepted for consideration
    Submitted,
    /// Holds a slot, worker started
    Admitted,
    /// At least one fragment delivered
    Streaming,
    /// Finished normally
    Completed,
    /// Runtime failed
    Failed,
    /// Deadline expired
    TimedOut,
}

impl RequestState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure of [`AdmissionController::submit`] or of a stream item
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Model could not be loaded
    #[error("model not ready: {0}")]
    ModelNotReady(Arc<LoadError>),

    /// No slot available
    #[error("overloaded: {in_flight} in flight, {queued} queued")]
    Overloaded {
        /// Calls holding a slot
        in_flight: usize,
        /// Calls waiting for one
        queued: usize,
    },

    /// Deadline expired
    #[error("generation timed out after {after:?}")]
    TimedOut {
        /// Configured request timeout
        after: Duration,
    },

    /// Runtime ran out of memory mid-generation
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Runtime failed
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Refused before admission
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AdmissionError {
    /// Taxonomy classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelNotReady(load) => load.kind(),
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::GenerationFailed(_) => ErrorKind::GenerationFailed,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<BridgeError> for AdmissionError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Runtime(RuntimeError::OutOfMemory(msg)) => Self::ResourceExhausted(msg),
            BridgeError::Runtime(other) => Self::GenerationFailed(other.to_string()),
            other => Self::GenerationFailed(other.to_string()),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of admission counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Requests that obtained a slot
    pub admitted: u64,
    /// Requests refused with `Overloaded`
    pub rejected: u64,
    /// Requests that completed normally
    pub completed: u64,
    /// Requests whose runtime failed
    pub failed: u64,
    /// Requests that hit their deadline
    pub timed_out: u64,
    /// Streams dropped before a terminal item
    pub abandoned: u64,
    /// Model load attempts
    pub load_attempts: u64,
    /// Calls currently holding a slot
    pub in_flight: usize,
    /// Highest concurrent calls seen
    pub peak_in_flight: usize,
    /// Requests waiting for a slot
    pub queued: usize,
}

#[derive(Default)]
struct AdmissionStatsAtomic {
    admitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Default)]
struct ModelSlot {
    runtime: Option<Arc<dyn ModelRuntime>>,
    last_error: Option<Arc<LoadError>>,
}

/// Bounds concurrent generation calls against a lazily loaded model
pub struct AdmissionController {
    config: AdmissionConfig,
    loader: Arc<dyn ModelLoader>,
    model: tokio::sync::Mutex<ModelSlot>,
    load_attempts: AtomicU64,
    /// Bumped while the slot lock is still held, once a load has an outcome
    loads_finished: AtomicU64,
    gate: PriorityGate,
    stats: Arc<AdmissionStatsAtomic>,
}

impl AdmissionController {
    /// Create a controller; the model is not loaded until first use
    pub fn new(config: AdmissionConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let gate = PriorityGate::new(config.max_concurrent.max(1));
        Self {
            config,
            loader,
            model: tokio::sync::Mutex::new(ModelSlot::default()),
            load_attempts: AtomicU64::new(0),
            loads_finished: AtomicU64::new(0),
            gate,
            stats: Arc::new(AdmissionStatsAtomic::default()),
        }
    }

    /// Controller settings
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Load the model now instead of on the first request
    ///
    /// # Errors
    ///
    /// Returns `ModelNotReady` if loading fails.
    pub async fn preload(&self) -> Result<(), AdmissionError> {
        self.ensure_model().await.map(|_| ())
    }

    /// Whether the model is loaded
    pub async fn is_ready(&self) -> bool {
        self.model.lock().await.runtime.is_some()
    }

    /// Cheap prompt length estimate in tokens
    #[must_use]
    pub fn estimate_prompt_tokens(&self, prompt: &str) -> u32 {
        let chars = u32::try_from(prompt.chars().count()).unwrap_or(u32::MAX);
        chars.div_ceil(self.config.chars_per_token.max(1))
    }

    /// Output length that fits in the context window
    ///
    /// `context_window − estimate(prompt) − safety_margin`, clamped to the
    /// requested maximum (or the configured default).
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the prompt leaves no room for output.
    pub fn safe_max_tokens(
        &self,
        prompt: &str,
        requested: Option<u32>,
    ) -> Result<u32, AdmissionError> {
        let estimated = self.estimate_prompt_tokens(prompt);
        let available = self
            .config
            .context_window
            .saturating_sub(estimated)
            .saturating_sub(self.config.safety_margin_tokens);

        if available == 0 {
            return Err(AdmissionError::InvalidRequest(format!(
                "prompt of ~{estimated} tokens leaves no room in a {}-token context window",
                self.config.context_window
            )));
        }

        let requested = requested
            .filter(|n| *n > 0)
            .unwrap_or(self.config.default_max_tokens);
        Ok(available.min(requested))
    }

    /// Admit a request and start generating
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for empty or oversized prompts, `ModelNotReady` when
    /// the model cannot be loaded, `Overloaded` when no slot can be obtained,
    /// `GenerationFailed` if the worker cannot be started. Deadline and
    /// runtime failures arrive later as stream items.
    pub async fn submit(&self, request: GenerationRequest) -> Result<GenerationStream, AdmissionError> {
        let request_id = request.id;
        tracing::debug!(
            %request_id,
            requester = %request.requester,
            priority = %request.priority,
            state = ?RequestState::Submitted,
            "Generation request submitted"
        );

        if request.prompt.trim().is_empty() {
            return Err(AdmissionError::InvalidRequest("empty prompt".into()));
        }
        let max_tokens = self.safe_max_tokens(&request.prompt, request.max_tokens)?;

        let runtime = self.ensure_model().await?;
        let permit = self.acquire_slot(request.priority).await?;

        let params = GenerationParams::new(request.prompt)
            .with_max_tokens(max_tokens)
            .with_temperature(request.temperature)
            .with_top_p(request.top_p)
            .with_stop_sequences(self.config.stop_sequences.clone())
            .with_stream(request.stream);

        let receiver = bridge::spawn(request_id, runtime, params, self.config.channel_capacity)?;

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %request_id,
            max_tokens,
            queued_for_ms = request.submitted_at.elapsed().as_millis() as u64,
            state = ?RequestState::Admitted,
            "Generation request admitted"
        );

        Ok(GenerationStream {
            request_id,
            receiver,
            permit: Some(permit),
            deadline: Box::pin(tokio::time::sleep(self.config.request_timeout)),
            timeout: self.config.request_timeout,
            max_tokens,
            next_index: 0,
            state: RequestState::Admitted,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Positional entry point mirroring the runtime call shape
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionController::submit`].
    pub async fn submit_generation(
        &self,
        prompt: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
        priority: Priority,
        stream: bool,
    ) -> Result<GenerationStream, AdmissionError> {
        let request = GenerationRequest::new("anonymous", prompt)
            .with_max_tokens(max_tokens)
            .with_temperature(temperature)
            .with_top_p(top_p)
            .with_priority(priority)
            .with_stream(stream);
        self.submit(request).await
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            abandoned: self.stats.abandoned.load(Ordering::Relaxed),
            load_attempts: self.load_attempts.load(Ordering::SeqCst),
            in_flight: self.gate.in_use(),
            peak_in_flight: self.gate.peak_in_use(),
            queued: self.gate.waiting(),
        }
    }

    async fn ensure_model(&self) -> Result<Arc<dyn ModelRuntime>, AdmissionError> {
        let finished_before = self.loads_finished.load(Ordering::SeqCst);
        let mut slot = self.model.lock().await;

        if let Some(runtime) = &slot.runtime {
            return Ok(Arc::clone(runtime));
        }

        // A load finished while we waited on the lock and failed; share that
        // outcome instead of starting another load.
        if self.loads_finished.load(Ordering::SeqCst) != finished_before {
            if let Some(error) = &slot.last_error {
                return Err(AdmissionError::ModelNotReady(Arc::clone(error)));
            }
        }

        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(attempt, "Loading model");
        let started = Instant::now();

        let loader = Arc::clone(&self.loader);
        let outcome = tokio::task::spawn_blocking(move || loader.load())
            .await
            .unwrap_or_else(|e| Err(LoadError::Aborted(e.to_string())));

        let result = match outcome {
            Ok(runtime) => {
                tracing::info!(
                    runtime = runtime.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                slot.runtime = Some(Arc::clone(&runtime));
                slot.last_error = None;
                Ok(runtime)
            }
            Err(error) => {
                tracing::warn!(attempt, error = %error, kind = %error.kind(), "Model load failed");
                let error = Arc::new(error);
                slot.last_error = Some(Arc::clone(&error));
                Err(AdmissionError::ModelNotReady(error))
            }
        };
        self.loads_finished.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn acquire_slot(&self, priority: Priority) -> Result<GatePermit, AdmissionError> {
        let acquired = match self.config.overload_policy {
            OverloadPolicy::Reject => self.gate.try_acquire(),
            OverloadPolicy::Wait => {
                match tokio::time::timeout(
                    self.config.queue_timeout,
                    self.gate.acquire(priority, self.config.max_queue_depth),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(GateError::NoSlot),
                }
            }
        };

        acquired.map_err(|error| {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            let overloaded = AdmissionError::Overloaded {
                in_flight: self.gate.in_use(),
                queued: self.gate.waiting(),
            };
            tracing::warn!(%priority, reason = %error, "Generation request rejected: {overloaded}");
            overloaded
        })
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Stream
// =============================================================================

/// Fragments of one admitted request
///
/// Yields deltas in emission order, then exactly one terminal item: `End`, or
/// an error (`TimedOut`, `GenerationFailed`, `ResourceExhausted`). The slot is
/// released as that terminal item is produced.
pub struct GenerationStream {
    request_id: Uuid,
    receiver: BridgeReceiver,
    permit: Option<GatePermit>,
    deadline: Pin<Box<tokio::time::Sleep>>,
    timeout: Duration,
    max_tokens: u32,
    next_index: u32,
    state: RequestState,
    stats: Arc<AdmissionStatsAtomic>,
}

impl GenerationStream {
    /// Request id
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Output length granted to the runtime
    #[must_use]
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Whether the stream still holds its concurrency slot
    #[must_use]
    pub fn holds_slot(&self) -> bool {
        self.permit.is_some()
    }

    fn finish(&mut self, state: RequestState) {
        let counter = match state {
            RequestState::Completed => &self.stats.completed,
            RequestState::TimedOut => &self.stats.timed_out,
            _ => &self.stats.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.state = state;
        self.permit = None;
        if state == RequestState::TimedOut {
            self.receiver.cancel();
        }
        tracing::debug!(request_id = %self.request_id, ?state, "Generation request finished");
    }

    fn advance(&mut self) {
        if self.state == RequestState::Admitted {
            self.state = RequestState::Streaming;
        }
    }
}

impl Stream for GenerationStream {
    type Item = Result<GenerationFragment, AdmissionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state.is_terminal() {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::warn!(
                request_id = %this.request_id,
                timeout_ms = this.timeout.as_millis() as u64,
                "Generation deadline expired"
            );
            this.finish(RequestState::TimedOut);
            return Poll::Ready(Some(Err(AdmissionError::TimedOut {
                after: this.timeout,
            })));
        }

        let event = match Pin::new(&mut this.receiver).poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(event) => event,
        };

        let item = match event {
            Some(Ok(BridgeEvent::Text(text))) => {
                this.advance();
                let index = this.next_index;
                this.next_index += 1;
                Ok(GenerationFragment::Delta { index, text })
            }
            Some(Ok(BridgeEvent::Phase(name))) => {
                this.advance();
                Ok(GenerationFragment::Phase { name })
            }
            Some(Ok(BridgeEvent::Finished(text))) => {
                this.finish(RequestState::Completed);
                Ok(GenerationFragment::End { text })
            }
            Some(Err(error)) => {
                this.finish(RequestState::Failed);
                Err(AdmissionError::from(error))
            }
            None => {
                this.finish(RequestState::Failed);
                Err(AdmissionError::GenerationFailed(
                    "generation ended without a terminal event".into(),
                ))
            }
        };
        Poll::Ready(Some(item))
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request_id = %self.request_id, "Generation stream abandoned");
        }
    }
}

impl fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationStream")
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("max_tokens", &self.max_tokens)
            .field("holds_slot", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ScriptStep, ScriptedLoader, ScriptedRuntime};
    use futures::StreamExt;

    fn controller(runtime: Arc<ScriptedRuntime>, config: AdmissionConfig) -> AdmissionController {
        AdmissionController::new(config, Arc::new(ScriptedLoader::new(runtime)))
    }

    #[test]
    fn test_safe_max_tokens() {
        let ctl = controller(
            Arc::new(ScriptedRuntime::fragments(&[])),
            AdmissionConfig {
                context_window: 1000,
                chars_per_token: 4,
                safety_margin_tokens: 100,
                default_max_tokens: 512,
                ..Default::default()
            },
        );

        // 2000 chars ~ 500 tokens, leaves 400
        let prompt = "x".repeat(2000);
        assert_eq!(ctl.safe_max_tokens(&prompt, Some(1000)).unwrap(), 400);
        assert_eq!(ctl.safe_max_tokens(&prompt, Some(50)).unwrap(), 50);
        assert_eq!(ctl.safe_max_tokens("hi", None).unwrap(), 512);
        assert_eq!(ctl.safe_max_tokens("hi", Some(0)).unwrap(), 512);

        let huge = "x".repeat(4000);
        let err = ctl.safe_max_tokens(&huge, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_then_end() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            ScriptStep::Phase("answer".into()),
            ScriptStep::Text("Hi".into()),
            ScriptStep::Text(" there".into()),
        ]));
        let ctl = controller(runtime, AdmissionConfig::default());

        let mut stream = ctl.submit(GenerationRequest::new("u1", "hello")).await.unwrap();
        assert_eq!(stream.state(), RequestState::Admitted);

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }

        assert_eq!(
            items,
            vec![
                GenerationFragment::Phase {
                    name: "answer".into()
                },
                GenerationFragment::Delta {
                    index: 0,
                    text: "Hi".into()
                },
                GenerationFragment::Delta {
                    index: 1,
                    text: " there".into()
                },
                GenerationFragment::End {
                    text: "Hi there".into()
                },
            ]
        );
        assert_eq!(stream.state(), RequestState::Completed);
        assert!(!stream.holds_slot());

        let stats = ctl.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_runtime_failure_surfaces_as_generation_failed() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptStep::Fail(
            RuntimeError::Failed("bad weights".into()),
        )]));
        let ctl = controller(runtime, AdmissionConfig::default());

        let mut stream = ctl.submit(GenerationRequest::new("u1", "hello")).await.unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenerationFailed);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), RequestState::Failed);
        assert_eq!(ctl.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_reject_policy_fails_fast() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptStep::Block]));
        let ctl = controller(
            runtime.clone(),
            AdmissionConfig {
                max_concurrent: 1,
                overload_policy: OverloadPolicy::Reject,
                ..Default::default()
            },
        );

        let _first = ctl.submit(GenerationRequest::new("u1", "a")).await.unwrap();
        let err = ctl.submit(GenerationRequest::new("u2", "b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert_eq!(ctl.stats().rejected, 1);

        runtime.release();
    }

    #[tokio::test]
    async fn test_load_failure_then_retry() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["ok"]));
        let loader = ScriptedLoader::new(runtime)
            .failing_with(vec![LoadError::Unavailable("weights missing".into())]);
        let ctl = AdmissionController::new(AdmissionConfig::default(), Arc::new(loader));

        let err = ctl.submit(GenerationRequest::new("u1", "a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailure);
        assert!(!ctl.is_ready().await);

        assert!(ctl.submit(GenerationRequest::new("u1", "a")).await.is_ok());
        assert!(ctl.is_ready().await);
        assert_eq!(ctl.stats().load_attempts, 2);
    }

    async fn concurrent_submits(ctl: Arc<AdmissionController>, late: usize) -> Vec<ErrorKind> {
        let mut tasks = tokio::task::JoinSet::new();
        let first = Arc::clone(&ctl);
        tasks.spawn(async move { first.submit(GenerationRequest::new("u0", "a")).await.err() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..late {
            let ctl = Arc::clone(&ctl);
            tasks.spawn(async move {
                ctl.submit(GenerationRequest::new(format!("u{}", i + 1), "a"))
                    .await
                    .err()
            });
        }

        let mut kinds = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(err) = joined.unwrap() {
                kinds.push(err.kind());
            }
        }
        kinds
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_successful_load() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["ok"]));
        let loader = Arc::new(ScriptedLoader::new(runtime).with_delay(Duration::from_millis(200)));
        let ctl = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            loader.clone(),
        ));

        let failures = concurrent_submits(Arc::clone(&ctl), 4).await;

        assert!(failures.is_empty(), "unexpected failures: {failures:?}");
        assert_eq!(loader.load_count(), 1);
        assert_eq!(ctl.stats().load_attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_failed_load() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["ok"]));
        let failures = (0..8)
            .map(|_| LoadError::Unavailable("weights missing".into()))
            .collect();
        let loader = Arc::new(
            ScriptedLoader::new(runtime)
                .with_delay(Duration::from_millis(200))
                .failing_with(failures),
        );
        let ctl = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            loader.clone(),
        ));

        let kinds = concurrent_submits(Arc::clone(&ctl), 4).await;

        assert_eq!(kinds, vec![ErrorKind::LoadFailure; 5]);
        assert_eq!(loader.load_count(), 1);
        assert_eq!(ctl.stats().load_attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_preloads_share_one_load() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["ok"]));
        let loader = Arc::new(ScriptedLoader::new(runtime).with_delay(Duration::from_millis(100)));
        let ctl = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            loader.clone(),
        ));

        let results = futures::future::join_all((0..6).map(|_| ctl.preload())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(loader.load_count(), 1);
        assert!(ctl.is_ready().await);
    }

    #[tokio::test]
    async fn test_out_of_memory_load_is_resource_exhausted() {
        let loader = ScriptedLoader::new(Arc::new(ScriptedRuntime::fragments(&[])))
            .failing_with(vec![LoadError::OutOfMemory("needs 48GB".into())]);
        let ctl = AdmissionController::new(AdmissionConfig::default(), Arc::new(loader));

        let err = ctl.preload().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_slot() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![ScriptStep::Block]));
        let ctl = controller(
            runtime.clone(),
            AdmissionConfig {
                max_concurrent: 1,
                ..Default::default()
            },
        );

        let stream = ctl.submit(GenerationRequest::new("u1", "a")).await.unwrap();
        assert_eq!(ctl.stats().in_flight, 1);
        drop(stream);

        let stats = ctl.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.abandoned, 1);
        runtime.release();
    }
}
