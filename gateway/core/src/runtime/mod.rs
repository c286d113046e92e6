//! Model Runtime Seam
//!
//! The generation model is an external collaborator whose only call contract
//! is synchronous and thread-blocking. This module defines that contract so
//! the rest of the gateway can stay agnostic of the concrete model.
//!
//! # Threading Contract
//!
//! Both [`ModelLoader::load`] and [`ModelRuntime::generate`] block the calling
//! thread. They are only ever invoked from worker threads owned by
//! [`crate::inference::bridge`] or from `spawn_blocking`; event-loop code must
//! never call them directly.
//!
//! # Early Stop
//!
//! The sink passed to [`ModelRuntime::generate`] returns a [`ControlFlow`].
//! `Break` means the consumer is gone (cancelled, timed out, disconnected) and
//! the runtime should stop at its next opportunity. Runtimes that ignore the
//! signal remain correct; they just keep burning a worker thread until they
//! finish on their own.

pub mod ollama;
pub mod scripted;

use std::ops::ControlFlow;
use std::sync::Arc;

use thiserror::Error;

use crate::error::ErrorKind;

pub use ollama::{OllamaLoader, OllamaRuntime};
pub use scripted::{ScriptStep, ScriptedLoader, ScriptedRuntime};

/// One item produced by a runtime while generating
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Emission {
    /// A text delta
    Text(String),
    /// A runtime-defined phase marker (e.g. switching from reasoning to answer)
    Phase(String),
}

/// Callback receiving emissions from inside the blocking call
pub type EmissionSink<'a> = &'a mut dyn FnMut(Emission) -> ControlFlow<()>;

/// Parameters of a single blocking generation call
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    /// Fully assembled prompt
    pub prompt: String,
    /// Output length bound, already clamped to the context window
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling probability
    pub top_p: f32,
    /// Sequences that terminate generation
    pub stop_sequences: Vec<String>,
    /// Whether deltas are streamed through the sink
    pub stream: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: Vec::new(),
            stream: true,
        }
    }
}

impl GenerationParams {
    /// Create params for a prompt with default sampling
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set the output length bound
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature (clamped to 0.0-2.0)
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set nucleus sampling probability (clamped to 0.0-1.0)
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p.clamp(0.0, 1.0);
        self
    }

    /// Set stop sequences
    #[must_use]
    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Failure while loading the model
#[derive(Debug, Error)]
pub enum LoadError {
    /// Model artifact is missing or the environment cannot host it
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// Not enough memory to load the model
    #[error("out of memory while loading model: {0}")]
    OutOfMemory(String),

    /// The loader thread panicked or was torn down
    #[error("model loader aborted: {0}")]
    Aborted(String),
}

impl LoadError {
    /// Taxonomy classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory(_) => ErrorKind::ResourceExhausted,
            Self::Unavailable(_) | Self::Aborted(_) => ErrorKind::LoadFailure,
        }
    }
}

/// Failure raised by the blocking generation call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Runtime rejected the input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Runtime ran out of memory mid-generation
    #[error("out of memory during generation: {0}")]
    OutOfMemory(String),

    /// Any other runtime failure
    #[error("generation failed: {0}")]
    Failed(String),
}

impl RuntimeError {
    /// Taxonomy classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory(_) => ErrorKind::ResourceExhausted,
            Self::InvalidInput(_) | Self::Failed(_) => ErrorKind::GenerationFailed,
        }
    }
}

/// A loaded model able to serve blocking generation calls
pub trait ModelRuntime: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run one generation to completion, blocking the calling thread
    ///
    /// When `params.stream` is true every delta is handed to `sink` as it is
    /// produced. The full text is returned on success either way.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] if the model rejects the input or fails
    /// while generating.
    fn generate(
        &self,
        params: &GenerationParams,
        sink: EmissionSink<'_>,
    ) -> Result<String, RuntimeError>;
}

/// Performs the expensive, memory-heavy model load
pub trait ModelLoader: Send + Sync {
    /// Load the model, blocking the calling thread
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the artifact is missing or memory runs
    /// out. A later call may retry.
    fn load(&self) -> Result<Arc<dyn ModelRuntime>, LoadError>;
}
