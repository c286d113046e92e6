//! Ollama Model Runtime
//!
//! Blocking runtime backed by a local Ollama server. Uses the
//! newline-delimited JSON stream of `/api/generate` and checks `/api/tags`
//! during load so a missing model surfaces as a load failure rather than a
//! generation failure.
//!
//! Every call here blocks the calling thread and must run on a worker thread.

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{
    Emission, EmissionSink, GenerationParams, LoadError, ModelLoader, ModelRuntime, RuntimeError,
};

/// Loader that verifies the configured model exists on the Ollama server
#[derive(Clone, Debug)]
pub struct OllamaLoader {
    host: String,
    port: u16,
    model: String,
    request_timeout: Duration,
}

impl OllamaLoader {
    /// Create a loader for `model` served at `host:port`
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            model: model.into(),
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Upper bound on a single HTTP exchange with the server
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl ModelLoader for OllamaLoader {
    fn load(&self) -> Result<Arc<dyn ModelRuntime>, LoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| LoadError::Unavailable(format!("http client: {e}")))?;

        let tags: TagsResponse = client
            .get(format!("{}/api/tags", self.base_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .and_then(reqwest::blocking::Response::json)
            .map_err(|e| LoadError::Unavailable(format!("ollama unreachable: {e}")))?;

        // Ollama reports "llama3.2:latest" for a model requested as "llama3.2"
        let found = tags.models.iter().any(|m| {
            m.name == self.model || m.name.split(':').next() == Some(self.model.as_str())
        });
        if !found {
            return Err(LoadError::Unavailable(format!(
                "model '{}' is not installed",
                self.model
            )));
        }

        tracing::info!(model = %self.model, host = %self.host, port = self.port, "Ollama model ready");

        Ok(Arc::new(OllamaRuntime {
            client,
            generate_url: format!("{}/api/generate", self.base_url()),
            model: self.model.clone(),
        }))
    }
}

/// Runtime issuing blocking `/api/generate` calls
pub struct OllamaRuntime {
    client: reqwest::blocking::Client,
    generate_url: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

fn classify(message: String) -> RuntimeError {
    if message.contains("out of memory") {
        RuntimeError::OutOfMemory(message)
    } else {
        RuntimeError::Failed(message)
    }
}

impl ModelRuntime for OllamaRuntime {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(
        &self,
        params: &GenerationParams,
        sink: EmissionSink<'_>,
    ) -> Result<String, RuntimeError> {
        if params.prompt.is_empty() {
            return Err(RuntimeError::InvalidInput("empty prompt".into()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "prompt": params.prompt,
            "stream": params.stream,
            "options": {
                "num_predict": params.max_tokens,
                "temperature": params.temperature,
                "top_p": params.top_p,
                "stop": params.stop_sequences,
            },
        });

        let response = self
            .client
            .post(&self.generate_url)
            .json(&body)
            .send()
            .map_err(|e| RuntimeError::Failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(classify(format!("ollama returned {status}: {text}")));
        }

        let mut full = String::new();
        for line in BufReader::new(response).lines() {
            let line = line.map_err(|e| RuntimeError::Failed(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: GenerateLine = serde_json::from_str(&line)
                .map_err(|e| RuntimeError::Failed(format!("bad stream line: {e}")))?;

            if let Some(error) = parsed.error {
                return Err(classify(error));
            }

            if !parsed.response.is_empty() {
                full.push_str(&parsed.response);
                if params.stream && sink(Emission::Text(parsed.response)).is_break() {
                    // Dropping the response closes the HTTP connection, which
                    // makes Ollama stop generating.
                    tracing::debug!(model = %self.model, "Generation stopped by consumer");
                    return Ok(full);
                }
            }

            if parsed.done {
                break;
            }
        }

        Ok(full)
    }
}
