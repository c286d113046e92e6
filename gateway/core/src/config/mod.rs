//! TOML Configuration File Support
//!
//! Centralized configuration loading for the gateway, from a TOML file at
//! `~/.config/chat-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8765"
//! max_connections = 512
//!
//! [admission]
//! max_concurrent = 1
//! overload_policy = "reject"
//! request_timeout_secs = 60
//! context_window = 8192
//!
//! [heartbeat]
//! interval_secs = 15
//! stale_multiplier = 3.0
//!
//! [delivery]
//! send_timeout_ms = 2000
//! max_payload_bytes = 32768
//!
//! [model]
//! runtime = "ollama"
//! model = "llama3.2"
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broadcast::DeliveryConfig;
use crate::health::HeartbeatConfig;
use crate::inference::{AdmissionConfig, OverloadPolicy};
use crate::orchestrator::OrchestratorConfig;
use crate::runtime::{ModelLoader, OllamaLoader, ScriptedLoader, ScriptedRuntime};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Resolved Sections
// =============================================================================

/// Listener settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub bind: SocketAddr,
    /// Connections accepted at once
    pub max_connections: usize,
    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8765)),
            max_connections: 1024,
            outbound_queue: 256,
        }
    }
}

/// Which model runtime backs the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Local Ollama server
    #[default]
    Ollama,
    /// Built-in echo runtime, no model needed
    Scripted,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "scripted" | "echo" => Ok(Self::Scripted),
            other => Err(format!("unknown runtime '{other}'")),
        }
    }
}

/// Model runtime and prompt settings
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    /// Runtime implementation
    pub runtime: RuntimeKind,
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
    /// Model name
    pub model: String,
    /// HTTP timeout for one generation call
    pub http_timeout: Duration,
    /// Delay between words of the scripted runtime
    pub scripted_delay: Duration,
    /// Leading system instruction
    pub system_prompt: Option<String>,
    /// Stored turns included in each prompt
    pub history_turns: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Ollama,
            host: "localhost".to_string(),
            port: 11434,
            model: "llama3.2".to_string(),
            http_timeout: Duration::from_secs(300),
            scripted_delay: Duration::from_millis(40),
            system_prompt: None,
            history_turns: 20,
        }
    }
}

impl ModelConfig {
    /// Build the loader for the configured runtime
    #[must_use]
    pub fn loader(&self) -> Arc<dyn ModelLoader> {
        match self.runtime {
            RuntimeKind::Ollama => Arc::new(
                OllamaLoader::new(self.host.clone(), self.port, self.model.clone())
                    .with_request_timeout(self.http_timeout),
            ),
            RuntimeKind::Scripted => Arc::new(ScriptedLoader::new(Arc::new(ScriptedRuntime::echo(
                self.scripted_delay,
            )))),
        }
    }

    /// Prompt construction settings
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            history_turns: self.history_turns,
            system_prompt: self.system_prompt.clone(),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address, `host:port`
    pub bind: Option<String>,
    /// Connection limit
    pub max_connections: Option<usize>,
    /// Per-connection outbound queue
    pub outbound_queue: Option<usize>,
}

/// Admission section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionToml {
    /// Concurrent generation calls
    pub max_concurrent: Option<usize>,
    /// `wait` or `reject`
    pub overload_policy: Option<String>,
    /// Requests allowed to wait for a slot
    pub max_queue_depth: Option<usize>,
    /// Longest wait for a slot in seconds
    pub queue_timeout_secs: Option<u64>,
    /// Per-request deadline in seconds
    pub request_timeout_secs: Option<u64>,
    /// Model context window in tokens
    pub context_window: Option<u32>,
    /// Characters per token for prompt estimation
    pub chars_per_token: Option<u32>,
    /// Tokens kept free beyond the prompt
    pub safety_margin_tokens: Option<u32>,
    /// Output length when the client asks for none
    pub default_max_tokens: Option<u32>,
    /// Bridge channel capacity
    pub channel_capacity: Option<usize>,
    /// Stop sequences for every call
    pub stop_sequences: Option<Vec<String>>,
}

/// Heartbeat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatToml {
    /// Whether to ping at all
    pub enabled: Option<bool>,
    /// Ping interval in seconds
    pub interval_secs: Option<u64>,
    /// Stale threshold in intervals
    pub stale_multiplier: Option<f64>,
    /// Grace period after connect in seconds
    pub grace_period_secs: Option<u64>,
    /// Latency warning threshold in milliseconds
    pub latency_warn_ms: Option<u64>,
}

/// Delivery section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryToml {
    /// Per-send timeout in milliseconds
    pub send_timeout_ms: Option<u64>,
    /// Largest frame in bytes
    pub max_payload_bytes: Option<usize>,
}

/// Model section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelToml {
    /// `ollama` or `scripted`
    pub runtime: Option<String>,
    /// Ollama host
    pub host: Option<String>,
    /// Ollama port
    pub port: Option<u16>,
    /// Model name
    pub model: Option<String>,
    /// HTTP timeout per generation in seconds
    pub http_timeout_secs: Option<u64>,
    /// System instruction
    pub system_prompt: Option<String>,
    /// Stored turns per prompt
    pub history_turns: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Server section
    pub server: ServerToml,
    /// Admission section
    pub admission: AdmissionToml,
    /// Heartbeat section
    pub heartbeat: HeartbeatToml,
    /// Delivery section
    pub delivery: DeliveryToml,
    /// Model section
    pub model: ModelToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Fully resolved gateway configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug, Default)]
pub struct GatewayConfig {
    /// Listener
    pub server: ServerConfig,
    /// Admission controller
    pub admission: AdmissionConfig,
    /// Health monitor
    pub heartbeat: HeartbeatConfig,
    /// Broadcaster
    pub delivery: DeliveryConfig,
    /// Model runtime
    pub model: ModelConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: Option<ConfigSource>,
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source.unwrap_or(ConfigSource::Default)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be at least 1");
        }
        if self.server.outbound_queue == 0 {
            return invalid("server.outbound_queue must be at least 1");
        }
        if self.admission.max_concurrent == 0 {
            return invalid("admission.max_concurrent must be at least 1");
        }
        if self.admission.chars_per_token == 0 {
            return invalid("admission.chars_per_token must be at least 1");
        }
        if self.admission.channel_capacity == 0 {
            return invalid("admission.channel_capacity must be at least 1");
        }
        if self.admission.request_timeout.is_zero() {
            return invalid("admission.request_timeout_secs must be positive");
        }
        if self.admission.safety_margin_tokens >= self.admission.context_window {
            return invalid("admission.safety_margin_tokens must be below context_window");
        }
        if self.heartbeat.interval.is_zero() {
            return invalid("heartbeat.interval_secs must be positive");
        }
        let multiplier = self.heartbeat.stale_multiplier;
        if multiplier.is_nan() || multiplier < 2.0 {
            return invalid("heartbeat.stale_multiplier must be at least 2");
        }
        if self.delivery.max_payload_bytes < 256 {
            return invalid("delivery.max_payload_bytes must be at least 256");
        }
        if self.model.model.trim().is_empty() {
            return invalid("model.model must not be empty");
        }
        Ok(())
    }

    fn mark(&mut self, source: ConfigSource) {
        self.source = Some(source);
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-gateway/gateway.toml` or
/// `~/.config/chat-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-gateway").join("gateway.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.mark(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, &env)?;
    config.validate()?;
    Ok(config)
}

fn parse_bind(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("invalid bind address '{value}': {e}")))
}

fn parse_policy(value: &str) -> Result<OverloadPolicy, ConfigError> {
    value.parse().map_err(ConfigError::ValidationError)
}

fn parse_runtime(value: &str) -> Result<RuntimeKind, ConfigError> {
    value.parse().map_err(ConfigError::ValidationError)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref bind) = toml.server.bind {
        config.server.bind = parse_bind(bind)?;
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(queue) = toml.server.outbound_queue {
        config.server.outbound_queue = queue;
    }

    // Admission settings
    let admission = &toml.admission;
    if let Some(n) = admission.max_concurrent {
        config.admission.max_concurrent = n;
    }
    if let Some(ref policy) = admission.overload_policy {
        config.admission.overload_policy = parse_policy(policy)?;
    }
    if let Some(depth) = admission.max_queue_depth {
        config.admission.max_queue_depth = depth;
    }
    if let Some(secs) = admission.queue_timeout_secs {
        config.admission.queue_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = admission.request_timeout_secs {
        config.admission.request_timeout = Duration::from_secs(secs);
    }
    if let Some(window) = admission.context_window {
        config.admission.context_window = window;
    }
    if let Some(cpt) = admission.chars_per_token {
        config.admission.chars_per_token = cpt;
    }
    if let Some(margin) = admission.safety_margin_tokens {
        config.admission.safety_margin_tokens = margin;
    }
    if let Some(tokens) = admission.default_max_tokens {
        config.admission.default_max_tokens = tokens;
    }
    if let Some(capacity) = admission.channel_capacity {
        config.admission.channel_capacity = capacity;
    }
    if let Some(ref stops) = admission.stop_sequences {
        config.admission.stop_sequences = stops.clone();
    }

    // Heartbeat settings
    let heartbeat = &toml.heartbeat;
    if let Some(enabled) = heartbeat.enabled {
        config.heartbeat.enabled = enabled;
    }
    if let Some(secs) = heartbeat.interval_secs {
        config.heartbeat.interval = Duration::from_secs(secs);
    }
    if let Some(multiplier) = heartbeat.stale_multiplier {
        config.heartbeat.stale_multiplier = multiplier;
    }
    if let Some(secs) = heartbeat.grace_period_secs {
        config.heartbeat.grace_period = Duration::from_secs(secs);
    }
    if let Some(ms) = heartbeat.latency_warn_ms {
        config.heartbeat.latency_warn_threshold = Duration::from_millis(ms);
    }

    // Delivery settings
    if let Some(ms) = toml.delivery.send_timeout_ms {
        config.delivery.send_timeout = Duration::from_millis(ms);
        config.heartbeat.send_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = toml.delivery.max_payload_bytes {
        config.delivery.max_payload_bytes = bytes;
    }

    // Model settings
    let model = &toml.model;
    if let Some(ref runtime) = model.runtime {
        config.model.runtime = parse_runtime(runtime)?;
    }
    if let Some(ref host) = model.host {
        config.model.host = host.clone();
    }
    if let Some(port) = model.port {
        config.model.port = port;
    }
    if let Some(ref name) = model.model {
        config.model.model = name.clone();
    }
    if let Some(secs) = model.http_timeout_secs {
        config.model.http_timeout = Duration::from_secs(secs);
    }
    if model.system_prompt.is_some() {
        config.model.system_prompt = model.system_prompt.clone();
    }
    if let Some(turns) = model.history_turns {
        config.model.history_turns = turns;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// Numeric values that fail to parse are ignored with a warning, matching
/// how a typo in an optional tuning knob should not stop the daemon.
fn apply_env_config(
    config: &mut GatewayConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn number<T: FromStr>(key: &str, value: &str) -> Option<T> {
        let parsed = value.parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value, "Ignoring unparsable environment value");
        }
        parsed
    }

    let mut touched = false;

    if let Some(bind) = env("GATEWAY_BIND") {
        config.server.bind = parse_bind(&bind)?;
        touched = true;
    }
    if let Some(n) = env("GATEWAY_MAX_CONNECTIONS").and_then(|v| number("GATEWAY_MAX_CONNECTIONS", &v)) {
        config.server.max_connections = n;
        touched = true;
    }
    if let Some(n) = env("GATEWAY_MAX_CONCURRENT").and_then(|v| number("GATEWAY_MAX_CONCURRENT", &v)) {
        config.admission.max_concurrent = n;
        touched = true;
    }
    if let Some(policy) = env("GATEWAY_OVERLOAD_POLICY") {
        config.admission.overload_policy = parse_policy(&policy)?;
        touched = true;
    }
    if let Some(secs) = env("GATEWAY_REQUEST_TIMEOUT").and_then(|v| number("GATEWAY_REQUEST_TIMEOUT", &v)) {
        config.admission.request_timeout = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(enabled) = env("GATEWAY_HEARTBEAT") {
        config.heartbeat.enabled = enabled != "0" && !enabled.eq_ignore_ascii_case("false");
        touched = true;
    }
    if let Some(secs) = env("GATEWAY_HEARTBEAT_INTERVAL").and_then(|v| number("GATEWAY_HEARTBEAT_INTERVAL", &v)) {
        config.heartbeat.interval = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(bytes) = env("GATEWAY_MAX_PAYLOAD").and_then(|v| number("GATEWAY_MAX_PAYLOAD", &v)) {
        config.delivery.max_payload_bytes = bytes;
        touched = true;
    }
    if let Some(runtime) = env("GATEWAY_RUNTIME") {
        config.model.runtime = parse_runtime(&runtime)?;
        touched = true;
    }
    if let Some(model) = env("GATEWAY_MODEL") {
        config.model.model = model;
        touched = true;
    }
    if let Some(host) = env("GATEWAY_OLLAMA_HOST") {
        config.model.host = host;
        touched = true;
    }
    if let Some(port) = env("GATEWAY_OLLAMA_PORT").and_then(|v| number("GATEWAY_OLLAMA_PORT", &v)) {
        config.model.port = port;
        touched = true;
    }

    if touched {
        config.mark(ConfigSource::Env);
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<SocketAddr>,
    /// Concurrency override
    pub max_concurrent: Option<usize>,
    /// Runtime override
    pub runtime: Option<RuntimeKind>,
    /// Model name override
    pub model: Option<String>,
    /// Heartbeat enabled override
    pub heartbeat_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set concurrency override
    #[must_use]
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }

    /// Set runtime override
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set heartbeat enabled override
    #[must_use]
    pub fn with_heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = Some(enabled);
        self
    }

    fn is_empty(&self) -> bool {
        self.bind.is_none()
            && self.max_concurrent.is_none()
            && self.runtime.is_none()
            && self.model.is_none()
            && self.heartbeat_enabled.is_none()
    }

    /// Apply overrides to a configuration and re-validate it
    ///
    /// # Errors
    ///
    /// `ValidationError` if an override produces an invalid configuration.
    pub fn apply(&self, config: &mut GatewayConfig) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        config.mark(ConfigSource::Cli);

        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(n) = self.max_concurrent {
            config.admission.max_concurrent = n;
        }
        if let Some(runtime) = self.runtime {
            config.model.runtime = runtime;
        }
        if let Some(ref model) = self.model {
            config.model.model = model.clone();
        }
        if let Some(enabled) = self.heartbeat_enabled {
            config.heartbeat.enabled = enabled;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert_eq!(config.server.bind.to_string(), "127.0.0.1:8765");
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.admission.max_concurrent, 2);
        assert_eq!(config.admission.overload_policy, OverloadPolicy::Wait);
        assert_eq!(config.admission.request_timeout, Duration::from_secs(120));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.delivery.max_payload_bytes, 65_536);
        assert_eq!(config.model.runtime, RuntimeKind::Ollama);
        assert_eq!(config.model.model, "llama3.2");
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("chat-gateway/gateway.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[server]
bind = "0.0.0.0:9000"
max_connections = 10

[admission]
max_concurrent = 4
overload_policy = "reject"
request_timeout_secs = 30
stop_sequences = ["\nuser:"]

[heartbeat]
interval_secs = 10
stale_multiplier = 3.0
grace_period_secs = 5

[delivery]
send_timeout_ms = 250
max_payload_bytes = 2000

[model]
runtime = "scripted"
system_prompt = "Be brief."
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.server.max_connections, 10);
        assert_eq!(config.admission.max_concurrent, 4);
        assert_eq!(config.admission.overload_policy, OverloadPolicy::Reject);
        assert_eq!(config.admission.request_timeout, Duration::from_secs(30));
        assert_eq!(config.admission.stop_sequences, vec!["\nuser:".to_string()]);
        assert_eq!(config.heartbeat.stale_after(), Duration::from_secs(30));
        assert_eq!(config.heartbeat.grace_period, Duration::from_secs(5));
        assert_eq!(config.delivery.send_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat.send_timeout, Duration::from_millis(250));
        assert_eq!(config.model.runtime, RuntimeKind::Scripted);
        assert_eq!(config.model.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let file = write_toml("[admission]\nmax_concurrent = 1\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.admission.max_concurrent, 1);
        assert_eq!(config.admission.max_queue_depth, 64);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/chat-gateway/gateway.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[admission\nmax_concurrent = ");
        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let file = write_toml("[admission]\nmax_concurrent = 0\n");
        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains("max_concurrent")));

        let file = write_toml("[heartbeat]\nstale_multiplier = 1.5\n");
        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref m) if m.contains("stale_multiplier")));

        let file = write_toml("[admission]\noverload_policy = \"drop\"\n");
        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[model]\nmodel = \"file-model\"\n\n[admission]\nmax_concurrent = 3\n");
        let env = env_from(&[
            ("GATEWAY_MODEL", "env-model"),
            ("GATEWAY_HEARTBEAT", "false"),
            ("GATEWAY_MAX_CONCURRENT", "not-a-number"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();
        assert_eq!(config.model.model, "env-model");
        assert!(!config.heartbeat.enabled);
        // Unparsable values fall through to the file
        assert_eq!(config.admission.max_concurrent, 3);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_from(&[("GATEWAY_MAX_CONCURRENT", "3")]);
        let mut config = load_config_with_env(None, env).unwrap();
        assert_eq!(config.admission.max_concurrent, 3);

        ConfigOverrides::new()
            .with_max_concurrent(1)
            .with_runtime(RuntimeKind::Scripted)
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.admission.max_concurrent, 1);
        assert_eq!(config.model.runtime, RuntimeKind::Scripted);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_no_change() {
        let mut config = GatewayConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = GatewayConfig::default();
        let result = ConfigOverrides::new().with_max_concurrent(0).apply(&mut config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("OLLAMA".parse::<RuntimeKind>(), Ok(RuntimeKind::Ollama));
        assert_eq!("echo".parse::<RuntimeKind>(), Ok(RuntimeKind::Scripted));
        assert!("gpt".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
