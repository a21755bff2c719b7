//! Shared Contracts
//!
//! Value types passed between the router, discovery, the protocol adapters and
//! callers. Nothing in here performs I/O.
//!
//! A model id is only unique within its backend, so anything that addresses a
//! model for execution uses a [`ModelTarget`] (id + backend) rather than a bare
//! id.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Backends
// ============================================================================

/// The two supported backend families
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Server exposing the OpenAI-compatible `/v1` API (LM Studio, llama.cpp server, vLLM)
    OpenAiCompatible,
    /// Ollama native API (`/api/*`)
    Ollama,
}

impl BackendKind {
    /// All backend families, in scan order
    pub const ALL: [BackendKind; 2] = [BackendKind::OpenAiCompatible, BackendKind::Ollama];

    /// Human-readable name used in user-facing messages
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::OpenAiCompatible => "OpenAI-compatible server",
            Self::Ollama => "Ollama",
        }
    }

    /// Stable identifier used in config files and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiCompatible => "openai_compatible",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "openai_compatible" | "openai" | "lmstudio" | "lm_studio" => {
                Ok(Self::OpenAiCompatible)
            }
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Connection parameters for one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Whether discovery and routing may use this backend
    pub enabled: bool,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Transport-level retries for transient failures
    pub max_retries: u32,
    /// Base delay between transport retries in milliseconds (linear backoff)
    pub retry_delay_ms: u64,
}

impl ServiceConfig {
    /// Default configuration for a backend family
    #[must_use]
    pub fn default_for(kind: BackendKind) -> Self {
        let port = match kind {
            BackendKind::OpenAiCompatible => 1234,
            BackendKind::Ollama => 11434,
        };
        Self {
            host: "localhost".to_string(),
            port,
            enabled: true,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }

    /// `host:port`, as shown to users
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Per-call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base delay between transport retries
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Result of a single health probe
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceStatus {
    /// Whether the backend answered its list-models call with a 2xx
    pub available: bool,
    /// `host:port` that was probed
    pub endpoint: String,
    /// Round-trip time of the probe
    pub response_time: Option<Duration>,
    /// Error message when unavailable
    pub error: Option<String>,
}

impl ServiceStatus {
    /// Status for a backend that answered
    #[must_use]
    pub fn available(endpoint: impl Into<String>, response_time: Duration) -> Self {
        Self {
            available: true,
            endpoint: endpoint.into(),
            response_time: Some(response_time),
            error: None,
        }
    }

    /// Status for a backend that could not be reached or rejected the probe
    #[must_use]
    pub fn unavailable(endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            available: false,
            endpoint: endpoint.into(),
            response_time: None,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// Models
// ============================================================================

/// Features inferred for a model at discovery time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Streaming generation is supported
    pub supports_streaming: bool,
    /// Multi-turn chat is supported
    pub supports_chat: bool,
    /// Single-turn completion is supported
    pub supports_completion: bool,
    /// System messages are honoured
    pub supports_system_messages: bool,
    /// Context window in tokens, when it could be inferred
    pub max_context_length: Option<u32>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            supports_streaming: true,
            supports_chat: true,
            supports_completion: true,
            supports_system_messages: true,
            max_context_length: None,
        }
    }
}

/// One model discovered on one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvailableModel {
    /// Backend-native id (unique only within `backend`)
    pub id: String,
    /// Display name
    pub name: String,
    /// Backend hosting the model
    pub backend: BackendKind,
    /// Size on disk in bytes, if reported
    pub size: Option<u64>,
    /// Inferred capabilities
    pub capabilities: ModelCapabilities,
}

impl AvailableModel {
    /// The `(id, backend)` pair that addresses this model
    #[must_use]
    pub fn target(&self) -> ModelTarget {
        ModelTarget::new(self.id.clone(), self.backend)
    }
}

/// Model id paired with the backend that owns it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Backend-native model id
    pub model_id: String,
    /// Owning backend
    pub backend: BackendKind,
}

impl ModelTarget {
    /// Create a target
    pub fn new(model_id: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            model_id: model_id.into(),
            backend,
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.backend)
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// Speaker of a chat turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// End user
    User,
    /// Model output
    Assistant,
    /// Instructions
    System,
}

/// One chat turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker
    pub role: ChatRole,
    /// Text content
    pub content: String,
}

impl ChatMessage {
    /// User turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Assistant turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    /// System turn
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

/// One generation call
#[derive(Clone, Debug, PartialEq, Default)]
pub struct GenerateContentRequest {
    /// Backend-native model id
    pub model: String,
    /// Conversation, oldest first
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
    /// Whether the caller asked for streaming
    pub stream: Option<bool>,
    /// System instructions, kept apart from `messages`
    pub system_message: Option<String>,
}

impl GenerateContentRequest {
    /// Single user prompt against a model
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            ..Default::default()
        }
    }

    /// Request from an existing conversation
    pub fn from_messages(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set system message
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_message = Some(system.into());
        self
    }

    /// Set streaming flag
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Append a turn
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Copy of this request aimed at another model id
    #[must_use]
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    /// Whether the request needs the multi-turn wire shape
    #[must_use]
    pub fn is_multi_turn(&self) -> bool {
        self.messages.len() > 1 || self.system_message.is_some()
    }
}

/// Why generation stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of output
    Stop,
    /// Token limit reached
    Length,
    /// Anything else the backend reported
    Other(String),
}

impl FinishReason {
    /// Map a backend's reason string
    #[must_use]
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "eos" | "end_turn" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Other(reason) => reason,
        }
    }
}

/// Token accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens generated
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl Usage {
    /// Build from prompt/completion counts
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// A complete response, or one streaming chunk
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateContentResponse {
    /// Generated text (a delta when streaming)
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Set on complete responses and on the final streaming chunk
    pub finish_reason: Option<FinishReason>,
    /// Token accounting, when reported
    pub usage: Option<Usage>,
}

impl GenerateContentResponse {
    /// Intermediate streaming chunk
    pub fn delta(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            finish_reason: None,
            usage: None,
        }
    }

    /// Terminal streaming chunk
    pub fn finished(model: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            content: String::new(),
            model: model.into(),
            finish_reason: Some(FinishReason::Stop),
            usage,
        }
    }

    /// Whether this is the terminal chunk
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

// ============================================================================
// Discovery Snapshot
// ============================================================================

/// Error recorded for one backend during a scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    /// Backend that failed
    pub backend: BackendKind,
    /// What went wrong
    pub message: String,
}

/// Last known view of all backends
#[derive(Clone, Debug)]
pub struct DiscoveryResult {
    /// All models from all healthy backends
    pub models: Vec<AvailableModel>,
    /// Health per probed backend
    pub statuses: HashMap<BackendKind, ServiceStatus>,
    /// Wall-clock time of the scan
    pub scanned_at: DateTime<Utc>,
    /// Monotonic time of the scan, used for TTL checks
    pub scanned_instant: Instant,
    /// Errors per backend
    pub errors: Vec<BackendError>,
}

impl DiscoveryResult {
    /// Empty result stamped now
    #[must_use]
    pub fn empty() -> Self {
        Self {
            models: Vec::new(),
            statuses: HashMap::new(),
            scanned_at: Utc::now(),
            scanned_instant: Instant::now(),
            errors: Vec::new(),
        }
    }

    /// Whether the snapshot is younger than `ttl`
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.scanned_instant.elapsed() < ttl
    }

    /// Models hosted by one backend
    pub fn models_for(&self, backend: BackendKind) -> impl Iterator<Item = &AvailableModel> {
        self.models.iter().filter(move |m| m.backend == backend)
    }
}

// ============================================================================
// Error Context
// ============================================================================

/// Which adapter operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Health probe
    HealthCheck,
    /// Catalog listing
    ListModels,
    /// Non-streaming generation
    Generate,
    /// Streaming generation
    GenerateStream,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HealthCheck => "health_check",
            Self::ListModels => "list_models",
            Self::Generate => "generate",
            Self::GenerateStream => "generate_stream",
        };
        f.write_str(name)
    }
}

/// Metadata about one failing call attempt
#[derive(Clone, Debug)]
pub struct ErrorContext {
    /// Backend the call went to
    pub backend: BackendKind,
    /// Operation attempted
    pub operation: Operation,
    /// Model involved, if any
    pub model_id: Option<String>,
    /// `host:port` of the backend, if known
    pub endpoint: Option<String>,
    /// Whole-call attempts already made against this target
    pub attempt: u32,
    /// Whole-call attempt budget
    pub max_retries: u32,
}

impl ErrorContext {
    /// Context for a call against `target`
    #[must_use]
    pub fn for_target(target: &ModelTarget, operation: Operation, max_retries: u32) -> Self {
        Self {
            backend: target.backend,
            operation,
            model_id: Some(target.model_id.clone()),
            endpoint: None,
            attempt: 0,
            max_retries,
        }
    }

    /// Set endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set attempt number
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}
