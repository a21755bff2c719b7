//! OpenAI-Compatible Backend Implementation
//!
//! Adapter for servers exposing the OpenAI `/v1` API locally (LM Studio,
//! llama.cpp server, vLLM and friends).
//!
//! # API
//!
//! - `/v1/models` - List loaded models (also the health probe)
//! - `/v1/chat/completions` - Chat completion, whole or streamed
//!
//! Streams are SSE: `data: {json}` frames terminated by `data: [DONE]`, text
//! at `choices[0].delta.content`. Some servers send usage on a trailing frame
//! whose `choices` is empty.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::capabilities::infer_capabilities;
use super::stream::{ChunkUpdate, ResponseStream, StreamChunk};
use super::traits::Backend;
use crate::contracts::{
    AvailableModel, BackendKind, ChatRole, FinishReason, GenerateContentRequest,
    GenerateContentResponse, ServiceConfig, ServiceStatus,
};
use crate::error::{GatewayError, Result};
use crate::transport::HttpTransport;

/// Default timeout for health probes
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const MODELS_PATH: &str = "/v1/models";
const CHAT_PATH: &str = "/v1/chat/completions";

/// Native OpenAI-compatible request and response shapes
pub mod wire {
    use serde::{Deserialize, Serialize};

    use crate::contracts::{ChatRole, Usage};

    /// `GET /v1/models` response
    #[derive(Debug, Default, Deserialize)]
    pub struct ModelList {
        /// Always `list`
        #[serde(default)]
        pub object: Option<String>,
        /// Loaded models
        #[serde(default)]
        pub data: Vec<ModelEntry>,
    }

    /// One model entry
    #[derive(Debug, Deserialize)]
    pub struct ModelEntry {
        /// Model id
        pub id: String,
        /// Always `model`
        #[serde(default)]
        pub object: Option<String>,
        /// Creation time, unix seconds
        #[serde(default)]
        pub created: Option<i64>,
        /// Publisher
        #[serde(default)]
        pub owned_by: Option<String>,
    }

    /// One message in a request body
    #[derive(Debug, Serialize, PartialEq)]
    pub struct WireMessage<'a> {
        /// Speaker
        pub role: ChatRole,
        /// Text
        pub content: &'a str,
    }

    /// `POST /v1/chat/completions` body
    #[derive(Debug, Serialize)]
    pub struct ChatRequest<'a> {
        /// Model id
        pub model: &'a str,
        /// Conversation, system message first
        pub messages: Vec<WireMessage<'a>>,
        /// Sampling temperature
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f32>,
        /// Maximum tokens to generate
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_tokens: Option<u32>,
        /// Stream SSE frames
        pub stream: bool,
    }

    /// Token accounting
    #[derive(Debug, Clone, Copy, Deserialize)]
    pub struct WireUsage {
        /// Prompt tokens
        #[serde(default)]
        pub prompt_tokens: u32,
        /// Generated tokens
        #[serde(default)]
        pub completion_tokens: u32,
        /// Sum
        #[serde(default)]
        pub total_tokens: Option<u32>,
    }

    impl From<WireUsage> for Usage {
        fn from(usage: WireUsage) -> Self {
            let mut normalized = Usage::new(usage.prompt_tokens, usage.completion_tokens);
            if let Some(total) = usage.total_tokens {
                normalized.total_tokens = total;
            }
            normalized
        }
    }

    /// Assistant message in a complete reply
    #[derive(Debug, Default, Deserialize)]
    pub struct ReplyMessage {
        /// Generated text
        #[serde(default)]
        pub content: Option<String>,
    }

    /// One choice in a complete reply
    #[derive(Debug, Deserialize)]
    pub struct Choice {
        /// Generated message
        #[serde(default)]
        pub message: ReplyMessage,
        /// Why generation stopped
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    /// Complete chat reply
    #[derive(Debug, Deserialize)]
    pub struct ChatCompletion {
        /// Model that answered
        #[serde(default)]
        pub model: Option<String>,
        /// Choices, first one used
        #[serde(default)]
        pub choices: Vec<Choice>,
        /// Token accounting
        #[serde(default)]
        pub usage: Option<WireUsage>,
    }

    /// Incremental content in a stream frame
    #[derive(Debug, Default, Deserialize)]
    pub struct Delta {
        /// New text, absent on role-only and final frames
        #[serde(default)]
        pub content: Option<String>,
    }

    /// One choice in a stream frame
    #[derive(Debug, Deserialize)]
    pub struct ChunkChoice {
        /// New content
        #[serde(default)]
        pub delta: Delta,
        /// Set on the last content frame
        #[serde(default)]
        pub finish_reason: Option<String>,
    }

    /// One SSE frame
    #[derive(Debug, Deserialize)]
    pub struct ChatChunk {
        /// Model that answered
        #[serde(default)]
        pub model: Option<String>,
        /// Choices, may be empty on a usage-only frame
        #[serde(default)]
        pub choices: Vec<ChunkChoice>,
        /// Token accounting
        #[serde(default)]
        pub usage: Option<WireUsage>,
        /// Failure sent in place of a delta
        #[serde(default)]
        pub error: Option<StreamError>,
    }

    /// `error` member of a failed frame, object or bare string
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum StreamError {
        /// `{"error": {"message": "..."}}`
        Detailed {
            /// Human-readable cause
            message: String,
        },
        /// `{"error": "..."}`
        Text(String),
    }

    impl StreamError {
        /// The error text, whichever shape carried it
        #[must_use]
        pub fn into_message(self) -> String {
            match self {
                Self::Detailed { message } | Self::Text(message) => message,
            }
        }
    }
}

impl StreamChunk for wire::ChatChunk {
    fn into_update(self) -> ChunkUpdate {
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content);
        ChunkUpdate {
            text,
            usage: self.usage.map(Into::into),
            // completion is signalled by [DONE]; usage may still follow finish_reason
            done: false,
            error: self.error.map(wire::StreamError::into_message),
        }
    }
}

fn build_request(request: &GenerateContentRequest, stream: bool) -> wire::ChatRequest<'_> {
    let system = request
        .system_message
        .as_deref()
        .map(|content| wire::WireMessage {
            role: ChatRole::System,
            content,
        });
    let messages = system
        .into_iter()
        .chain(request.messages.iter().map(|m| wire::WireMessage {
            role: m.role,
            content: &m.content,
        }))
        .collect();

    wire::ChatRequest {
        model: &request.model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream,
    }
}

/// Whether an API error means the model does not exist
///
/// Servers disagree: some answer 404, others 400 with a message.
fn is_model_not_found(error: &GatewayError) -> bool {
    match error {
        GatewayError::Api { status: 404, .. } => true,
        GatewayError::Api {
            status: 400,
            message,
            ..
        } => {
            let message = message.to_ascii_lowercase();
            message.contains("model")
                && (message.contains("not found") || message.contains("does not exist"))
        }
        _ => false,
    }
}

/// OpenAI-compatible backend client
#[derive(Clone, Debug)]
pub struct OpenAiCompatibleBackend {
    transport: HttpTransport,
    health_timeout: Duration,
}

impl OpenAiCompatibleBackend {
    /// Create a new OpenAI-compatible backend
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            transport: HttpTransport::new(BackendKind::OpenAiCompatible, config),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Set the health probe timeout
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    fn map_not_found(&self, error: GatewayError, model: &str) -> GatewayError {
        if is_model_not_found(&error) {
            GatewayError::ModelNotFound {
                backend: BackendKind::OpenAiCompatible,
                model_id: model.to_string(),
            }
        } else {
            error
        }
    }
}

impl Default for OpenAiCompatibleBackend {
    fn default() -> Self {
        Self::new(ServiceConfig::default_for(BackendKind::OpenAiCompatible))
    }
}

#[async_trait]
impl Backend for OpenAiCompatibleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    fn config(&self) -> &ServiceConfig {
        self.transport.config()
    }

    async fn check_health(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self
            .transport
            .request_with::<wire::ModelList, ()>(
                reqwest::Method::GET,
                MODELS_PATH,
                None,
                self.health_timeout,
                0,
            )
            .await;

        match result {
            Ok(_) => ServiceStatus::available(self.transport.endpoint(), start.elapsed()),
            Err(e) => {
                tracing::debug!(backend = "openai_compatible", error = %e, "Health check failed");
                ServiceStatus::unavailable(self.transport.endpoint(), e.to_string())
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>> {
        let list = self.transport.get::<wire::ModelList>(MODELS_PATH).await?;

        let models = list
            .data
            .data
            .into_iter()
            .map(|entry| AvailableModel {
                capabilities: infer_capabilities(&entry.id),
                name: entry.id.clone(),
                id: entry.id,
                backend: BackendKind::OpenAiCompatible,
                size: None,
            })
            .collect();

        Ok(models)
    }

    async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let body = build_request(request, false);
        let completion = self
            .transport
            .post::<wire::ChatCompletion, _>(CHAT_PATH, &body)
            .await
            .map_err(|e| self.map_not_found(e, &request.model))?
            .data;

        let choice = completion.choices.into_iter().next();
        let (content, finish_reason) = match choice {
            Some(choice) => (
                choice.message.content.unwrap_or_default(),
                choice.finish_reason.as_deref().map(FinishReason::from_wire),
            ),
            None => (String::new(), None),
        };

        Ok(GenerateContentResponse {
            content,
            model: completion.model.unwrap_or_else(|| request.model.clone()),
            finish_reason,
            usage: completion.usage.map(Into::into),
        })
    }

    async fn generate_content_stream(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream> {
        let body = build_request(request, true);
        let frames = self
            .transport
            .stream::<wire::ChatChunk, _>(CHAT_PATH, &body)
            .await
            .map_err(|e| self.map_not_found(e, &request.model))?;

        tracing::debug!(backend = "openai_compatible", model = %request.model, "Stream opened");
        Ok(ResponseStream::spawn(frames, request.model.clone()))
    }
}
