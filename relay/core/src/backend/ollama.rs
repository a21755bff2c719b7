//! Ollama Backend Implementation
//!
//! Adapter for Ollama's native API.
//!
//! # Ollama API
//!
//! - `/api/tags` - List available models (also the health probe)
//! - `/api/generate` - Single-turn completion, `response` carries the text
//! - `/api/chat` - Chat completion with message history, `message.content`
//!
//! Streaming bodies are NDJSON: one object per line, the last with
//! `done: true` and the token counts.
//!
//! Requests with exactly one message and no system message use
//! `/api/generate`; everything else uses `/api/chat`.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::capabilities::infer_capabilities;
use super::stream::{ChunkUpdate, ResponseStream, StreamChunk};
use super::traits::Backend;
use crate::contracts::{
    AvailableModel, BackendKind, FinishReason, GenerateContentRequest, GenerateContentResponse,
    ServiceConfig, ServiceStatus,
};
use crate::error::{GatewayError, Result};
use crate::transport::HttpTransport;

/// Default timeout for health probes
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Native Ollama request and response shapes
pub mod wire {
    use serde::{Deserialize, Serialize};

    use crate::contracts::{ChatMessage, ChatRole, Usage};

    /// `GET /api/tags` response
    #[derive(Debug, Default, Deserialize)]
    pub struct TagsResponse {
        /// Installed models
        #[serde(default)]
        pub models: Vec<TagModel>,
    }

    /// One installed model
    #[derive(Debug, Deserialize)]
    pub struct TagModel {
        /// Model id, e.g. `llama2:7b`
        pub name: String,
        /// Last modification time
        #[serde(default)]
        pub modified_at: Option<String>,
        /// Size on disk in bytes
        #[serde(default)]
        pub size: Option<u64>,
        /// Content digest
        #[serde(default)]
        pub digest: Option<String>,
        /// Model metadata
        #[serde(default)]
        pub details: Option<ModelDetails>,
    }

    /// `details` object of a tag entry
    #[derive(Debug, Default, Deserialize)]
    pub struct ModelDetails {
        /// File format (`gguf`)
        #[serde(default)]
        pub format: Option<String>,
        /// Model family
        #[serde(default)]
        pub family: Option<String>,
        /// Parameter count, e.g. `7B`
        #[serde(default)]
        pub parameter_size: Option<String>,
        /// Quantization, e.g. `Q4_0`
        #[serde(default)]
        pub quantization_level: Option<String>,
    }

    /// Sampling options
    #[derive(Debug, Default, Serialize, PartialEq)]
    pub struct Options {
        /// Sampling temperature
        #[serde(skip_serializing_if = "Option::is_none")]
        pub temperature: Option<f32>,
        /// Maximum tokens to generate
        #[serde(skip_serializing_if = "Option::is_none")]
        pub num_predict: Option<u32>,
    }

    impl Options {
        /// Whether no option is set
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.temperature.is_none() && self.num_predict.is_none()
        }
    }

    /// `POST /api/generate` body
    #[derive(Debug, Serialize)]
    pub struct GenerateRequest<'a> {
        /// Model id
        pub model: &'a str,
        /// The single user turn
        pub prompt: String,
        /// Stream NDJSON or return one object
        pub stream: bool,
        /// Sampling options
        #[serde(skip_serializing_if = "Options::is_empty")]
        pub options: Options,
    }

    /// One message in a chat body
    #[derive(Debug, Serialize, PartialEq)]
    pub struct WireMessage<'a> {
        /// Speaker
        pub role: ChatRole,
        /// Text
        pub content: &'a str,
    }

    impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
        fn from(message: &'a ChatMessage) -> Self {
            Self {
                role: message.role,
                content: &message.content,
            }
        }
    }

    /// `POST /api/chat` body
    #[derive(Debug, Serialize)]
    pub struct ChatRequest<'a> {
        /// Model id
        pub model: &'a str,
        /// Conversation, system message first
        pub messages: Vec<WireMessage<'a>>,
        /// Stream NDJSON or return one object
        pub stream: bool,
        /// Sampling options
        #[serde(skip_serializing_if = "Options::is_empty")]
        pub options: Options,
    }

    /// Assistant message in a chat reply
    #[derive(Debug, Default, Deserialize)]
    pub struct ReplyMessage {
        /// Generated text
        #[serde(default)]
        pub content: String,
    }

    /// A generate or chat reply, whole or one NDJSON line
    #[derive(Debug, Default, Deserialize)]
    pub struct Reply {
        /// Model that answered
        #[serde(default)]
        pub model: Option<String>,
        /// Timestamp
        #[serde(default)]
        pub created_at: Option<String>,
        /// Text (`/api/generate`)
        #[serde(default)]
        pub response: Option<String>,
        /// Message (`/api/chat`)
        #[serde(default)]
        pub message: Option<ReplyMessage>,
        /// Completion flag
        #[serde(default)]
        pub done: bool,
        /// Why generation stopped
        #[serde(default)]
        pub done_reason: Option<String>,
        /// Prompt tokens
        #[serde(default)]
        pub prompt_eval_count: Option<u32>,
        /// Generated tokens
        #[serde(default)]
        pub eval_count: Option<u32>,
        /// Failure reported in place of a reply
        #[serde(default)]
        pub error: Option<String>,
    }

    impl Reply {
        /// Text carried by this reply, whichever endpoint produced it
        pub fn text(&self) -> Option<&str> {
            self.response
                .as_deref()
                .or_else(|| self.message.as_ref().map(|m| m.content.as_str()))
        }

        /// Token counts, when the reply has any
        pub fn usage(&self) -> Option<Usage> {
            match (self.prompt_eval_count, self.eval_count) {
                (None, None) => None,
                (prompt, completion) => {
                    Some(Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0)))
                }
            }
        }
    }
}

impl StreamChunk for wire::Reply {
    fn into_update(self) -> ChunkUpdate {
        ChunkUpdate {
            text: self.text().map(str::to_string),
            usage: if self.done { self.usage() } else { None },
            done: self.done,
            error: self.error,
        }
    }
}

/// Prompt for `/api/generate`
///
/// Only single-turn requests without a system message take this path.
fn build_prompt(request: &GenerateContentRequest) -> String {
    request
        .messages
        .first()
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

fn build_options(request: &GenerateContentRequest) -> wire::Options {
    wire::Options {
        temperature: request.temperature,
        num_predict: request.max_tokens,
    }
}

fn build_messages(request: &GenerateContentRequest) -> Vec<wire::WireMessage<'_>> {
    let system = request.system_message.as_deref().map(|content| wire::WireMessage {
        role: crate::contracts::ChatRole::System,
        content,
    });
    system
        .into_iter()
        .chain(request.messages.iter().map(wire::WireMessage::from))
        .collect()
}

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    transport: HttpTransport,
    health_timeout: Duration,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            transport: HttpTransport::new(BackendKind::Ollama, config),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    /// Set the health probe timeout
    #[must_use]
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Turn a 404 from a generate call into `ModelNotFound`
    fn map_not_found(&self, error: GatewayError, model: &str) -> GatewayError {
        match error {
            GatewayError::Api { status: 404, .. } => GatewayError::ModelNotFound {
                backend: BackendKind::Ollama,
                model_id: model.to_string(),
            },
            other => other,
        }
    }

    async fn post_reply<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
        model: &str,
    ) -> Result<wire::Reply> {
        self.transport
            .post::<wire::Reply, B>(path, body)
            .await
            .map(|response| response.data)
            .map_err(|e| self.map_not_found(e, model))
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(ServiceConfig::default_for(BackendKind::Ollama))
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn config(&self) -> &ServiceConfig {
        self.transport.config()
    }

    async fn check_health(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self
            .transport
            .request_with::<wire::TagsResponse, ()>(
                reqwest::Method::GET,
                "/api/tags",
                None,
                self.health_timeout,
                0,
            )
            .await;

        match result {
            Ok(_) => ServiceStatus::available(self.transport.endpoint(), start.elapsed()),
            Err(e) => {
                tracing::debug!(backend = "ollama", error = %e, "Health check failed");
                ServiceStatus::unavailable(self.transport.endpoint(), e.to_string())
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>> {
        let tags = self.transport.get::<wire::TagsResponse>("/api/tags").await?;

        let models = tags
            .data
            .models
            .into_iter()
            .map(|m| AvailableModel {
                capabilities: infer_capabilities(&m.name),
                id: m.name.clone(),
                name: m.name,
                backend: BackendKind::Ollama,
                size: m.size,
            })
            .collect();

        Ok(models)
    }

    async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let reply = if request.is_multi_turn() {
            let body = wire::ChatRequest {
                model: &request.model,
                messages: build_messages(request),
                stream: false,
                options: build_options(request),
            };
            self.post_reply("/api/chat", &body, &request.model).await?
        } else {
            let body = wire::GenerateRequest {
                model: &request.model,
                prompt: build_prompt(request),
                stream: false,
                options: build_options(request),
            };
            self.post_reply("/api/generate", &body, &request.model)
                .await?
        };

        let finish_reason = match reply.done_reason.as_deref() {
            Some(reason) => Some(FinishReason::from_wire(reason)),
            None if reply.done => Some(FinishReason::Stop),
            None => None,
        };

        Ok(GenerateContentResponse {
            content: reply.text().unwrap_or_default().to_string(),
            model: reply.model.clone().unwrap_or_else(|| request.model.clone()),
            finish_reason,
            usage: reply.usage(),
        })
    }

    async fn generate_content_stream(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream> {
        let frames = if request.is_multi_turn() {
            let body = wire::ChatRequest {
                model: &request.model,
                messages: build_messages(request),
                stream: true,
                options: build_options(request),
            };
            self.transport.stream::<wire::Reply, _>("/api/chat", &body).await
        } else {
            let body = wire::GenerateRequest {
                model: &request.model,
                prompt: build_prompt(request),
                stream: true,
                options: build_options(request),
            };
            self.transport
                .stream::<wire::Reply, _>("/api/generate", &body)
                .await
        }
        .map_err(|e| self.map_not_found(e, &request.model))?;

        tracing::debug!(backend = "ollama", model = %request.model, "Stream opened");
        Ok(ResponseStream::spawn(frames, request.model.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ChatMessage, Usage};

    #[test]
    fn test_build_prompt() {
        let request = GenerateContentRequest::new("test", "Hello");
        assert!(!request.is_multi_turn());
        assert_eq!(build_prompt(&request), "Hello");

        let request = GenerateContentRequest::new("test", "Hello").with_system("Be helpful");
        assert!(request.is_multi_turn());
    }

    #[test]
    fn test_chat_body_puts_system_first() {
        let mut request = GenerateContentRequest::new("llama3", "Hi").with_system("Be brief");
        request.push_message(ChatMessage::assistant("Hello!"));

        let body = wire::ChatRequest {
            model: &request.model,
            messages: build_messages(&request),
            stream: false,
            options: build_options(&request),
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "Be brief");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][2]["role"], "assistant");
        assert!(json.get("options").is_none());
    }

    #[test]
    fn test_generate_body_options() {
        let request = GenerateContentRequest::new("llama3", "Hi")
            .with_temperature(0.5)
            .with_max_tokens(32);
        let body = wire::GenerateRequest {
            model: &request.model,
            prompt: build_prompt(&request),
            stream: true,
            options: build_options(&request),
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["options"]["temperature"], 0.5);
        assert_eq!(json["options"]["num_predict"], 32);
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_reply_text_from_either_endpoint() {
        let generate: wire::Reply =
            serde_json::from_str(r#"{"model":"m","response":"hi","done":false}"#).unwrap();
        assert_eq!(generate.text(), Some("hi"));

        let chat: wire::Reply = serde_json::from_str(
            r#"{"model":"m","message":{"role":"assistant","content":"yo"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(chat.text(), Some("yo"));
    }

    #[test]
    fn test_final_chunk_carries_usage() {
        let last: wire::Reply = serde_json::from_str(
            r#"{"model":"m","response":"","done":true,"prompt_eval_count":5,"eval_count":7}"#,
        )
        .unwrap();
        let update = last.into_update();
        assert!(update.done);
        assert_eq!(update.usage, Some(Usage::new(5, 7)));
    }

    #[test]
    fn test_error_line_becomes_update_error() {
        let line: wire::Reply =
            serde_json::from_str(r#"{"error":"llama runner process has terminated"}"#).unwrap();
        let update = line.into_update();
        assert!(!update.done);
        assert_eq!(
            update.error.as_deref(),
            Some("llama runner process has terminated")
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let backend = OllamaBackend::default();
        let err = backend.map_not_found(
            GatewayError::Api {
                backend: BackendKind::Ollama,
                status: 404,
                message: "model 'nope' not found".to_string(),
            },
            "nope",
        );
        assert!(matches!(err, GatewayError::ModelNotFound { ref model_id, .. } if model_id == "nope"));
    }

    #[test]
    fn test_backend_config() {
        let backend = OllamaBackend::default();
        assert_eq!(backend.kind(), BackendKind::Ollama);
        assert_eq!(backend.config().port, 11434);
    }
}
