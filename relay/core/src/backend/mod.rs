//! Backend Integration
//!
//! Protocol adapters for the supported local inference servers behind one
//! common trait.
//!
//! # Available Backends
//!
//! - **OpenAI-compatible**: LM Studio, llama.cpp server, vLLM (`/v1/*`)
//! - **Ollama**: native API (`/api/*`)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{Backend, OllamaBackend};
//! use relay_core::contracts::{BackendKind, GenerateContentRequest, ServiceConfig};
//!
//! let backend = OllamaBackend::new(ServiceConfig::default_for(BackendKind::Ollama));
//! let request = GenerateContentRequest::new("llama2:7b", "Hello!");
//! let mut stream = backend.generate_content_stream(&request).await?;
//! ```

pub mod capabilities;
mod ollama;
mod openai;
mod stream;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use ollama::{wire as ollama_wire, OllamaBackend};
pub use openai::{wire as openai_wire, OpenAiCompatibleBackend};
pub use stream::{ChunkUpdate, ResponseStream, StreamChunk};
pub use traits::Backend;

use crate::contracts::{BackendKind, ServiceConfig};

/// Build the adapter for a backend family
#[must_use]
pub fn create_backend(
    kind: BackendKind,
    config: ServiceConfig,
    health_timeout: Duration,
) -> Arc<dyn Backend> {
    match kind {
        BackendKind::OpenAiCompatible => {
            Arc::new(OpenAiCompatibleBackend::new(config).with_health_timeout(health_timeout))
        }
        BackendKind::Ollama => {
            Arc::new(OllamaBackend::new(config).with_health_timeout(health_timeout))
        }
    }
}
