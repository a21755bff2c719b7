//! Relay Core - Request Routing for Local Inference Backends
//!
//! This crate issues one uniform "generate content" request against local
//! inference servers that speak two incompatible wire protocols, without the
//! caller needing to know which server is alive, which model exists where,
//! or how to recover from an outage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          RelayClient                             │
//! │  ┌────────────────────┐            ┌──────────────────────────┐  │
//! │  │   ModelDiscovery   │──models──▶ │       ModelRouter        │  │
//! │  │  scan / TTL cache  │            │ retry / failover / health│  │
//! │  └─────────┬──────────┘            └────────────┬─────────────┘  │
//! │            │                                    │                │
//! │            │          ┌──────────────────┐      │                │
//! │            │          │ ErrorClassifier  │◀─────┘                │
//! │            │          └──────────────────┘                       │
//! │            ▼                                                     │
//! │  ┌──────────────────────────┐   ┌────────────────────────────┐   │
//! │  │ OpenAiCompatibleBackend  │   │       OllamaBackend        │   │
//! │  │   /v1/*  SSE frames      │   │   /api/*  NDJSON lines     │   │
//! │  └────────────┬─────────────┘   └──────────────┬─────────────┘   │
//! │               └──────────────┬─────────────────┘                 │
//! │                       HttpTransport                              │
//! └──────────────────────────────┼───────────────────────────────────┘
//!                                ▼
//!                       local inference servers
//! ```
//!
//! # Key Types
//!
//! - [`RelayClient`]: discovery and routing behind one handle
//! - [`ModelTarget`]: a model id paired with the backend that owns it
//! - [`GenerateContentRequest`] / [`GenerateContentResponse`]: the uniform call shape
//! - [`ResponseStream`]: streaming chunks with `close()` and cancellation
//! - [`RouteError`]: user message, technical message and the underlying [`GatewayError`]
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{load_config, GenerateContentRequest, ModelTarget, RelayClient};
//! use relay_core::contracts::BackendKind;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = RelayClient::new(&load_config()?);
//!
//!     for model in client.discover_models().await {
//!         println!("{} on {}", model.id, model.backend);
//!     }
//!
//!     let request = GenerateContentRequest::new("llama2:7b", "Why is the sky blue?");
//!     let target = ModelTarget::new("llama2:7b", BackendKind::Ollama);
//!     let response = client.generate(&request, &target).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`contracts`]: value types shared by every component
//! - [`error`]: the [`GatewayError`] taxonomy
//! - [`transport`]: HTTP with timeouts, bounded retries and line-framed streaming
//! - [`classifier`]: failure to retry / fallback decision
//! - [`backend`]: the [`Backend`] trait and both protocol adapters
//! - [`discovery`]: health probes, catalog merge and TTL cache
//! - [`routing`]: retry, failover and the router health cache
//! - [`config`]: TOML and environment configuration loading
//! - [`client`]: the [`RelayClient`] facade

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod classifier;
pub mod client;
pub mod config;
pub mod contracts;
pub mod discovery;
pub mod error;
pub mod routing;
pub mod transport;

// Re-exports for convenience
pub use backend::{Backend, OllamaBackend, OpenAiCompatibleBackend, ResponseStream};
pub use classifier::{ErrorClassifier, ErrorDecision};
pub use client::RelayClient;
pub use contracts::{
    AvailableModel, BackendKind, ChatMessage, ChatRole, DiscoveryResult, FinishReason,
    GenerateContentRequest, GenerateContentResponse, ModelCapabilities, ModelTarget,
    ServiceConfig, ServiceStatus, Usage,
};
pub use discovery::ModelDiscovery;
pub use error::GatewayError;
pub use routing::{ModelRouter, RouteError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env, ConfigError,
    ConfigSource, DiscoveryConfig, RelayConfig, RouterConfig,
};
