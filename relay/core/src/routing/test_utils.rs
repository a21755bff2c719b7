//! Routing Test Utilities
//!
//! Provides a scriptable [`MockBackend`] for testing discovery and routing
//! without any network. Health, catalog, failures and responses are set per
//! test, and call counters let tests assert how often each operation ran.
//!
//! # Usage
//!
//! ```ignore
//! use crate::routing::test_utils::MockBackend;
//!
//! let backend = MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]);
//!
//! // Fail the next two generate calls, then succeed
//! backend.fail_next(unavailable(BackendKind::Ollama));
//! backend.fail_next(unavailable(BackendKind::Ollama));
//!
//! assert_eq!(backend.generate_calls(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::capabilities::infer_capabilities;
use crate::backend::{Backend, ResponseStream};
use crate::contracts::{
    AvailableModel, BackendKind, FinishReason, GenerateContentRequest, GenerateContentResponse,
    ServiceConfig, ServiceStatus, Usage,
};
use crate::error::{GatewayError, Result};

/// `ServiceUnavailable` for a backend at its default endpoint
pub fn unavailable(backend: BackendKind) -> GatewayError {
    GatewayError::ServiceUnavailable {
        backend,
        endpoint: ServiceConfig::default_for(backend).endpoint(),
        reason: "connection refused".to_string(),
    }
}

/// Scriptable in-memory backend
#[derive(Debug)]
pub struct MockBackend {
    kind: BackendKind,
    config: ServiceConfig,
    healthy: AtomicBool,
    health_delay: Duration,
    models: Mutex<Vec<AvailableModel>>,
    list_error: Mutex<Option<GatewayError>>,
    /// Errors returned by the next generate calls, in order
    scripted_failures: Mutex<VecDeque<GatewayError>>,
    /// Error returned by every generate call once the script is empty
    persistent_failure: Mutex<Option<GatewayError>>,
    reply: Mutex<String>,
    health_checks: AtomicUsize,
    list_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    requested_models: Mutex<Vec<String>>,
}

impl MockBackend {
    /// Healthy backend with no models
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            config: ServiceConfig::default_for(kind),
            healthy: AtomicBool::new(true),
            health_delay: Duration::ZERO,
            models: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            reply: Mutex::new(format!("hello from {kind}")),
            health_checks: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            requested_models: Mutex::new(Vec::new()),
        }
    }

    /// Set the catalog
    pub fn with_models(self, ids: &[&str]) -> Self {
        *self.models.lock() = ids
            .iter()
            .map(|id| AvailableModel {
                id: (*id).to_string(),
                name: (*id).to_string(),
                backend: self.kind,
                size: None,
                capabilities: infer_capabilities(id),
            })
            .collect();
        self
    }

    /// Set the generated text
    pub fn with_reply(self, reply: &str) -> Self {
        *self.reply.lock() = reply.to_string();
        self
    }

    /// Make every health probe take `delay`
    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    /// Start unhealthy
    pub fn down(self) -> Self {
        self.set_healthy(false);
        self
    }

    /// Wrap for use as `dyn Backend`
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Toggle health
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `list_models` fail
    pub fn fail_listing(&self, error: GatewayError) {
        *self.list_error.lock() = Some(error);
    }

    /// Fail the next generate call with `error`
    pub fn fail_next(&self, error: GatewayError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Fail every generate call with `error`
    pub fn fail_always(&self, error: GatewayError) {
        *self.persistent_failure.lock() = Some(error);
    }

    /// Number of health probes
    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Number of catalog listings
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of generate calls, streaming included
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of streaming generate calls
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Model ids requested so far, in order
    pub fn requested_models(&self) -> Vec<String> {
        self.requested_models.lock().clone()
    }

    fn next_outcome(&self, request: &GenerateContentRequest) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_models.lock().push(request.model.clone());

        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(ref error) = *self.persistent_failure.lock() {
            return Err(error.clone());
        }
        if !self.models.lock().iter().any(|m| m.id == request.model) {
            return Err(GatewayError::ModelNotFound {
                backend: self.kind,
                model_id: request.model.clone(),
            });
        }
        Ok(self.reply.lock().clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn check_health(&self) -> ServiceStatus {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        if self.healthy.load(Ordering::SeqCst) {
            ServiceStatus::available(self.config.endpoint(), Duration::from_millis(1))
        } else {
            ServiceStatus::unavailable(self.config.endpoint(), "connection refused")
        }
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref error) = *self.list_error.lock() {
            return Err(error.clone());
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(unavailable(self.kind));
        }
        Ok(self.models.lock().clone())
    }

    async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let content = self.next_outcome(request)?;
        Ok(GenerateContentResponse {
            content,
            model: request.model.clone(),
            finish_reason: Some(FinishReason::Stop),
            usage: Some(Usage::new(1, 1)),
        })
    }

    async fn generate_content_stream(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let content = self.next_outcome(request)?;
        let mut items: Vec<Result<GenerateContentResponse>> = content
            .split_inclusive(' ')
            .map(|word| Ok(GenerateContentResponse::delta(request.model.clone(), word)))
            .collect();
        items.push(Ok(GenerateContentResponse::finished(
            request.model.clone(),
            Some(Usage::new(1, 1)),
        )));
        Ok(ResponseStream::from_results(items))
    }
}
