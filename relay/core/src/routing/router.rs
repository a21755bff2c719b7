//! Model Router
//!
//! Executes one generation call against a [`ModelTarget`], retrying and failing
//! over according to the [`ErrorClassifier`].
//!
//! # Call State Machine
//!
//! ```text
//!              +-----------+
//!    start --> | Attempting| --ok--> Success
//!              +-----------+
//!                 |    ^
//!           error |    | backoff(d * 2^n)
//!                 v    |
//!           classify --+-- should_retry
//!                 |
//!                 +-- fallback on untried backend + failover on --> FailingOver --> Attempting
//!                 |
//!                 +-- otherwise --> Exhausted (RouteError)
//! ```
//!
//! At most one failover hop is taken. If the fallback target fails too, the
//! error from the original target is surfaced.
//!
//! # Usage
//!
//! ```ignore
//! let router = ModelRouter::new(discovery, RouterConfig::default());
//! router.update_available_models(&discovery.scan().await.models);
//!
//! let target = ModelTarget::new("llama2:7b", BackendKind::Ollama);
//! let response = router.generate(&request, &target).await?;
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::health::HealthCache;
use crate::backend::{Backend, ResponseStream};
use crate::classifier::{ErrorClassifier, ErrorDecision};
use crate::config::RouterConfig;
use crate::contracts::{
    AvailableModel, BackendKind, ErrorContext, GenerateContentRequest, GenerateContentResponse,
    ModelTarget, Operation,
};
use crate::discovery::ModelDiscovery;
use crate::error::GatewayError;

// ============================================================================
// Route Error
// ============================================================================

/// Error surfaced to callers of the router
#[derive(Debug, Error)]
#[error("{user_message}")]
pub struct RouteError {
    /// Short message safe to show an end user
    pub user_message: String,
    /// Detailed message for logs
    pub technical_message: String,
    /// Underlying failure
    pub source: GatewayError,
}

impl RouteError {
    fn from_decision(source: GatewayError, decision: ErrorDecision) -> Self {
        Self {
            user_message: decision.user_message,
            technical_message: decision.technical_message,
            source,
        }
    }

    /// Underlying failure
    #[must_use]
    pub fn gateway_error(&self) -> &GatewayError {
        &self.source
    }

    /// Whether the call was cancelled by the caller
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, GatewayError::Cancelled)
    }
}

// ============================================================================
// Known Models
// ============================================================================

/// Snapshot of the catalog the router validates against
#[derive(Debug, Default)]
struct KnownModels {
    targets: HashSet<ModelTarget>,
    models: Vec<AvailableModel>,
}

impl KnownModels {
    fn from_models(models: &[AvailableModel]) -> Self {
        Self {
            targets: models.iter().map(AvailableModel::target).collect(),
            models: models.to_vec(),
        }
    }
}

/// The adapter call one attempt makes, typed by what it yields
type Dispatch<T> =
    fn(Arc<dyn Backend>, GenerateContentRequest) -> BoxFuture<'static, Result<T, GatewayError>>;

fn dispatch_generate(
    backend: Arc<dyn Backend>,
    request: GenerateContentRequest,
) -> BoxFuture<'static, Result<GenerateContentResponse, GatewayError>> {
    async move { backend.generate_content(&request).await }.boxed()
}

fn dispatch_stream(
    backend: Arc<dyn Backend>,
    request: GenerateContentRequest,
) -> BoxFuture<'static, Result<ResponseStream, GatewayError>> {
    async move { backend.generate_content_stream(&request).await }.boxed()
}

// ============================================================================
// Model Router
// ============================================================================

/// Routes generation calls with retry and failover
pub struct ModelRouter {
    discovery: Arc<ModelDiscovery>,
    classifier: ErrorClassifier,
    health: HealthCache,
    config: RouterConfig,
    known: RwLock<Arc<KnownModels>>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("config", &self.config)
            .field("known_models", &self.known.read().models.len())
            .finish_non_exhaustive()
    }
}

impl ModelRouter {
    /// Create a router over the adapters owned by `discovery`
    #[must_use]
    pub fn new(discovery: Arc<ModelDiscovery>, config: RouterConfig) -> Self {
        Self {
            discovery,
            classifier: ErrorClassifier::new(config.retry_delay()),
            health: HealthCache::new(config.health_check_interval()),
            config,
            known: RwLock::new(Arc::new(KnownModels::default())),
        }
    }

    /// Router settings
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Router-local health cache
    #[must_use]
    pub fn health_cache(&self) -> &HealthCache {
        &self.health
    }

    /// Replace the set of models calls are validated against
    pub fn update_available_models(&self, models: &[AvailableModel]) {
        tracing::debug!(models = models.len(), "Updating router model set");
        *self.known.write() = Arc::new(KnownModels::from_models(models));
    }

    /// Models calls are currently validated against
    #[must_use]
    pub fn known_models(&self) -> Vec<AvailableModel> {
        self.known.read().models.clone()
    }

    /// Whether `target` is in the known model set
    #[must_use]
    pub fn is_known(&self, target: &ModelTarget) -> bool {
        self.known.read().targets.contains(target)
    }

    /// Generate a complete response
    ///
    /// # Errors
    ///
    /// Returns a `RouteError` once retries and failover are exhausted.
    pub async fn generate(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
    ) -> Result<GenerateContentResponse, RouteError> {
        self.execute(request, target, Operation::Generate, dispatch_generate)
            .await
    }

    /// Open a streaming generation
    ///
    /// Retry and failover apply to establishing the stream only. A failure
    /// after the first chunk arrives as an error item on the stream.
    ///
    /// # Errors
    ///
    /// Returns a `RouteError` if no stream could be established.
    pub async fn generate_stream(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
    ) -> Result<ResponseStream, RouteError> {
        self.execute(request, target, Operation::GenerateStream, dispatch_stream)
            .await
    }

    /// [`generate`](Self::generate), abandoned when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns a cancelled `RouteError` if `cancel` fires first.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
        cancel: CancellationToken,
    ) -> Result<GenerateContentResponse, RouteError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(route = %target, "Generate cancelled");
                Err(self.single_error(GatewayError::Cancelled, target, Operation::Generate))
            }
            result = self.generate(request, target) => result,
        }
    }

    /// [`generate_stream`](Self::generate_stream), closed when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns a cancelled `RouteError` if `cancel` fires before the stream
    /// is established.
    pub async fn generate_stream_with_cancel(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, RouteError> {
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(self.single_error(
                    GatewayError::Cancelled,
                    target,
                    Operation::GenerateStream,
                ));
            }
            result = self.generate_stream(request, target) => result?,
        };

        let handle = stream.cancel_handle();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => handle.cancel(),
                () = handle.cancelled() => {}
            }
        });
        Ok(stream)
    }

    fn single_error(
        &self,
        error: GatewayError,
        target: &ModelTarget,
        operation: Operation,
    ) -> RouteError {
        let context = ErrorContext::for_target(target, operation, self.config.max_retries);
        let decision = self.classifier.classify(&error, &context, &[]);
        RouteError::from_decision(error, decision)
    }

    /// Whole call: original target, then at most one fallback target
    async fn execute<T>(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
        operation: Operation,
        dispatch: Dispatch<T>,
    ) -> Result<T, RouteError> {
        let mut tried: HashSet<BackendKind> = HashSet::new();
        let mut pending = VecDeque::from([target.clone()]);
        let mut original: Option<(GatewayError, ErrorDecision)> = None;

        while let Some(current) = pending.pop_front() {
            tried.insert(current.backend);

            match self.run_target(request, &current, operation, dispatch).await {
                Ok(output) => {
                    if original.is_some() {
                        tracing::info!(route = %current, "Failover succeeded");
                    }
                    return Ok(output);
                }
                Err((error, decision)) => {
                    if original.is_some() {
                        tracing::warn!(route = %current, error = %error, "Fallback target failed");
                        break;
                    }

                    let next = decision
                        .fallback_model
                        .as_ref()
                        .map(AvailableModel::target)
                        .filter(|next| {
                            self.config.enable_failover && !tried.contains(&next.backend)
                        });

                    if let Some(next) = next {
                        tracing::info!(from = %current, to = %next, error = %error, "Failing over");
                        pending.push_back(next);
                    }
                    original = Some((error, decision));
                }
            }
        }

        match original {
            Some((error, decision)) => Err(RouteError::from_decision(error, decision)),
            None => Err(self.single_error(
                GatewayError::BackendNotConfigured(target.backend),
                target,
                operation,
            )),
        }
    }

    /// Attempts against one target until success, a terminal error, or the
    /// attempt budget runs out
    async fn run_target<T>(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
        operation: Operation,
        dispatch: Dispatch<T>,
    ) -> Result<T, (GatewayError, ErrorDecision)> {
        let request = request.for_model(target.model_id.clone());
        let mut attempts = 0u32;

        loop {
            let error = match self.attempt(&request, target, operation, dispatch).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            attempts += 1;

            let mut context =
                ErrorContext::for_target(target, operation, self.config.max_retries)
                    .with_attempt(attempts);
            if let Some(config) = self.discovery.service_config(target.backend) {
                context = context.with_endpoint(config.endpoint());
            }

            let catalog = self.known.read().clone();
            let decision = self.classifier.classify(&error, &context, &catalog.models);

            if decision.should_retry {
                let delay = self.classifier.retry_delay(attempts - 1);
                tracing::warn!(
                    route = %target,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Generate failed, retrying"
                );
                // a retry re-probes instead of trusting the cached status
                self.health.invalidate(target.backend);
                tokio::time::sleep(delay).await;
                continue;
            }

            if let GatewayError::ServiceUnavailable {
                ref endpoint,
                ref reason,
                ..
            } = error
            {
                self.health.mark_unhealthy(target.backend, endpoint, reason);
            }

            tracing::debug!(
                route = %target,
                attempts,
                error = %decision.technical_message,
                "Giving up on target"
            );
            return Err((error, decision));
        }
    }

    /// One attempt: validate, check health, call the adapter
    async fn attempt<T>(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
        operation: Operation,
        dispatch: Dispatch<T>,
    ) -> Result<T, GatewayError> {
        if !self.is_known(target) {
            return Err(GatewayError::ModelNotFound {
                backend: target.backend,
                model_id: target.model_id.clone(),
            });
        }

        let backend = self
            .discovery
            .backend(target.backend)
            .ok_or(GatewayError::BackendNotConfigured(target.backend))?;

        let status = match self.health.get(target.backend) {
            Some(status) => status,
            None => {
                let status = backend.check_health().await;
                self.health.record(target.backend, status.clone());
                status
            }
        };

        if !status.available {
            return Err(GatewayError::ServiceUnavailable {
                backend: target.backend,
                endpoint: status.endpoint,
                reason: status
                    .error
                    .unwrap_or_else(|| "health check failed".to_string()),
            });
        }

        tracing::debug!(route = %target, operation = %operation, "Dispatching to backend");
        dispatch(backend, request.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::routing::test_utils::{unavailable, MockBackend};
    use std::time::Duration;

    struct Fixture {
        openai: Arc<MockBackend>,
        ollama: Arc<MockBackend>,
        discovery: Arc<ModelDiscovery>,
        router: ModelRouter,
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            retry_delay_ms: 1,
            ..RouterConfig::default()
        }
    }

    async fn fixture(openai: MockBackend, ollama: MockBackend, config: RouterConfig) -> Fixture {
        let openai = openai.shared();
        let ollama = ollama.shared();
        let discovery = Arc::new(ModelDiscovery::with_backends(
            vec![
                Arc::clone(&openai) as Arc<dyn Backend>,
                Arc::clone(&ollama) as Arc<dyn Backend>,
            ],
            DiscoveryConfig::default(),
        ));
        let router = ModelRouter::new(Arc::clone(&discovery), config);
        router.update_available_models(&discovery.scan().await.models);
        Fixture {
            openai,
            ollama,
            discovery,
            router,
        }
    }

    fn request() -> GenerateContentRequest {
        GenerateContentRequest::new("llama2:7b", "Hello")
    }

    fn ollama_target() -> ModelTarget {
        ModelTarget::new("llama2:7b", BackendKind::Ollama)
    }

    #[tokio::test]
    async fn test_generate_success() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama)
                .with_models(&["llama2:7b"])
                .with_reply("hi there"),
            router_config(),
        )
        .await;

        let response = f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(response.content, "hi there");
        assert_eq!(f.ollama.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_each_entry_point_uses_its_own_adapter_call() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama)
                .with_models(&["llama2:7b"])
                .with_reply("one two"),
            router_config(),
        )
        .await;
        f.ollama.fail_next(GatewayError::Api {
            backend: BackendKind::Ollama,
            status: 503,
            message: "loading".to_string(),
        });

        let stream = f
            .router
            .generate_stream(&request(), &ollama_target())
            .await
            .unwrap();
        assert_eq!(stream.into_response().await.unwrap().content, "one two");
        // one failed and one successful streaming call, no plain generate
        assert_eq!(f.ollama.stream_calls(), 2);
        assert_eq!(f.ollama.generate_calls(), 2);

        f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(f.ollama.stream_calls(), 2);
        assert_eq!(f.ollama.generate_calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_target_rejected_without_call() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;

        let err = f
            .router
            .generate(&request(), &ModelTarget::new("phi3", BackendKind::Ollama))
            .await
            .unwrap_err();
        assert!(matches!(err.source, GatewayError::ModelNotFound { .. }));
        assert_eq!(f.ollama.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_on_same_backend() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible).with_models(&["llama2:7b"]),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_next(GatewayError::Api {
            backend: BackendKind::Ollama,
            status: 503,
            message: "loading".to_string(),
        });

        let response = f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(response.content, "hello from ollama");
        assert_eq!(f.ollama.generate_calls(), 2);
        assert_eq!(f.openai.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_respected() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_always(GatewayError::Api {
            backend: BackendKind::Ollama,
            status: 500,
            message: "oom".to_string(),
        });

        let err = f.router.generate(&request(), &ollama_target()).await.unwrap_err();
        assert_eq!(err.source.status(), Some(500));
        assert_eq!(f.ollama.generate_calls(), 3);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible).with_models(&["llama2:7b"]),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_always(GatewayError::Api {
            backend: BackendKind::Ollama,
            status: 400,
            message: "bad request".to_string(),
        });

        let err = f.router.generate(&request(), &ollama_target()).await.unwrap_err();
        assert_eq!(err.source.status(), Some(400));
        assert_eq!(f.ollama.generate_calls(), 1);
        assert_eq!(f.openai.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_failover_to_other_backend() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible)
                .with_models(&["llama2:7b"])
                .with_reply("from openai"),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_always(unavailable(BackendKind::Ollama));

        let response = f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(response.content, "from openai");
        assert_eq!(f.ollama.generate_calls(), 3);
        assert_eq!(f.openai.requested_models(), vec!["llama2:7b".to_string()]);
        // the original backend is now cached as unhealthy
        assert!(!f.router.health_cache().get(BackendKind::Ollama).unwrap().available);
    }

    #[tokio::test]
    async fn test_not_found_fails_over_immediately() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible)
                .with_models(&["llama2:7b"])
                .with_reply("from openai"),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_next(GatewayError::ModelNotFound {
            backend: BackendKind::Ollama,
            model_id: "llama2:7b".to_string(),
        });

        let response = f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(response.content, "from openai");
        assert_eq!(f.ollama.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_surfaces_original_error() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible).with_models(&["llama2:7b"]),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        f.ollama.fail_always(unavailable(BackendKind::Ollama));
        f.openai.fail_always(GatewayError::Api {
            backend: BackendKind::OpenAiCompatible,
            status: 400,
            message: "context too long".to_string(),
        });

        let err = f.router.generate(&request(), &ollama_target()).await.unwrap_err();
        assert_eq!(err.source.backend(), Some(BackendKind::Ollama));
        assert!(err.source.is_unavailable());
        assert!(err.user_message.starts_with("Ollama is not available"));
        assert_eq!(f.openai.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_failover_disabled() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible).with_models(&["llama2:7b"]),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            RouterConfig {
                enable_failover: false,
                max_retries: 1,
                ..router_config()
            },
        )
        .await;
        f.ollama.fail_always(unavailable(BackendKind::Ollama));

        assert!(f.router.generate(&request(), &ollama_target()).await.is_err());
        assert_eq!(f.ollama.generate_calls(), 1);
        assert_eq!(f.openai.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_skipped_without_generate() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible)
                .with_models(&["llama2:7b"])
                .with_reply("from openai"),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            RouterConfig {
                max_retries: 1,
                ..router_config()
            },
        )
        .await;
        f.ollama.set_healthy(false);

        let response = f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(response.content, "from openai");
        assert_eq!(f.ollama.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_health_probe_is_cached() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            router_config(),
        )
        .await;
        let probes_after_scan = f.ollama.health_checks();

        f.router.generate(&request(), &ollama_target()).await.unwrap();
        f.router.generate(&request(), &ollama_target()).await.unwrap();
        assert_eq!(f.ollama.health_checks(), probes_after_scan + 1);
    }

    #[tokio::test]
    async fn test_stream_failover() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible)
                .with_models(&["llama2:7b"])
                .with_reply("streamed from openai"),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            RouterConfig {
                max_retries: 1,
                ..router_config()
            },
        )
        .await;
        f.ollama.fail_always(unavailable(BackendKind::Ollama));

        let stream = f.router.generate_stream(&request(), &ollama_target()).await.unwrap();
        let response = stream.into_response().await.unwrap();
        assert_eq!(response.content, "streamed from openai");
    }

    #[tokio::test]
    async fn test_generate_with_cancel() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama).with_models(&["llama2:7b"]),
            RouterConfig {
                retry_delay_ms: 60_000,
                ..RouterConfig::default()
            },
        )
        .await;
        f.ollama.fail_always(GatewayError::Api {
            backend: BackendKind::Ollama,
            status: 502,
            message: "bad gateway".to_string(),
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f
            .router
            .generate_with_cancel(&request(), &ollama_target(), cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.user_message, "The request was cancelled.");
    }

    #[tokio::test]
    async fn test_route_error_messages() {
        let f = fixture(
            MockBackend::new(BackendKind::OpenAiCompatible),
            MockBackend::new(BackendKind::Ollama)
                .with_models(&["llama2:7b"])
                .down(),
            RouterConfig {
                max_retries: 1,
                ..router_config()
            },
        )
        .await;
        assert!(f.discovery.last_result().is_some());

        let err = f.router.generate(&request(), &ollama_target()).await.unwrap_err();
        assert!(err.technical_message.contains("generate on ollama failed"));
        assert_eq!(err.to_string(), err.user_message);
    }
}
