//! Relay Client
//!
//! The inbound API used by UI and CLI glue. Wires discovery into the router:
//! every discovery call refreshes the set of models the router accepts.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::ResponseStream;
use crate::config::RelayConfig;
use crate::contracts::{
    AvailableModel, BackendKind, DiscoveryResult, GenerateContentRequest, GenerateContentResponse,
    ModelTarget, ServiceStatus,
};
use crate::discovery::ModelDiscovery;
use crate::routing::{ModelRouter, RouteError};

/// Discovery and routing behind one handle
#[derive(Debug)]
pub struct RelayClient {
    discovery: Arc<ModelDiscovery>,
    router: ModelRouter,
}

impl RelayClient {
    /// Build adapters, discovery and router from configuration
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let discovery = Arc::new(ModelDiscovery::new(
            &config.backends,
            config.discovery.clone(),
        ));
        let router = ModelRouter::new(Arc::clone(&discovery), config.router.clone());
        Self { discovery, router }
    }

    /// Assemble from existing parts
    #[must_use]
    pub fn from_parts(discovery: Arc<ModelDiscovery>, router: ModelRouter) -> Self {
        Self { discovery, router }
    }

    /// Discovery handle
    #[must_use]
    pub fn discovery(&self) -> &Arc<ModelDiscovery> {
        &self.discovery
    }

    /// Router handle
    #[must_use]
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Models from all healthy backends, cached within the TTL
    pub async fn discover_models(&self) -> Vec<AvailableModel> {
        let result = self.discovery.scan().await;
        self.sync_router(&result);
        result.models.clone()
    }

    /// Models from all healthy backends, rescanned now
    pub async fn refresh_models(&self) -> Vec<AvailableModel> {
        let result = self.discovery.refresh().await;
        self.sync_router(&result);
        result.models.clone()
    }

    /// Full result of the latest scan, scanning if there is none
    pub async fn discovery_result(&self) -> Arc<DiscoveryResult> {
        let result = self.discovery.scan().await;
        self.sync_router(&result);
        result
    }

    /// Live health of one backend
    pub async fn check_health(&self, backend: BackendKind) -> ServiceStatus {
        self.discovery.check_health(backend).await
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
        self.ensure_catalog().await;
        self.router.generate(request, target).await
    }

    /// Open a streaming generation
    ///
    /// # Errors
    ///
    /// Returns a `RouteError` if no stream could be established.
    pub async fn generate_stream(
        &self,
        request: &GenerateContentRequest,
        target: &ModelTarget,
    ) -> Result<ResponseStream, RouteError> {
        self.ensure_catalog().await;
        self.router.generate_stream(request, target).await
    }

    /// Generate a complete response, abandoned when `cancel` fires
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
        self.ensure_catalog().await;
        self.router.generate_with_cancel(request, target, cancel).await
    }

    /// Scan once if nothing has been discovered yet
    async fn ensure_catalog(&self) {
        if self.discovery.last_result().is_none() {
            self.discovery_result().await;
        }
    }

    fn sync_router(&self, result: &DiscoveryResult) {
        self.router.update_available_models(&result.models);
    }
}
