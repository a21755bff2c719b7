//! Backend Trait
//!
//! One trait implemented independently by each protocol adapter. The router
//! and discovery only ever see `dyn Backend`; everything wire-specific stays
//! inside the implementations.
//!
//! # Design Philosophy
//!
//! The Backend trait provides a common interface for:
//! - Health checking the backend (cheapest catalog call, never retried)
//! - Listing models as [`AvailableModel`]s with inferred capabilities
//! - Generating content, whole or streamed
//!
//! Implementations translate shared contracts to and from their native wire
//! shapes and map native "model not found" replies to
//! [`GatewayError::ModelNotFound`](crate::error::GatewayError::ModelNotFound).

use async_trait::async_trait;

use super::stream::ResponseStream;
use crate::contracts::{
    AvailableModel, BackendKind, GenerateContentRequest, GenerateContentResponse, ServiceConfig,
    ServiceStatus,
};
use crate::error::Result;

/// Protocol adapter for one backend family
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which family this adapter speaks
    fn kind(&self) -> BackendKind;

    /// Connection settings in use
    fn config(&self) -> &ServiceConfig;

    /// Probe the backend
    ///
    /// Never fails; problems are reported in the returned status.
    async fn check_health(&self) -> ServiceStatus;

    /// List the models this backend hosts
    async fn list_models(&self) -> Result<Vec<AvailableModel>>;

    /// Generate a complete response
    async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse>;

    /// Open a streaming generation
    ///
    /// Errors returned here happened while establishing the stream; failures
    /// after that arrive as error items on the stream.
    async fn generate_content_stream(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<ResponseStream>;

    /// Check if a specific model is available
    async fn has_model(&self, model_id: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.id == model_id))
    }

    /// Get information about a specific model
    async fn model_info(&self, model_id: &str) -> Result<Option<AvailableModel>> {
        let models = self.list_models().await?;
        Ok(models.into_iter().find(|m| m.id == model_id))
    }
}
