//! Error Taxonomy
//!
//! Every failure inside the relay is one of these variants. The transport
//! produces them, the adapters refine them (a 404 on a generate call becomes
//! [`GatewayError::ModelNotFound`]), and the classifier turns them into a
//! routing decision.

use thiserror::Error;

use crate::contracts::BackendKind;

/// Errors produced by transport, adapters, discovery and routing
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// Backend could not be reached or did not answer in time
    #[error("{backend} unavailable at {endpoint}: {reason}")]
    ServiceUnavailable {
        /// Backend that failed
        backend: BackendKind,
        /// `host:port`
        endpoint: String,
        /// Underlying cause
        reason: String,
    },

    /// Backend is reachable but does not know the model
    #[error("model '{model_id}' not found on {backend}")]
    ModelNotFound {
        /// Backend that was asked
        backend: BackendKind,
        /// Missing model id
        model_id: String,
    },

    /// Backend rejected the call with a non-2xx status
    #[error("{backend} returned HTTP {status}: {message}")]
    Api {
        /// Backend that answered
        backend: BackendKind,
        /// HTTP status code
        status: u16,
        /// Response body excerpt or status text
        message: String,
    },

    /// Connection-level failure after the request was accepted (e.g. body read)
    #[error("network error talking to {backend} at {endpoint}: {message}")]
    Network {
        /// Backend involved
        backend: BackendKind,
        /// `host:port`
        endpoint: String,
        /// Underlying cause
        message: String,
    },

    /// Response body did not match the expected wire shape
    #[error("could not decode {backend} response: {message}")]
    Decode {
        /// Backend that answered
        backend: BackendKind,
        /// Decoder message
        message: String,
    },

    /// The call was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// No adapter is registered for the backend
    #[error("backend {0} is not configured")]
    BackendNotConfigured(BackendKind),
}

impl GatewayError {
    /// Backend the error is attributed to, if any
    #[must_use]
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::ServiceUnavailable { backend, .. }
            | Self::ModelNotFound { backend, .. }
            | Self::Api { backend, .. }
            | Self::Network { backend, .. }
            | Self::Decode { backend, .. } => Some(*backend),
            Self::BackendNotConfigured(backend) => Some(*backend),
            Self::Cancelled => None,
        }
    }

    /// HTTP status, for API errors
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Unreachable, timed out, or dropped mid-flight
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. } | Self::Network { .. })
    }

    /// Errors the transport layer may retry on its own
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => (500..600).contains(status),
            Self::ServiceUnavailable { .. } | Self::Network { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for relay operations
pub type Result<T> = std::result::Result<T, GatewayError>;
