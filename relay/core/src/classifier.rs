//! Error Classifier
//!
//! Turns a failed call into a routing decision: retry the same backend, move
//! to a model on another backend, or give up. This is the only place that
//! interprets [`GatewayError`] variants for routing purposes.
//!
//! # Decision Table
//!
//! Rows are evaluated top to bottom; the first match decides `should_retry`.
//!
//! | Condition                               | Retry | Fallback                         |
//! |-----------------------------------------|-------|----------------------------------|
//! | attempts used >= attempt budget         | no    | per the error's own row          |
//! | model not found                         | no    | best match on another backend    |
//! | HTTP 4xx (incl. 429)                    | no    | none                             |
//! | HTTP 5xx                                | yes   | none                             |
//! | unavailable / network / timeout         | yes   | any model on another backend     |
//! | decode, configuration, cancellation     | no    | none                             |
//!
//! An exhausted budget only stops retrying; the fallback is still offered so
//! the router can fail over once the original backend has been given up on.

use std::time::Duration;

use crate::contracts::{AvailableModel, BackendKind, ErrorContext};
use crate::error::GatewayError;

/// Upper bound on a single backoff sleep
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Outcome of classifying one failure
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorDecision {
    /// Re-run the call on the same backend
    pub should_retry: bool,
    /// Model on a different backend to try instead
    pub fallback_model: Option<AvailableModel>,
    /// Short message safe to show an end user
    pub user_message: String,
    /// Detailed message for logs
    pub technical_message: String,
}

/// Maps errors to retry / failover decisions
#[derive(Clone, Debug)]
pub struct ErrorClassifier {
    base_delay: Duration,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ErrorClassifier {
    /// Create a classifier with the given backoff base delay
    #[must_use]
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Backoff base delay
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Exponential backoff before whole-call retry `attempt` (0-based)
    ///
    /// `base_delay * 2^attempt`, capped at one minute.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }

    /// Classify a failure
    ///
    /// `catalog` is the current model list; fallbacks are only ever chosen
    /// from backends other than the one that failed.
    #[must_use]
    pub fn classify(
        &self,
        error: &GatewayError,
        context: &ErrorContext,
        catalog: &[AvailableModel],
    ) -> ErrorDecision {
        let exhausted = context.attempt >= context.max_retries;

        let (retryable, fallback_model) = match error {
            GatewayError::ModelNotFound { model_id, backend } => {
                (false, not_found_fallback(model_id, *backend, catalog))
            }
            GatewayError::Api { status, .. } if (400..500).contains(status) => (false, None),
            GatewayError::Api { status, .. } if (500..600).contains(status) => (true, None),
            GatewayError::ServiceUnavailable { .. } | GatewayError::Network { .. } => {
                let missing = context.model_id.as_deref().unwrap_or_default();
                (true, unavailable_fallback(missing, context.backend, catalog))
            }
            _ => (false, None),
        };

        ErrorDecision {
            should_retry: retryable && !exhausted,
            fallback_model,
            user_message: user_message(error, context),
            technical_message: technical_message(error, context),
        }
    }
}

// ============================================================================
// Fallback Selection
// ============================================================================

/// Model on another backend that best matches a missing id
///
/// Exact id first, then the highest name similarity above zero.
fn not_found_fallback(
    missing: &str,
    failing: BackendKind,
    catalog: &[AvailableModel],
) -> Option<AvailableModel> {
    let mut candidates = catalog.iter().filter(|m| m.backend != failing);

    if let Some(exact) = candidates.clone().find(|m| m.id == missing) {
        return Some(exact.clone());
    }

    best_similarity(missing, &mut candidates).cloned()
}

/// Any usable model on another backend, preferring the same model
fn unavailable_fallback(
    missing: &str,
    failing: BackendKind,
    catalog: &[AvailableModel],
) -> Option<AvailableModel> {
    let others: Vec<&AvailableModel> = catalog.iter().filter(|m| m.backend != failing).collect();

    if let Some(same) = others.iter().find(|m| m.id == missing || m.name == missing) {
        return Some((*same).clone());
    }
    if let Some(similar) = best_similarity(missing, &mut others.iter().copied()) {
        return Some(similar.clone());
    }
    others
        .into_iter()
        .find(|m| m.capabilities.supports_chat)
        .cloned()
}

fn best_similarity<'a>(
    missing: &str,
    candidates: &mut dyn Iterator<Item = &'a AvailableModel>,
) -> Option<&'a AvailableModel> {
    let mut best: Option<(&AvailableModel, f64)> = None;
    for model in candidates {
        let score = similarity(&model.name, missing);
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((model, score));
        }
    }
    best.map(|(model, _)| model)
}

/// Normalized Levenshtein similarity in `[0, 1]`
///
/// `(max_len - distance) / max_len`; two empty strings are identical.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(a, b);
    (max_len - distance) as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

// ============================================================================
// Messages
// ============================================================================

fn user_message(error: &GatewayError, context: &ErrorContext) -> String {
    let name = error.backend().unwrap_or(context.backend).display_name();
    match error {
        GatewayError::ServiceUnavailable { endpoint, .. } => {
            format!("{name} is not available. Please ensure it is running at {endpoint}.")
        }
        GatewayError::Network { endpoint, .. } => {
            format!("Lost connection to {name} at {endpoint}. Please try again.")
        }
        GatewayError::ModelNotFound { model_id, .. } => {
            format!("Model '{model_id}' is not available on {name}.")
        }
        GatewayError::Api { status, .. } => match status {
            401 | 403 => format!("{name} refused the request (not authorized)."),
            429 => format!("{name} is busy. Please wait a moment and try again."),
            400..=499 => format!("{name} rejected the request."),
            _ => format!("{name} ran into an internal error."),
        },
        GatewayError::Decode { .. } => {
            format!("{name} returned a response that could not be understood.")
        }
        GatewayError::Cancelled => "The request was cancelled.".to_string(),
        GatewayError::BackendNotConfigured(_) => format!("{name} is not configured."),
    }
}

fn technical_message(error: &GatewayError, context: &ErrorContext) -> String {
    let mut message = format!(
        "{} on {} failed (attempt {}/{})",
        context.operation, context.backend, context.attempt, context.max_retries
    );
    if let Some(ref model) = context.model_id {
        message.push_str(&format!(" model={model}"));
    }
    if let Some(ref endpoint) = context.endpoint {
        message.push_str(&format!(" endpoint={endpoint}"));
    }
    message.push_str(&format!(": {error}"));
    message
}
