//! Model Discovery
//!
//! Probes every enabled backend, lists the models of the healthy ones and
//! keeps the merged result as an immutable snapshot with a TTL.
//!
//! # Scan
//!
//! ```text
//! scan() --fresh cache?--> cached Arc<DiscoveryResult>
//!    |
//!    +--> for each enabled backend (join_all or one by one):
//!             check_health() --available--> list_models()
//!    |
//!    +--> merge models, statuses, errors --> swap snapshot
//! ```
//!
//! A backend that is down or fails to list only contributes an entry to
//! `errors`; a scan itself never fails.
//!
//! # Thread Safety
//!
//! The adapter table and the snapshot sit behind `parking_lot::RwLock`s and
//! are copied out before any `.await`. A generation counter is bumped on every
//! invalidation; a scan only stores its result if no invalidation happened
//! while it was probing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;

use crate::backend::{create_backend, Backend};
use crate::config::{BackendsConfig, DiscoveryConfig};
use crate::contracts::{
    AvailableModel, BackendError, BackendKind, DiscoveryResult, ModelTarget, ServiceConfig,
    ServiceStatus,
};
use crate::error::Result;

/// What one backend contributed to a scan
struct BackendScan {
    backend: BackendKind,
    status: ServiceStatus,
    models: Result<Vec<AvailableModel>>,
}

async fn scan_backend(backend: Arc<dyn Backend>) -> BackendScan {
    let kind = backend.kind();
    let status = backend.check_health().await;

    let models = if status.available {
        backend.list_models().await
    } else {
        Ok(Vec::new())
    };

    BackendScan {
        backend: kind,
        status,
        models,
    }
}

/// Health-checks and catalogs models across backends
pub struct ModelDiscovery {
    backends: RwLock<HashMap<BackendKind, Arc<dyn Backend>>>,
    config: DiscoveryConfig,
    cache: RwLock<Option<Arc<DiscoveryResult>>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ModelDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDiscovery")
            .field("backends", &self.backends.read().keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("cached", &self.cache.read().is_some())
            .finish()
    }
}

impl ModelDiscovery {
    /// Build adapters for both backend families
    #[must_use]
    pub fn new(backends: &BackendsConfig, config: DiscoveryConfig) -> Self {
        let adapters = backends
            .iter()
            .map(|(kind, service)| {
                create_backend(kind, service.clone(), config.health_check_timeout())
            })
            .collect();
        Self::with_backends(adapters, config)
    }

    /// Use the given adapters
    #[must_use]
    pub fn with_backends(backends: Vec<Arc<dyn Backend>>, config: DiscoveryConfig) -> Self {
        let backends = backends.into_iter().map(|b| (b.kind(), b)).collect();
        Self {
            backends: RwLock::new(backends),
            config,
            cache: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Discovery settings
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Adapter for an enabled backend
    #[must_use]
    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .get(&kind)
            .filter(|b| b.config().enabled)
            .cloned()
    }

    /// Backends that scans and routing may use, in scan order
    #[must_use]
    pub fn enabled_backends(&self) -> Vec<BackendKind> {
        let backends = self.backends.read();
        BackendKind::ALL
            .into_iter()
            .filter(|kind| backends.get(kind).is_some_and(|b| b.config().enabled))
            .collect()
    }

    /// Connection settings of a backend
    #[must_use]
    pub fn service_config(&self, kind: BackendKind) -> Option<ServiceConfig> {
        self.backends.read().get(&kind).map(|b| b.config().clone())
    }

    /// Scan all enabled backends, or return the cached result if still fresh
    pub async fn scan(&self) -> Arc<DiscoveryResult> {
        if self.config.enable_caching {
            if let Some(cached) = self.cached_if_fresh() {
                tracing::debug!(models = cached.models.len(), "Using cached model scan");
                return cached;
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let adapters: Vec<Arc<dyn Backend>> = self
            .enabled_backends()
            .into_iter()
            .filter_map(|kind| self.backend(kind))
            .collect();

        let scans = if self.config.concurrent_scans {
            join_all(adapters.into_iter().map(scan_backend)).await
        } else {
            let mut scans = Vec::with_capacity(adapters.len());
            for adapter in adapters {
                scans.push(scan_backend(adapter).await);
            }
            scans
        };

        let result = Arc::new(merge_scans(scans));
        tracing::info!(
            models = result.models.len(),
            healthy = result.statuses.values().filter(|s| s.available).count(),
            errors = result.errors.len(),
            "Model scan complete"
        );

        let mut cache = self.cache.write();
        if self.generation.load(Ordering::SeqCst) == generation {
            *cache = Some(Arc::clone(&result));
        } else {
            tracing::debug!("Backends changed during scan, result not cached");
        }
        result
    }

    /// Drop the cached result and scan again
    pub async fn refresh(&self) -> Arc<DiscoveryResult> {
        self.invalidate();
        self.scan().await
    }

    /// Drop the cached result
    ///
    /// A scan already in flight will not store its result either.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *cache = None;
    }

    /// Probe one backend now, bypassing the cache
    pub async fn check_health(&self, kind: BackendKind) -> ServiceStatus {
        let adapter = self.backends.read().get(&kind).cloned();
        match adapter {
            Some(adapter) if adapter.config().enabled => adapter.check_health().await,
            Some(adapter) => {
                ServiceStatus::unavailable(adapter.config().endpoint(), "backend is disabled")
            }
            None => ServiceStatus::unavailable(String::new(), "backend is not configured"),
        }
    }

    /// Replace a backend's connection settings
    ///
    /// Rebuilds the adapter and invalidates the cache.
    pub fn update_service_config(&self, kind: BackendKind, config: ServiceConfig) {
        tracing::info!(backend = %kind, endpoint = %config.endpoint(), "Updating service config");
        self.replace_backend(create_backend(
            kind,
            config,
            self.config.health_check_timeout(),
        ));
    }

    /// Swap in an adapter and invalidate the cache
    pub fn replace_backend(&self, backend: Arc<dyn Backend>) {
        self.backends.write().insert(backend.kind(), backend);
        self.invalidate();
    }

    /// Last scan result, fresh or not
    #[must_use]
    pub fn last_result(&self) -> Option<Arc<DiscoveryResult>> {
        self.cache.read().clone()
    }

    /// Look up a model in the last scan
    #[must_use]
    pub fn find_model(&self, target: &ModelTarget) -> Option<AvailableModel> {
        self.last_result()?
            .models
            .iter()
            .find(|m| m.backend == target.backend && m.id == target.model_id)
            .cloned()
    }

    /// Models from one backend in the last scan
    #[must_use]
    pub fn models_for(&self, kind: BackendKind) -> Vec<AvailableModel> {
        self.last_result()
            .map(|result| result.models_for(kind).cloned().collect())
            .unwrap_or_default()
    }

    fn cached_if_fresh(&self) -> Option<Arc<DiscoveryResult>> {
        self.cache
            .read()
            .as_ref()
            .filter(|result| result.is_fresh(self.config.cache_timeout()))
            .cloned()
    }
}

fn merge_scans(scans: Vec<BackendScan>) -> DiscoveryResult {
    let mut result = DiscoveryResult::empty();

    for scan in scans {
        if let Some(ref error) = scan.status.error {
            tracing::warn!(backend = %scan.backend, error = %error, "Backend unavailable");
            result.errors.push(BackendError {
                backend: scan.backend,
                message: error.clone(),
            });
        }

        match scan.models {
            Ok(models) => result.models.extend(models),
            Err(e) => {
                tracing::warn!(backend = %scan.backend, error = %e, "Failed to list models");
                result.errors.push(BackendError {
                    backend: scan.backend,
                    message: e.to_string(),
                });
            }
        }

        result.statuses.insert(scan.backend, scan.status);
    }

    result.scanned_at = Utc::now();
    result
}
