//! Backend Health Cache
//!
//! Short-lived memory of per-backend health probes, owned by the router so
//! that consecutive calls do not each pay for a probe.
//!
//! ```text
//! attempt --> get(backend) --fresh--> cached ServiceStatus
//!                 |
//!                 +--miss/stale--> Backend::check_health() --> record()
//! ```
//!
//! A service-unavailable failure during generation overwrites the entry with
//! an unhealthy status, so the next attempt within the TTL skips the backend
//! without probing it.
//!
//! # Thread Safety
//!
//! Entries live in a `DashMap`; no lock is held across an `.await`.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::contracts::{BackendKind, ServiceStatus};

/// One cached probe result
#[derive(Clone, Debug)]
pub struct HealthEntry {
    /// Probe result
    pub status: ServiceStatus,
    /// When it was recorded
    pub checked_at: Instant,
}

impl HealthEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.checked_at.elapsed() < ttl
    }
}

/// TTL cache of backend health
#[derive(Debug)]
pub struct HealthCache {
    entries: DashMap<BackendKind, HealthEntry>,
    ttl: Duration,
}

impl HealthCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Entry lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached status if still fresh
    #[must_use]
    pub fn get(&self, backend: BackendKind) -> Option<ServiceStatus> {
        let entry = self.entries.get(&backend)?;
        entry.is_fresh(self.ttl).then(|| entry.status.clone())
    }

    /// Store a probe result
    pub fn record(&self, backend: BackendKind, status: ServiceStatus) {
        self.entries.insert(
            backend,
            HealthEntry {
                status,
                checked_at: Instant::now(),
            },
        );
    }

    /// Remember that a call just found the backend unreachable
    pub fn mark_unhealthy(&self, backend: BackendKind, endpoint: &str, reason: &str) {
        tracing::debug!(backend = %backend, reason, "Marking backend unhealthy");
        self.record(backend, ServiceStatus::unavailable(endpoint, reason));
    }

    /// Forget one backend
    pub fn invalidate(&self, backend: BackendKind) {
        self.entries.remove(&backend);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.clear();
    }
}
