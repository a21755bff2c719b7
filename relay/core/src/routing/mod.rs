//! Request Routing
//!
//! Executes generation calls against a chosen model with retry and failover.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   ModelRouter    |  <-- Entry point: validate, attempt, classify
//! +--------+---------+
//!          |
//!    +-----+-------------+
//!    |                   |
//!    v                   v
//! +-------------+  +-----------------+
//! | HealthCache |  | ErrorClassifier |  <-- retry? fallback?
//! +-------------+  +-----------------+
//!          |
//!          v
//! +------------------+
//! |  dyn Backend     |  <-- adapters owned by ModelDiscovery
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Addressed by target**: every call names a model *and* its backend
//! 2. **Bounded effort**: a fixed attempt budget per target, one failover hop
//! 3. **Original error wins**: a failed fallback never hides why the first target failed

pub mod health;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use health::{HealthCache, HealthEntry};
pub use router::{ModelRouter, RouteError};
