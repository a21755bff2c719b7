//! Relay Configuration
//!
//! Runtime settings for the backends, discovery and the router, plus loading
//! from a TOML file at `~/.config/backend-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backends.ollama]
//! host = "localhost"
//! port = 11434
//! timeout_ms = 60000
//!
//! [backends.openai_compatible]
//! port = 1234
//! enabled = false
//!
//! [discovery]
//! cache_timeout_ms = 30000
//! concurrent_scans = true
//!
//! [router]
//! enable_failover = true
//! max_retries = 3
//! retry_delay_ms = 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::{BackendKind, ServiceConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Connection settings for both backend families
#[derive(Clone, Debug, PartialEq)]
pub struct BackendsConfig {
    /// OpenAI-compatible server
    pub openai_compatible: ServiceConfig,
    /// Ollama
    pub ollama: ServiceConfig,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            openai_compatible: ServiceConfig::default_for(BackendKind::OpenAiCompatible),
            ollama: ServiceConfig::default_for(BackendKind::Ollama),
        }
    }
}

impl BackendsConfig {
    /// Settings for one backend
    #[must_use]
    pub fn get(&self, kind: BackendKind) -> &ServiceConfig {
        match kind {
            BackendKind::OpenAiCompatible => &self.openai_compatible,
            BackendKind::Ollama => &self.ollama,
        }
    }

    /// Mutable settings for one backend
    pub fn get_mut(&mut self, kind: BackendKind) -> &mut ServiceConfig {
        match kind {
            BackendKind::OpenAiCompatible => &mut self.openai_compatible,
            BackendKind::Ollama => &mut self.ollama,
        }
    }

    /// `(kind, config)` pairs in scan order
    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, &ServiceConfig)> {
        BackendKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

/// Discovery behaviour
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Reuse scan results younger than `cache_timeout_ms`
    pub enable_caching: bool,
    /// Catalog cache TTL in milliseconds
    pub cache_timeout_ms: u64,
    /// Probe backends in parallel
    pub concurrent_scans: bool,
    /// Timeout for a single health probe in milliseconds
    pub health_check_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable_caching: true,
            cache_timeout_ms: 30_000,
            concurrent_scans: true,
            health_check_timeout_ms: 5_000,
        }
    }
}

impl DiscoveryConfig {
    /// Catalog cache TTL
    #[must_use]
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    /// Health probe timeout
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Router behaviour
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Allow switching to a model on another backend
    pub enable_failover: bool,
    /// Whole-call attempt budget per target
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds
    pub retry_delay_ms: u64,
    /// TTL of the router-local health cache in milliseconds
    pub health_check_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_failover: true,
            max_retries: 3,
            retry_delay_ms: 1_000,
            health_check_interval_ms: 10_000,
        }
    }
}

impl RouterConfig {
    /// Base backoff delay
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Health cache TTL
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Complete relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Backend connection settings
    pub backends: BackendsConfig,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Router settings
    pub router: RouterConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backends: BackendsConfig::default(),
            discovery: DiscoveryConfig::default(),
            router: RouterConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Reject values that cannot work
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero port or timeout on an
    /// enabled backend, or a zero cache TTL while caching is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, service) in self.backends.iter() {
            if !service.enabled {
                continue;
            }
            if service.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "backends.{kind}.port must be non-zero"
                )));
            }
            if service.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "backends.{kind}.timeout_ms must be non-zero"
                )));
            }
            if service.host.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "backends.{kind}.host must not be empty"
                )));
            }
        }
        if self.discovery.enable_caching && self.discovery.cache_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "discovery.cache_timeout_ms must be non-zero when caching is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// One `[backends.*]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceToml {
    /// Host name or address
    pub host: Option<String>,
    /// TCP port
    pub port: Option<u16>,
    /// Whether the backend is used
    pub enabled: Option<bool>,
    /// Per-call timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Transport retries
    pub max_retries: Option<u32>,
    /// Transport retry base delay in milliseconds
    pub retry_delay_ms: Option<u64>,
}

/// `[backends]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsToml {
    /// OpenAI-compatible server section
    pub openai_compatible: ServiceToml,
    /// Ollama section
    pub ollama: ServiceToml,
}

/// `[discovery]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryToml {
    /// Enable the catalog cache
    pub enable_caching: Option<bool>,
    /// Catalog cache TTL in milliseconds
    pub cache_timeout_ms: Option<u64>,
    /// Probe backends in parallel
    pub concurrent_scans: Option<bool>,
    /// Health probe timeout in milliseconds
    pub health_check_timeout_ms: Option<u64>,
}

/// `[router]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Allow cross-backend failover
    pub enable_failover: Option<bool>,
    /// Whole-call attempt budget
    pub max_retries: Option<u32>,
    /// Backoff base delay in milliseconds
    pub retry_delay_ms: Option<u64>,
    /// Health cache TTL in milliseconds
    pub health_check_interval_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Backend sections
    pub backends: BackendsToml,
    /// Discovery section
    pub discovery: DiscoveryToml,
    /// Router section
    pub router: RouterToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/backend-relay/relay.toml` or
/// `~/.config/backend-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("backend-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged configuration fails validation. A missing file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the merged configuration fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a path, reading overrides through `lookup`
///
/// `lookup` stands in for the process environment.
///
/// # Errors
///
/// Same as [`load_config_from_path`], plus a `ValidationError` for an
/// environment value that cannot be honoured.
pub fn load_config_with_env<F>(path: Option<PathBuf>, lookup: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup)?;
    config.validate()?;

    Ok(config)
}

fn apply_service_toml(service: &mut ServiceConfig, toml: &ServiceToml) {
    if let Some(ref host) = toml.host {
        service.host.clone_from(host);
    }
    if let Some(port) = toml.port {
        service.port = port;
    }
    if let Some(enabled) = toml.enabled {
        service.enabled = enabled;
    }
    if let Some(timeout) = toml.timeout_ms {
        service.timeout_ms = timeout;
    }
    if let Some(retries) = toml.max_retries {
        service.max_retries = retries;
    }
    if let Some(delay) = toml.retry_delay_ms {
        service.retry_delay_ms = delay;
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    apply_service_toml(
        &mut config.backends.openai_compatible,
        &toml.backends.openai_compatible,
    );
    apply_service_toml(&mut config.backends.ollama, &toml.backends.ollama);

    if let Some(enabled) = toml.discovery.enable_caching {
        config.discovery.enable_caching = enabled;
    }
    if let Some(ttl) = toml.discovery.cache_timeout_ms {
        config.discovery.cache_timeout_ms = ttl;
    }
    if let Some(concurrent) = toml.discovery.concurrent_scans {
        config.discovery.concurrent_scans = concurrent;
    }
    if let Some(timeout) = toml.discovery.health_check_timeout_ms {
        config.discovery.health_check_timeout_ms = timeout;
    }

    if let Some(enabled) = toml.router.enable_failover {
        config.router.enable_failover = enabled;
    }
    if let Some(retries) = toml.router.max_retries {
        config.router.max_retries = retries;
    }
    if let Some(delay) = toml.router.retry_delay_ms {
        config.router.retry_delay_ms = delay;
    }
    if let Some(interval) = toml.router.health_check_interval_ms {
        config.router.health_check_interval_ms = interval;
    }
}

/// Split `OLLAMA_HOST`-style values: `host`, `host:port`, `http://host:port`
///
/// Backends are spoken to over plain HTTP, so an `https://` value is an error.
fn parse_host_port(var: &str, value: &str) -> Result<(String, Option<u16>), ConfigError> {
    let value = value.trim();
    if value
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    {
        return Err(ConfigError::ValidationError(format!(
            "{var}={value}: https is not supported, backends are reached over http"
        )));
    }

    let trimmed = value.trim_start_matches("http://").trim_end_matches('/');

    Ok(match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (trimmed.to_string(), None),
        },
        _ => (trimmed.to_string(), None),
    })
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false") && !value.eq_ignore_ascii_case("no")
}

/// Apply environment variable overrides to the config
///
/// `lookup` is `std::env::var` in production; tests pass a map.
fn apply_env_config<F>(config: &mut RelayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    for (kind, host_var, port_var, enabled_var) in [
        (
            BackendKind::Ollama,
            "OLLAMA_HOST",
            "OLLAMA_PORT",
            "RELAY_OLLAMA_ENABLED",
        ),
        (
            BackendKind::OpenAiCompatible,
            "OPENAI_COMPAT_HOST",
            "OPENAI_COMPAT_PORT",
            "RELAY_OPENAI_COMPAT_ENABLED",
        ),
    ] {
        let service = config.backends.get_mut(kind);
        if let Some(value) = lookup(host_var) {
            let (host, port) = parse_host_port(host_var, &value)?;
            if !host.is_empty() {
                service.host = host;
            }
            if let Some(port) = port {
                service.port = port;
            }
            touched = true;
        }
        if let Some(port) = lookup(port_var).and_then(|p| p.parse::<u16>().ok()) {
            service.port = port;
            touched = true;
        }
        if let Some(enabled) = lookup(enabled_var) {
            service.enabled = parse_flag(&enabled);
            touched = true;
        }
    }

    if let Some(ms) = lookup("RELAY_REQUEST_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.backends.ollama.timeout_ms = ms;
        config.backends.openai_compatible.timeout_ms = ms;
        touched = true;
    }
    if let Some(ms) = lookup("RELAY_CACHE_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.discovery.cache_timeout_ms = ms;
        touched = true;
    }
    if let Some(concurrent) = lookup("RELAY_CONCURRENT_SCANS") {
        config.discovery.concurrent_scans = parse_flag(&concurrent);
        touched = true;
    }
    if let Some(enabled) = lookup("RELAY_ENABLE_FAILOVER") {
        config.router.enable_failover = parse_flag(&enabled);
        touched = true;
    }
    if let Some(n) = lookup("RELAY_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
        config.router.max_retries = n;
        touched = true;
    }
    if let Some(ms) = lookup("RELAY_RETRY_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.router.retry_delay_ms = ms;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}
