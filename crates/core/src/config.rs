//! Configuration for the relay server and the session runner
//!
//! Configuration can be loaded from a TOML file and/or `DUET_*` environment
//! variables.

use crate::types::ApiKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream avatar provider
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Negotiation timing and ordering
    #[serde(default)]
    pub negotiation: NegotiationConfig,

    /// Where session runners reach the relay
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Relay HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Avatar provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Account API key; only the relay server ever holds it
    #[serde(default, skip_serializing)]
    pub api_key: Option<ApiKey>,

    /// Per-request timeout for provider calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Idle timeout requested when creating a session
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_base_url() -> String {
    "https://api.heygen.com".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_seconds: default_request_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Order in which the orchestrator brings up the two roles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupPolicy {
    /// Doctor starts only after the patient is connected
    #[default]
    Sequential,
    /// Both roles start immediately
    Concurrent,
}

impl FromStr for StartupPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(StartupPolicy::Sequential),
            "concurrent" => Ok(StartupPolicy::Concurrent),
            other => Err(ConfigError::Parse(format!("unknown startup policy: {}", other))),
        }
    }
}

impl fmt::Display for StartupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupPolicy::Sequential => f.write_str("sequential"),
            StartupPolicy::Concurrent => f.write_str("concurrent"),
        }
    }
}

/// Negotiation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// Upper bound on waiting for local ICE gathering to complete
    #[serde(default = "default_ice_gathering_timeout")]
    pub ice_gathering_timeout_ms: u64,

    /// Cap on every relay call made by a negotiator
    #[serde(default = "default_relay_call_timeout")]
    pub relay_call_timeout_ms: u64,

    #[serde(default)]
    pub startup_policy: StartupPolicy,
}

fn default_ice_gathering_timeout() -> u64 {
    5000
}

fn default_relay_call_timeout() -> u64 {
    10_000
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_gathering_timeout_ms: default_ice_gathering_timeout(),
            relay_call_timeout_ms: default_relay_call_timeout(),
            startup_policy: StartupPolicy::default(),
        }
    }
}

impl NegotiationConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn relay_call_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_call_timeout_ms)
    }
}

/// Relay location for session runners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
}

fn default_relay_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load configuration from file if it exists, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                let mut config = Self::from_file(p)?;
                config.apply_overrides(|name| std::env::var(name).ok());
                return Ok(config);
            }
        }
        Ok(Self::from_env())
    }

    /// Apply `DUET_*` overrides looked up through `lookup`
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server
        if let Some(host) = lookup("DUET_HOST") {
            self.server.host = host;
        }
        if let Some(p) = lookup("DUET_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = p;
        }

        // Provider
        if let Some(url) = lookup("DUET_PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(key) = lookup("DUET_PROVIDER_API_KEY") {
            self.provider.api_key = Some(ApiKey::new(key));
        }
        if let Some(t) = lookup("DUET_PROVIDER_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.provider.request_timeout_seconds = t;
        }
        if let Some(t) = lookup("DUET_IDLE_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.provider.idle_timeout_seconds = t;
        }

        // Negotiation
        if let Some(t) = lookup("DUET_ICE_GATHERING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.negotiation.ice_gathering_timeout_ms = t;
        }
        if let Some(t) = lookup("DUET_RELAY_CALL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.negotiation.relay_call_timeout_ms = t;
        }
        if let Some(policy) = lookup("DUET_STARTUP_POLICY").and_then(|v| v.parse().ok()) {
            self.negotiation.startup_policy = policy;
        }

        // Relay
        if let Some(url) = lookup("DUET_RELAY_URL") {
            self.relay.url = url;
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
