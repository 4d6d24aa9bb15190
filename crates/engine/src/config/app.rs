//! Engine configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::engine::RetryPolicy;

/// Where definitions are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    #[default]
    Postgres,
    /// Definitions from `project_file`, ledger in memory.
    Memory,
}

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `TESSERA_`:
/// - `TESSERA_HOST`: Server bind address (default: "0.0.0.0")
/// - `TESSERA_PORT`: Server port (default: 8090)
/// - `TESSERA_WORKERS`: Steps executed concurrently (default: 4)
/// - `TESSERA_RETRY_MAX_ATTEMPTS`: Attempts per connector call (default: 3)
/// - `TESSERA_RETRY_INITIAL_DELAY_MS`, `TESSERA_RETRY_MAX_DELAY_MS`,
///   `TESSERA_RETRY_BACKOFF_MULTIPLIER`: Backoff between attempts
/// - `TESSERA_STEP_TIMEOUT_SECS`: Per-step timeout (optional)
/// - `TESSERA_METADATA_BACKEND`: `postgres` or `memory`
/// - `TESSERA_PROJECT_FILE`: Definitions YAML for the memory backend
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Size of the step worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Per-step timeout in seconds
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    #[serde(default)]
    pub metadata_backend: MetadataBackend,

    #[serde(default)]
    pub project_file: Option<String>,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_server_name() -> String {
    "tessera-engine".to_string()
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `TESSERA_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("TESSERA_").from_env::<EngineConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier.max(1.0),
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            retry_max_attempts: default_max_attempts(),
            retry_initial_delay_ms: default_initial_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            step_timeout_secs: None,
            metadata_backend: MetadataBackend::default(),
            project_file: None,
            server_name: default_server_name(),
        }
    }
}
