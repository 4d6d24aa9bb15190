//! Scheduler configuration.

use anyhow::Result;
use std::time::Duration;

/// Scheduler process configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifies this scheduler instance in logs.
    pub scheduler_id: String,

    /// Engine API base URL.
    pub engine_url: String,

    /// Time between trigger evaluations.
    pub poll_interval: Duration,

    /// Timeout of each engine API call.
    pub request_timeout: Duration,
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let scheduler_id = std::env::var("SCHEDULER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let engine_url = std::env::var("TESSERA_ENGINE_URL")
            .unwrap_or_else(|_| "http://localhost:8090".to_string());

        let poll_secs: u64 = std::env::var("SCHEDULER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let timeout_secs: u64 = std::env::var("SCHEDULER_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            scheduler_id,
            engine_url,
            poll_interval: Duration::from_secs(poll_secs.max(1)),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_id: uuid::Uuid::new_v4().to_string(),
            engine_url: "http://localhost:8090".to_string(),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.engine_url, "http://localhost:8090");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(!config.scheduler_id.is_empty());
    }
}
