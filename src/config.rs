//! Runtime configuration for switchboard

use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`SWITCHBOARD_TRACE_TTL_SECS`, ...)
pub const ENV_PREFIX: &str = "SWITCHBOARD";

/// Orchestration defaults shared by the dispatcher, aggregator and relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Participant label used for coordinator-side trace steps
    pub coordinator: String,
    /// Default wait for broadcast replies, in milliseconds
    pub broadcast_deadline_ms: u64,
    /// Upper bound on one unicast exchange, in milliseconds
    pub dispatch_timeout_ms: u64,
    /// Default wait for a relay to reach its terminal marker, in milliseconds
    pub relay_deadline_ms: u64,
    /// How long request traces are retained, in seconds
    pub trace_ttl_secs: u64,
    /// Longest one trace store operation may take, in milliseconds
    pub trace_store_timeout_ms: u64,
    /// Prefix for channel topics
    pub topic_prefix: String,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            coordinator: "coordinator".to_string(),
            broadcast_deadline_ms: 30_000,
            dispatch_timeout_ms: 120_000,
            relay_deadline_ms: 60_000,
            trace_ttl_secs: 24 * 60 * 60,
            trace_store_timeout_ms: 100,
            topic_prefix: "switchboard".to_string(),
        }
    }
}

impl SwitchboardConfig {
    /// Load configuration from `SWITCHBOARD_*` environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env if present so local development picks up overrides
        let _ = dotenv();

        let settings = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Self::from_settings(settings)
    }

    /// Load configuration from a file, with environment overrides on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenv();

        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Self::from_settings(settings)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every call fail
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.trim().is_empty() {
            return Err(Error::config("coordinator label must not be empty"));
        }
        let durations = [
            ("broadcast_deadline_ms", self.broadcast_deadline_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
            ("relay_deadline_ms", self.relay_deadline_ms),
            ("trace_ttl_secs", self.trace_ttl_secs),
            ("trace_store_timeout_ms", self.trace_store_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Set the coordinator label
    pub fn with_coordinator(mut self, coordinator: impl Into<String>) -> Self {
        self.coordinator = coordinator.into();
        self
    }

    /// Set the trace retention
    pub fn with_trace_ttl(mut self, ttl: Duration) -> Self {
        self.trace_ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// Set the unicast timeout
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default broadcast deadline
    pub fn broadcast_deadline(&self) -> Duration {
        Duration::from_millis(self.broadcast_deadline_ms)
    }

    /// Unicast timeout
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// Default relay deadline
    pub fn relay_deadline(&self) -> Duration {
        Duration::from_millis(self.relay_deadline_ms)
    }

    /// Trace retention
    pub fn trace_ttl(&self) -> Duration {
        Duration::from_secs(self.trace_ttl_secs)
    }

    /// Bound on one trace store operation
    pub fn trace_store_timeout(&self) -> Duration {
        Duration::from_millis(self.trace_store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwitchboardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trace_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.trace_store_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_partial_yaml_keeps_defaults() {
        let yaml = r#"
coordinator: "host-agent"
broadcast_deadline_ms: 2000
"#;
        let config = SwitchboardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.coordinator, "host-agent");
        assert_eq!(config.broadcast_deadline(), Duration::from_secs(2));
        assert_eq!(config.relay_deadline_ms, 60_000);
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let err = SwitchboardConfig::from_yaml("relay_deadline_ms: 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let config = SwitchboardConfig::default().with_coordinator(" ");
        assert!(config.validate().is_err());
    }
}
