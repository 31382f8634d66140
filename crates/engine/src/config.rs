//! Engine configuration

use std::time::Duration;

use evsched_event::topics;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, also its direct-address topic
    pub name: String,

    /// Transport endpoint; `None` runs the engine locally only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Handlers and RPC calls allowed to run at once
    pub max_workers: usize,

    /// How long the local loop waits for an eligible event before re-checking
    /// for shutdown
    #[serde(with = "humantime_duration")]
    pub queue_poll_interval: Duration,

    /// How long the transport loop waits for inbound frames per poll
    #[serde(with = "humantime_duration")]
    pub transport_poll_timeout: Duration,

    /// How often each event source is polled
    #[serde(with = "humantime_duration")]
    pub source_poll_interval: Duration,

    /// Soft time budget for RPC methods registered without one
    #[serde(with = "humantime_duration")]
    pub default_time_budget: Duration,

    /// How long `stop` waits for in-flight work before giving up on it
    #[serde(with = "humantime_duration")]
    pub shutdown_timeout: Duration,

    /// Topic the engine announces its RPC methods to
    pub broker_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "evsched".to_string(),
            endpoint: None,
            max_workers: num_cpus::get(),
            queue_poll_interval: Duration::from_millis(100),
            transport_poll_timeout: Duration::from_millis(100),
            source_poll_interval: Duration::from_millis(100),
            default_time_budget: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            broker_topic: topics::BROKER.to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the text is not valid TOML or fails
    /// validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the engine unusable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("name must not be empty".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(Error::Configuration(
                "queue_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.transport_poll_timeout.is_zero() {
            return Err(Error::Configuration(
                "transport_poll_timeout must be greater than zero".to_string(),
            ));
        }
        if self.source_poll_interval.is_zero() {
            return Err(Error::Configuration(
                "source_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.broker_topic.is_empty() {
            return Err(Error::Configuration(
                "broker_topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
