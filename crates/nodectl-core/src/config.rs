//! Configuration types for the node controller
//!
//! Loading configuration from files or the environment is the embedding
//! binary's concern; this module only defines the shape, defaults and
//! validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interval of the node-sync job (descriptor, accounts, rules)
    #[serde(default = "default_update_periodic_secs")]
    pub update_periodic_secs: u64,

    /// Interval of the traffic-sync job (counters, online IPs, detections)
    #[serde(default = "default_traffic_periodic_secs")]
    pub traffic_periodic_secs: u64,

    /// Interval of the certificate-renewal job
    #[serde(default = "default_cert_periodic_secs")]
    pub cert_periodic_secs: u64,

    /// Deadline applied to every remote API and traffic engine call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long `stop()` waits for in-flight jobs before aborting them
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Capacity of the controller event channel
    ///
    /// When full, events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ControllerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            update_periodic_secs: default_update_periodic_secs(),
            traffic_periodic_secs: default_traffic_periodic_secs(),
            cert_periodic_secs: default_cert_periodic_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        let intervals = [
            ("update_periodic_secs", self.update_periodic_secs),
            ("traffic_periodic_secs", self.traffic_periodic_secs),
            ("cert_periodic_secs", self.cert_periodic_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(crate::Error::config(format!("{} must be > 0", name)));
            }
        }

        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }

        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_periodic_secs)
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_periodic_secs)
    }

    pub fn cert_interval(&self) -> Duration {
        Duration::from_secs(self.cert_periodic_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_update_periodic_secs() -> u64 {
    60
}

fn default_traffic_periodic_secs() -> u64 {
    60
}

fn default_cert_periodic_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_event_channel_capacity() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cert_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ControllerConfig {
            traffic_periodic_secs: 0,
            ..ControllerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("traffic_periodic_secs"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{ "update_periodic_secs": 5 }"#).unwrap();
        assert_eq!(config.update_periodic_secs, 5);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.event_channel_capacity, 1000);
    }
}
