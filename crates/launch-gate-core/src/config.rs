use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{is_http_url, LaunchError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays_ms: vec![4_500, 9_000, 18_000],
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt when the schedule sits at `slot`.
    /// Slots past the end of the schedule reuse the last delay.
    #[must_use]
    pub fn delay_for_slot(&self, slot: usize) -> Duration {
        let millis = self
            .delays_ms
            .get(slot)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or_default();
        Duration::from_millis(millis)
    }
}

/// Environment fields sent with every destination request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientEnvironment {
    pub platform: String,
    pub install_id: String,
    pub bundle_id: String,
    #[serde(default)]
    pub push_token: Option<String>,
    pub locale: String,
}

impl Default for ClientEnvironment {
    fn default() -> Self {
        Self {
            platform: "ios".to_string(),
            install_id: String::new(),
            bundle_id: String::new(),
            push_token: None,
            locale: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    pub attribution_url: String,
    pub attribution_dev_key: Option<String>,
    pub destination_url: String,
    pub request_timeout_ms: u64,
    pub coalescing_window_ms: u64,
    pub deadline_ms: u64,
    pub reattribution_grace_ms: u64,
    pub retry: RetryPolicy,
    pub environment: ClientEnvironment,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            attribution_url: "https://attribution.invalid/install_data".to_string(),
            attribution_dev_key: None,
            destination_url: "https://config.invalid/config.php".to_string(),
            request_timeout_ms: 30_000,
            coalescing_window_ms: 2_500,
            deadline_ms: 30_000,
            reattribution_grace_ms: 5_000,
            retry: RetryPolicy::default(),
            environment: ClientEnvironment::default(),
        }
    }
}

impl LaunchConfig {
    /// Validates endpoint and timing bounds.
    ///
    /// # Errors
    /// Returns [`LaunchError::Configuration`] when an endpoint is not an
    /// `http(s)` URL, a duration is zero, or the retry policy is empty.
    pub fn validate(&self) -> Result<(), LaunchError> {
        for (name, url) in [
            ("attribution_url", &self.attribution_url),
            ("destination_url", &self.destination_url),
        ] {
            if !is_http_url(url) {
                return Err(LaunchError::Configuration(format!(
                    "{name} MUST be an http(s) URL, got '{url}'"
                )));
            }
        }

        for (name, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("coalescing_window_ms", self.coalescing_window_ms),
            ("deadline_ms", self.deadline_ms),
            ("reattribution_grace_ms", self.reattribution_grace_ms),
        ] {
            if value == 0 {
                return Err(LaunchError::Configuration(format!("{name} MUST be > 0")));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(LaunchError::Configuration(
                "retry.max_attempts MUST be >= 1".to_string(),
            ));
        }

        if self.retry.delays_ms.is_empty() {
            return Err(LaunchError::Configuration(
                "retry.delays_ms MUST contain at least one delay".to_string(),
            ));
        }

        if self.environment.platform.trim().is_empty() {
            return Err(LaunchError::Configuration(
                "environment.platform MUST be provided".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`LaunchError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, LaunchError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LaunchError::Configuration(format!("invalid launch config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn coalescing_window(&self) -> Duration {
        Duration::from_millis(self.coalescing_window_ms)
    }

    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub fn reattribution_grace(&self) -> Duration {
        Duration::from_millis(self.reattribution_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_launch_timings() {
        let config = LaunchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coalescing_window(), Duration::from_millis(2_500));
        assert_eq!(config.deadline(), Duration::from_secs(30));
        assert_eq!(config.reattribution_grace(), Duration::from_secs(5));
        assert_eq!(config.retry.delay_for_slot(0), Duration::from_millis(4_500));
        assert_eq!(config.retry.delay_for_slot(2), Duration::from_millis(18_000));
        assert_eq!(config.retry.delay_for_slot(9), Duration::from_millis(18_000));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = LaunchConfig::from_json(&json!({
            "destination_url": "https://config.example.test/resolve",
            "environment": {
                "platform": "ios",
                "install_id": "install-1",
                "bundle_id": "com.example.fishing",
                "locale": "en_US"
            }
        }));
        let config = match config {
            Ok(value) => value,
            Err(err) => panic!("expected valid config: {err}"),
        };
        assert_eq!(config.destination_url, "https://config.example.test/resolve");
        assert_eq!(config.deadline_ms, 30_000);
        assert_eq!(config.environment.push_token, None);
    }

    #[test]
    fn invalid_values_are_reported_clearly() {
        let err = LaunchConfig::from_json(&json!({"destination_url": "config.php"}));
        assert!(
            matches!(&err, Err(LaunchError::Configuration(message)) if message.contains("destination_url")),
            "unexpected result: {err:?}"
        );

        let err = LaunchConfig::from_json(&json!({"retry": {"max_attempts": 0, "delays_ms": [1]}}));
        assert!(matches!(err, Err(LaunchError::Configuration(_))));

        let err = LaunchConfig::from_json(&json!({"deadline_ms": "soon"}));
        assert!(
            matches!(&err, Err(LaunchError::Configuration(message)) if message.contains("invalid launch config")),
            "unexpected result: {err:?}"
        );
    }
}
