//! Rotator configuration.
//!
//! Supports construction in code or from a JSON file, with sensible
//! defaults for every field.

use crate::error::{Result, RotatorError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for the rotator.
///
/// Worst-case latency of one `request` call is bounded by
/// `keys × max_retries × (timeout + max_backoff)`; there is no
/// separate overall deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Retry attempts *per key*. The total attempt budget of one
    /// request is `pool size × max_retries`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Backoff ceiling.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Default transport timeout (overridable per request).
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Consecutive failures before a key is marked unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// User agents rotated across attempts. Empty disables rotation.
    #[serde(default)]
    pub user_agents: Vec<String>,

    /// Proxy URLs rotated across attempts. Empty disables rotation.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Random pacing delay applied before each attempt, if set.
    #[serde(default)]
    pub random_delay: Option<DelayRange>,

    /// Remember non-sensitive headers of the first clean success per
    /// domain and re-apply them to later requests. Requires a config
    /// store.
    #[serde(default)]
    pub save_domain_headers: bool,

    /// Treat 4xx statuses other than 401/403/429 as key-level
    /// permanent failures. Historical default; disable if your
    /// upstream returns 4xx for request-shaped problems.
    #[serde(default = "default_true")]
    pub treat_client_errors_as_permanent: bool,
}

/// Inclusive range for the random pacing delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayRange {
    /// Shortest delay.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Longest delay.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_backoff: default_max_backoff(),
            timeout: default_timeout(),
            failure_threshold: default_failure_threshold(),
            user_agents: Vec::new(),
            proxies: Vec::new(),
            random_delay: None,
            save_domain_headers: false,
            treat_client_errors_as_permanent: true,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl RotatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RotatorError::Store {
            path: path.clone(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(RotatorError::InvalidConfig(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(RotatorError::InvalidConfig(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(range) = &self.random_delay {
            if range.min > range.max {
                return Err(RotatorError::InvalidConfig(
                    "random_delay min must not exceed max".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Custom serde module for humantime Duration parsing.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // Simple parsing: support "100ms", "30s", or plain seconds.
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RotatorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.treat_client_errors_as_permanent);
        assert!(!config.save_domain_headers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let config = RotatorConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_delay_range() {
        let config = RotatorConfig {
            random_delay: Some(DelayRange {
                min: Duration::from_secs(2),
                max: Duration::from_secs(1),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing() {
        let json = r#"{"base_delay": "250ms", "timeout": "5s", "max_backoff": "30"}"#;
        let config: RotatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }
}
