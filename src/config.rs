//! Stress-test configuration and validation.
//!
//! A [`StressConfig`] describes one stress test: how many workers to run,
//! how many requests to schedule, and the ramp-up / duration / timeout
//! limits that bound the run. A config that fails [`StressConfig::validate`]
//! must never reach the executor.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on concurrent workers.
pub const MAX_CONCURRENT_CONNS: u32 = 1_000;

/// Upper bound on scheduled requests per run.
pub const MAX_TOTAL_REQUESTS: u64 = 1_000_000;

/// Per-request timeout applied when the config leaves it at 0.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Field '{field}' is required but empty")]
    RequiredField { field: &'static str },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Main configuration for one stress test.
///
/// `id` is assigned by the store on first save and stays 0 for configs that
/// were never persisted. `profile_name` scopes config names and run listings;
/// it may be empty for the default profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressConfig {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub request_file: String,
    #[serde(default)]
    pub profile_name: String,
    pub concurrent_conns: u32,
    pub total_requests: u64,
    #[serde(default)]
    pub ramp_up_secs: u64,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub timeout_secs: u64,
}

impl StressConfig {
    /// Checks all field invariants.
    ///
    /// # Errors
    /// Returns the first violated constraint with field-level context.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::RequiredField { field: "name" });
        }
        if self.request_file.trim().is_empty() {
            return Err(ConfigError::RequiredField {
                field: "request_file",
            });
        }
        if self.concurrent_conns < 1 || self.concurrent_conns > MAX_CONCURRENT_CONNS {
            return Err(ConfigError::OutOfRange {
                field: "concurrent_conns",
                value: u64::from(self.concurrent_conns),
                min: 1,
                max: u64::from(MAX_CONCURRENT_CONNS),
            });
        }
        if self.total_requests < 1 || self.total_requests > MAX_TOTAL_REQUESTS {
            return Err(ConfigError::OutOfRange {
                field: "total_requests",
                value: self.total_requests,
                min: 1,
                max: MAX_TOTAL_REQUESTS,
            });
        }
        Ok(())
    }

    /// Per-request deadline, with the 10s default applied when unset.
    pub fn request_timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Total spread over which tasks are released. Zero means fire immediately.
    pub fn ramp_up(&self) -> Duration {
        Duration::from_secs(self.ramp_up_secs)
    }

    /// Wall-clock cap from test start, or None when the run is bounded only
    /// by `total_requests`.
    pub fn test_duration(&self) -> Option<Duration> {
        if self.duration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.duration_secs))
        }
    }
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl StressConfig {
    /// Loads a configuration from environment variables.
    ///
    /// Used by the non-interactive runner; library callers build
    /// [`StressConfig`] directly.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = StressConfig {
            id: 0,
            name: env::var("TEST_NAME").unwrap_or_else(|_| "stress-test".to_string()),
            request_file: env::var("REQUEST_FILE").unwrap_or_else(|_| "<env>".to_string()),
            profile_name: env::var("PROFILE_NAME").unwrap_or_default(),
            concurrent_conns: env_parse_or("CONCURRENT_CONNS", 10)?,
            total_requests: env_parse_or("TOTAL_REQUESTS", 100)?,
            ramp_up_secs: env_parse_or("RAMP_UP_SECS", 0)?,
            duration_secs: env_parse_or("TEST_DURATION_SECS", 0)?,
            timeout_secs: env_parse_or("REQUEST_TIMEOUT_SECS", 0)?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StressConfig {
        StressConfig {
            id: 0,
            name: "baseline".to_string(),
            request_file: "requests/get.http".to_string(),
            profile_name: String::new(),
            concurrent_conns: 5,
            total_requests: 50,
            ramp_up_secs: 0,
            duration_secs: 0,
            timeout_secs: 0,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut config = base_config();
        config.name = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_empty_request_file_rejected() {
        let mut config = base_config();
        config.request_file = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_concurrency_bounds() {
        let mut config = base_config();
        config.concurrent_conns = 0;
        assert!(config.validate().is_err());

        config.concurrent_conns = 1_001;
        assert!(config.validate().is_err());

        config.concurrent_conns = 1_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_total_requests_bounds() {
        let mut config = base_config();
        config.total_requests = 0;
        assert!(config.validate().is_err());

        config.total_requests = 1_000_001;
        assert!(config.validate().is_err());

        config.total_requests = 1_000_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_default_applied() {
        let mut config = base_config();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));

        config.timeout_secs = 3;
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_duration_means_unlimited() {
        let mut config = base_config();
        assert_eq!(config.test_duration(), None);

        config.duration_secs = 30;
        assert_eq!(config.test_duration(), Some(Duration::from_secs(30)));
    }
}
