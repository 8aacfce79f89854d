//! Configuration types

use crate::error::{ConfigError, RdbxError, RdbxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cache entry TTL (30 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1800);
/// Default distributed lock lease.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(180);
/// Default deadline for a single external call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to sleep after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runtime configuration shared by the query path and the coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdbxConfig {
    /// TTL of persisted result blobs.
    pub cache_ttl: Duration,
    /// Default lease of distributed locks.
    pub lock_lease: Duration,
    /// Retry policy of the unlock protocol.
    pub unlock_retry: RetryConfig,
    /// Deadline applied to every external call; `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for RdbxConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            lock_lease: DEFAULT_LOCK_LEASE,
            unlock_retry: RetryConfig::default(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl RdbxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RDBX_CACHE_TTL_SECS` (default: 1800)
    /// - `RDBX_LOCK_LEASE_SECS` (default: 180)
    /// - `RDBX_UNLOCK_MAX_ATTEMPTS` (default: 5)
    /// - `RDBX_UNLOCK_BACKOFF_MS`: initial backoff (default: 50)
    /// - `RDBX_CALL_TIMEOUT_MS`: 0 disables the deadline (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let call_timeout = match env_parse::<u64>("RDBX_CALL_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.call_timeout,
        };

        Self {
            cache_ttl: env_parse("RDBX_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            lock_lease: env_parse("RDBX_LOCK_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_lease),
            unlock_retry: RetryConfig {
                max_attempts: env_parse("RDBX_UNLOCK_MAX_ATTEMPTS")
                    .unwrap_or(defaults.unlock_retry.max_attempts),
                initial_backoff: env_parse("RDBX_UNLOCK_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.unlock_retry.initial_backoff),
                ..defaults.unlock_retry
            },
            call_timeout,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_unlock_retry(mut self, retry: RetryConfig) -> Self {
        self.unlock_retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - cache_ttl and lock_lease are positive
    /// - unlock_retry.max_attempts >= 1
    /// - unlock_retry.backoff_multiplier >= 1.0
    /// - call_timeout, when set, is positive
    pub fn validate(&self) -> RdbxResult<()> {
        fn invalid(field: &str, value: String, reason: &str) -> RdbxError {
            RdbxError::Config(ConfigError::InvalidValue {
                field: field.to_string(),
                value,
                reason: reason.to_string(),
            })
        }

        if self.cache_ttl.is_zero() {
            return Err(invalid(
                "cache_ttl",
                format!("{:?}", self.cache_ttl),
                "cache_ttl must be positive",
            ));
        }

        if self.lock_lease.is_zero() {
            return Err(invalid(
                "lock_lease",
                format!("{:?}", self.lock_lease),
                "lock_lease must be positive",
            ));
        }

        if self.unlock_retry.max_attempts == 0 {
            return Err(invalid(
                "unlock_retry.max_attempts",
                self.unlock_retry.max_attempts.to_string(),
                "at least one attempt is required",
            ));
        }

        if self.unlock_retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "unlock_retry.backoff_multiplier",
                self.unlock_retry.backoff_multiplier.to_string(),
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if let Some(timeout) = self.call_timeout {
            if timeout.is_zero() {
                return Err(invalid(
                    "call_timeout",
                    format!("{:?}", timeout),
                    "call_timeout must be positive when set",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RdbxConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.lock_lease, Duration::from_secs(180));
        assert_eq!(config.unlock_retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RdbxConfig::new()
            .with_cache_ttl(Duration::from_secs(60))
            .with_lock_lease(Duration::from_secs(30))
            .with_call_timeout(None);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert_eq!(config.call_timeout, None);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = RdbxConfig::default().with_unlock_retry(RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            RdbxError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "unlock_retry.max_attempts"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = RdbxConfig::default().with_cache_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(8), Duration::from_millis(350));
    }
}
