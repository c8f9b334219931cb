//! Store configuration.
//!
//! Configuration is loaded from TOML files and environment variables.
//! Values validate at construction time via the fallible builder;
//! post-deserialization validation is available via `validate()`.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions. Allow it at the module level since config types are
// declarative structs with minimal procedural code.
#![allow(clippy::disallowed_methods)]

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Store configuration.
///
/// # Validation Rules
///
/// - `root_key` must be an absolute path (leading `/`) without a trailing `/`
/// - `transaction_attempts` must be >= 1 (retries = attempts - 1)
/// - `lock_timeout` must be non-zero
/// - `namespace` must be non-empty
///
/// # Example
///
/// ```no_run
/// # use zoom_types::StoreConfig;
/// # use std::time::Duration;
/// let config = StoreConfig::builder()
///     .root_key("/midonet")
///     .transaction_attempts(5)
///     .lock_timeout(Duration::from_secs(30))
///     .build()
///     .expect("valid store config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Backend path root under which all store trees live.
    #[serde(default = "default_root_key")]
    pub root_key: String,
    /// Total attempts for `try_transaction`; the body is retried
    /// `transaction_attempts - 1` times on concurrent modification.
    #[serde(default = "default_transaction_attempts")]
    pub transaction_attempts: u32,
    /// How long to wait for the topology lock before failing the operation.
    #[serde(default = "default_lock_timeout")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub lock_timeout: Duration,
    /// Namespace identifier used by the state subsystem; host-derived by
    /// default.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new store configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_root_key(), into)] root_key: String,
        #[builder(default = default_transaction_attempts())] transaction_attempts: u32,
        #[builder(default = default_lock_timeout())] lock_timeout: Duration,
        #[builder(default = default_namespace(), into)] namespace: String,
    ) -> Result<Self, ConfigError> {
        let config = Self { root_key, transaction_attempts, lock_timeout, namespace };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_key.starts_with('/') || (self.root_key.len() > 1 && self.root_key.ends_with('/'))
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "root_key must be an absolute path without a trailing slash, got {:?}",
                    self.root_key
                ),
            });
        }
        if self.transaction_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "transaction_attempts must be >= 1".to_owned(),
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::Validation {
                message: "lock_timeout must be non-zero".to_owned(),
            });
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::Validation {
                message: "namespace must be non-empty".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_key: default_root_key(),
            transaction_attempts: default_transaction_attempts(),
            lock_timeout: default_lock_timeout(),
            namespace: default_namespace(),
        }
    }
}

fn default_root_key() -> String {
    "/midonet".to_owned()
}

fn default_transaction_attempts() -> u32 {
    3
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_namespace() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.root_key, "/midonet");
        assert_eq!(config.transaction_attempts, 3);
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert!(!config.namespace.is_empty());
    }

    #[test]
    fn test_builder_with_custom_values() {
        let config = StoreConfig::builder()
            .root_key("/cluster-a")
            .transaction_attempts(5)
            .lock_timeout(Duration::from_secs(2))
            .namespace("host-17")
            .build()
            .expect("valid custom config");
        assert_eq!(config.root_key, "/cluster-a");
        assert_eq!(config.transaction_attempts, 5);
        assert_eq!(config.namespace, "host-17");
    }

    #[test]
    fn test_relative_root_key_rejected() {
        let result = StoreConfig::builder().root_key("midonet").build();
        let err = result.expect_err("relative root should fail");
        assert!(err.to_string().contains("root_key"));
    }

    #[test]
    fn test_trailing_slash_rejected() {
        assert!(StoreConfig::builder().root_key("/midonet/").build().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = StoreConfig::builder().transaction_attempts(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_lock_timeout_rejected() {
        let result = StoreConfig::builder().lock_timeout(Duration::ZERO).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let result = StoreConfig::builder().namespace("").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialization_with_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").expect("empty object");
        config.validate().expect("defaults valid");
        assert_eq!(config.transaction_attempts, 3);
    }
}
