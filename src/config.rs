//! Configuration management for Turnstile.
//!
//! Policies are read from YAML:
//!
//! ```yaml
//! limiter:
//!   key_prefix: "rl:"
//! policies:
//!   logins:
//!     threshold: 5
//!     interval: 60
//!   uploads:
//!     threshold: 10
//!     interval: 60
//!     burst_rate: 15
//!     description: Upload limit
//! ```
//!
//! Limiter settings may be overridden from the environment, e.g.
//! `TURNSTILE__LIMITER__KEY_PREFIX=staging:`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::ratelimit::Policy;

/// Prefix of environment variables overriding limiter settings.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter settings
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Policies by handle
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
}

/// Limiter-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Prefix prepended to every storage key
    #[serde(default)]
    pub key_prefix: String,

    /// How often the in-memory store drops expired records, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_purge_interval() -> u64 {
    60
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string and validate every policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, apply environment overrides and
    /// validate the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override limiter settings from `TURNSTILE__LIMITER__*` variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let env = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        if let Some(prefix) = optional(env.get::<String>("limiter.key_prefix"))? {
            self.limiter.key_prefix = prefix;
        }
        if let Some(secs) = optional(env.get::<u64>("limiter.purge_interval_secs"))? {
            self.limiter.purge_interval_secs = secs;
        }
        Ok(())
    }

    /// Check every policy and the limiter settings.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.purge_interval_secs == 0 {
            return Err(Error::Config(
                "limiter.purge_interval_secs must be positive".to_string(),
            ));
        }
        for (handle, policy) in &self.policies {
            policy.validate(handle)?;
        }
        Ok(())
    }
}

fn optional<T>(value: std::result::Result<T, config::ConfigError>) -> Result<Option<T>> {
    match value {
        Ok(v) => Ok(Some(v)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;
    use std::time::Duration;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
limiter:
  key_prefix: "rl:"
policies:
  logins:
    threshold: 5
    interval: 60
  uploads:
    threshold: 10
    interval: 60
    burst_rate: 15
    description: Upload limit
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.key_prefix, "rl:");
        assert_eq!(config.limiter.purge_interval_secs, 60);
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies["logins"].interval, Duration::from_secs(60));
        assert_eq!(config.policies["uploads"].algorithm(), Algorithm::LeakyBucket);
    }

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config, TurnstileConfig::default());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
policies:
  uploads:
    threshold: 10
    interval: 60
    burst_rate: 5
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("burst_rate"));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(matches!(
            TurnstileConfig::from_yaml("policies: [1, 2"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    // One test owns the TURNSTILE__ variables so parallel tests cannot race on them.
    #[test]
    fn test_env_overrides() {
        let path = std::env::temp_dir().join(format!("turnstile-env-{}.yaml", std::process::id()));
        std::fs::write(&path, "policies:\n  logins:\n    threshold: 5\n    interval: 60\n").unwrap();

        std::env::set_var("TURNSTILE__LIMITER__PURGE_INTERVAL_SECS", "5");
        let mut config = TurnstileConfig::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.limiter.purge_interval_secs, 5);
        assert_eq!(config.limiter.key_prefix, "");
        assert_eq!(TurnstileConfig::from_file(&path).unwrap().limiter.purge_interval_secs, 5);

        std::env::set_var("TURNSTILE__LIMITER__PURGE_INTERVAL_SECS", "0");
        let result = TurnstileConfig::from_file(&path);
        std::env::remove_var("TURNSTILE__LIMITER__PURGE_INTERVAL_SECS");
        std::fs::remove_file(&path).unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("purge_interval_secs"));
    }
}
