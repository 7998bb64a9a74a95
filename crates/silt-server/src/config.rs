use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub auth_secret: String,
    pub auth_issuer: String,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub sync_push_rate_limit_per_window: u32,
    pub resolve_rate_limit_per_window: u32,
    pub max_pull_limit: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("auth_secret", &"[REDACTED]")
            .field("auth_issuer", &self.auth_issuer)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_push_rate_limit_per_window",
                &self.sync_push_rate_limit_per_window,
            )
            .field(
                "resolve_rate_limit_per_window",
                &self.resolve_rate_limit_per_window,
            )
            .field("max_pull_limit", &self.max_pull_limit)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "SILT_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "SILT_DATABASE_PATH", "silt-server.db");

        let auth_secret = required_trimmed(&lookup, "SILT_AUTH_SECRET")?;
        if auth_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "SILT_AUTH_SECRET must be at least 16 characters".to_string(),
            ));
        }
        let auth_issuer = value_or_default(&lookup, "SILT_AUTH_ISSUER", "silt");

        let auth_clock_skew_secs = value_or_default(&lookup, "SILT_AUTH_CLOCK_SKEW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SILT_AUTH_CLOCK_SKEW_SECS must be an integer in [0, 300]".to_string(),
                )
            })?;
        if auth_clock_skew_secs > 300 {
            return Err(ConfigError::Invalid(
                "SILT_AUTH_CLOCK_SKEW_SECS must be in [0, 300]".to_string(),
            ));
        }

        let rate_limit_window_secs = value_or_default(&lookup, "SILT_RATE_LIMIT_WINDOW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SILT_RATE_LIMIT_WINDOW_SECS must be an integer in [10, 3600]".to_string(),
                )
            })?;
        if !(10..=3_600).contains(&rate_limit_window_secs) {
            return Err(ConfigError::Invalid(
                "SILT_RATE_LIMIT_WINDOW_SECS must be in [10, 3600]".to_string(),
            ));
        }

        let sync_push_rate_limit_per_window =
            value_or_default(&lookup, "SILT_PUSH_RATE_LIMIT_PER_WINDOW", "60")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SILT_PUSH_RATE_LIMIT_PER_WINDOW must be an integer in [1, 5000]"
                            .to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&sync_push_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SILT_PUSH_RATE_LIMIT_PER_WINDOW must be in [1, 5000]".to_string(),
            ));
        }

        let resolve_rate_limit_per_window =
            value_or_default(&lookup, "SILT_RESOLVE_RATE_LIMIT_PER_WINDOW", "30")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SILT_RESOLVE_RATE_LIMIT_PER_WINDOW must be an integer in [1, 5000]"
                            .to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&resolve_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SILT_RESOLVE_RATE_LIMIT_PER_WINDOW must be in [1, 5000]".to_string(),
            ));
        }

        let max_pull_limit = value_or_default(&lookup, "SILT_MAX_PULL_LIMIT", "500")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("SILT_MAX_PULL_LIMIT must be an integer in [1, 5000]".to_string())
            })?;
        if !(1..=5_000).contains(&max_pull_limit) {
            return Err(ConfigError::Invalid(
                "SILT_MAX_PULL_LIMIT must be in [1, 5000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            database_path,
            auth_secret,
            auth_issuer,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_push_rate_limit_per_window,
            resolve_rate_limit_per_window,
            max_pull_limit,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn with(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_auth_secret() {
        let err = with(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("SILT_AUTH_SECRET"));
    }

    #[test]
    fn config_rejects_short_secret() {
        let mut map = HashMap::new();
        map.insert("SILT_AUTH_SECRET", "short");
        let err = with(&map).unwrap_err();
        assert!(err.to_string().contains("at least 16"));
    }

    #[test]
    fn config_redacts_secret_in_debug() {
        let mut map = HashMap::new();
        map.insert("SILT_AUTH_SECRET", "a-long-enough-secret-value");
        let config = with(&map).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("a-long-enough-secret-value"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn config_validates_ranges() {
        let mut map = HashMap::new();
        map.insert("SILT_AUTH_SECRET", "a-long-enough-secret-value");
        map.insert("SILT_RATE_LIMIT_WINDOW_SECS", "5");
        assert!(with(&map).is_err());

        map.insert("SILT_RATE_LIMIT_WINDOW_SECS", "60");
        map.insert("SILT_MAX_PULL_LIMIT", "0");
        assert!(with(&map).is_err());
    }
}
