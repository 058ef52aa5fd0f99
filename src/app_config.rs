// Centralized configuration management for the relay gateway
// Load ALL env vars ONCE at startup

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Global application configuration loaded once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(|| {
    // For tests, load .env file first
    #[cfg(test)]
    dotenv::dotenv().ok();

    AppConfig::from_env().expect("Failed to load configuration")
});

/// Accessor used by main and tests
pub fn config() -> &'static AppConfig {
    &CONFIG
}

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub concurrency: ConcurrencySettings,
    pub limits: LimitSettings,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub environment: Environment,
    pub rust_log: String,
}

/// Environment type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "test" => Environment::Test,
            "staging" | "stage" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: u32,
    pub connection_timeout: u64,
    pub command_timeout: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// In-process cache TTLs (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub api_key_ttl: u64,
    pub api_key_negative_ttl: u64,
    pub runtime_config_ttl: u64,
}

/// Concurrency lease tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    /// Lease duration for a held slot, seconds (min 30)
    pub lease_seconds: u64,
    /// Renewal tick, seconds; 0 disables renewal
    pub renew_interval_seconds: u64,
    /// Hard ceiling on a single request's slot lifetime, minutes
    pub max_lifetime_minutes: u64,
    /// Orphan entries older than this many seconds past expiry are reaped
    pub cleanup_grace_seconds: u64,
    /// Background reclamation sweep interval, seconds
    pub cleanup_interval_seconds: u64,
}

/// Request size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub max_body_bytes: usize,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let get_or_default = |key: &str, default: &str| -> String {
            env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let parse_u32 = |key: &str, default: &str| -> Result<u32, ConfigError> {
            get_or_default(key, default).parse().map_err(|_| {
                ConfigError::InvalidValue(key.to_string(), "not a valid u32".to_string())
            })
        };

        let parse_u64 = |key: &str, default: &str| -> Result<u64, ConfigError> {
            get_or_default(key, default).parse().map_err(|_| {
                ConfigError::InvalidValue(key.to_string(), "not a valid u64".to_string())
            })
        };

        let parse_usize = |key: &str, default: &str| -> Result<usize, ConfigError> {
            get_or_default(key, default).parse().map_err(|_| {
                ConfigError::InvalidValue(key.to_string(), "not a valid usize".to_string())
            })
        };

        let bind_address = get_or_default("BIND_ADDRESS", "0.0.0.0:8080");
        let port = bind_address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let lease_seconds = parse_u64("CONCURRENCY_LEASE_SECONDS", "60")?.max(30);
        let renew_interval_seconds = parse_u64("CONCURRENCY_RENEW_INTERVAL_SECONDS", "30")?;

        Ok(Self {
            server: ServerConfig {
                bind_address,
                port,
                environment: Environment::from(get_or_default("ENVIRONMENT", "development")),
                rust_log: get_or_default("RUST_LOG", "relay_gateway=debug,tower_http=info"),
            },
            redis: RedisSettings {
                url: get_or_default("REDIS_URL", "redis://127.0.0.1:6379"),
                pool_size: parse_u32("REDIS_POOL_SIZE", "10")?,
                connection_timeout: parse_u64("REDIS_CONNECTION_TIMEOUT", "5")?,
                command_timeout: parse_u64("REDIS_COMMAND_TIMEOUT", "5")?,
                retry_attempts: parse_u32("REDIS_RETRY_ATTEMPTS", "3")?,
                retry_delay_ms: parse_u64("REDIS_RETRY_DELAY_MS", "100")?,
            },
            cache: CacheSettings {
                api_key_ttl: parse_u64("API_KEY_CACHE_TTL_SECS", "300")?,
                api_key_negative_ttl: parse_u64("API_KEY_NEGATIVE_CACHE_TTL_SECS", "60")?,
                runtime_config_ttl: parse_u64("RUNTIME_CONFIG_CACHE_TTL_SECS", "5")?,
            },
            concurrency: ConcurrencySettings {
                lease_seconds,
                renew_interval_seconds,
                max_lifetime_minutes: parse_u64("CONCURRENCY_MAX_LIFETIME_MINUTES", "60")?,
                cleanup_grace_seconds: parse_u64("CONCURRENCY_CLEANUP_GRACE_SECONDS", "15")?,
                cleanup_interval_seconds: parse_u64("CONCURRENCY_CLEANUP_INTERVAL_SECONDS", "60")?,
            },
            limits: LimitSettings {
                max_body_bytes: parse_usize("MAX_BODY_BYTES", "62914560")?, // 60 MiB
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::from("prod".to_string()), Environment::Production);
        assert_eq!(Environment::from("TEST".to_string()), Environment::Test);
        assert_eq!(
            Environment::from("whatever".to_string()),
            Environment::Development
        );
    }

    #[test]
    fn test_from_env_defaults() {
        let config = AppConfig::from_env().expect("defaults must load");

        assert_eq!(config.limits.max_body_bytes, 60 * 1024 * 1024);
        assert!(config.concurrency.lease_seconds >= 30);
        assert_eq!(config.cache.runtime_config_ttl, 5);
    }
}
