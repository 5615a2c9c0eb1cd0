use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://funquiz.db";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 14;
pub const MAX_SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 365;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Session cookies are only marked `Secure` when served in production.
    pub fn secure_cookies(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub session_ttl: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("APP_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        let session_ttl = session_ttl_from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            session_ttl,
        })
    }
}

fn session_ttl_from_env() -> Result<Duration, ConfigError> {
    let Ok(raw) = env::var("APP_SESSION_TTL_SECS") else {
        return Ok(Duration::from_secs(DEFAULT_SESSION_TTL_SECS));
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if (1..=MAX_SESSION_TTL_SECS).contains(&secs) => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidSessionTtl(raw)),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("APP_ENV must be one of 'development', 'production', or 'test' (got {0})")]
    InvalidEnvironment(String),
    #[error("invalid APP_BIND_ADDR value: {0}")]
    BindAddress(#[source] std::net::AddrParseError),
    #[error("APP_DATABASE_URL must not be empty")]
    EmptyDatabaseUrl,
    #[error("APP_SESSION_TTL_SECS must be between 1 and 31536000 seconds (got {0})")]
    InvalidSessionTtl(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    fn clear_env() {
        for key in [
            "APP_ENV",
            "APP_BIND_ADDR",
            "APP_DATABASE_URL",
            "APP_SESSION_TTL_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(
            config.session_ttl,
            Duration::from_secs(DEFAULT_SESSION_TTL_SECS)
        );
        assert!(!config.environment.secure_cookies());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("APP_DATABASE_URL", "sqlite:///var/lib/funquiz/db.sqlite");
        env::set_var("APP_SESSION_TTL_SECS", "3600");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.database_url, "sqlite:///var/lib/funquiz/db.sqlite");
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert!(config.environment.secure_cookies());

        clear_env();
    }

    #[test]
    fn rejects_zero_session_ttl() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_SESSION_TTL_SECS", "0");

        let err = AppConfig::from_env().expect_err("zero ttl should error");
        assert!(matches!(err, ConfigError::InvalidSessionTtl(value) if value == "0"));

        clear_env();
    }

    #[test]
    fn rejects_session_ttl_beyond_a_year() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_SESSION_TTL_SECS", "9000000000000000");

        let err = AppConfig::from_env().expect_err("huge ttl should error");
        assert!(matches!(err, ConfigError::InvalidSessionTtl(ref value) if value == "9000000000000000"));
        assert!(err.to_string().contains("31536000"));

        env::set_var("APP_SESSION_TTL_SECS", MAX_SESSION_TTL_SECS.to_string());
        let config = AppConfig::from_env().expect("one year is allowed");
        assert_eq!(config.session_ttl, Duration::from_secs(MAX_SESSION_TTL_SECS));

        clear_env();
    }

    #[test]
    fn rejects_empty_database_url() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_DATABASE_URL", "  ");

        let err = AppConfig::from_env().expect_err("empty url should error");
        assert!(matches!(err, ConfigError::EmptyDatabaseUrl));

        clear_env();
    }
}
