//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use axum::http::HeaderValue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// How incoming bearer tokens are checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JwtKey {
    /// RS256, verified with the issuer's public key.
    RsaPublicKeyPem(String),
    /// HS256, verified with a shared secret.
    Secret(String),
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub issuer: String,
    pub audience: String,
    pub key: JwtKey,
}

/// Periods of the four background workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerIntervals {
    pub text_generation: Duration,
    pub image_generation: Duration,
    pub image_fetch: Duration,
    pub story_request: Duration,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            text_generation: Duration::from_secs(60),
            image_generation: Duration::from_secs(60),
            image_fetch: Duration::from_secs(30),
            story_request: Duration::from_secs(300),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub openai_api_key: String,
    pub text_model: String,
    pub image_api_key: String,
    pub image_api_base_url: String,
    pub image_model_id: String,
    pub worker_intervals: WorkerIntervals,
    pub auto_story_requests: bool,
    pub gateway_timeout: Duration,
    pub identity: IdentityConfig,
    /// `None` allows any origin.
    pub cors_allowed_origin: Option<HeaderValue>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an explicit set of variables.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // --- Load Server and Database Settings ---
        let bind_address_str = or_default("BIND_ADDRESS", "0.0.0.0:8000");
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let log_level_str = or_default("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Gateway Settings ---
        let openai_api_key = required("OPENAI_API_KEY")?;
        let text_model = or_default("TEXT_MODEL", "gpt-4o-mini");
        let image_api_key = required("IMAGE_API_KEY")?;
        let image_api_base_url = or_default("IMAGE_API_BASE_URL", "https://stablediffusionapi.com")
            .trim_end_matches('/')
            .to_string();
        let image_model_id = or_default("IMAGE_MODEL_ID", "midjourney");

        // --- Load Worker Settings ---
        let defaults = WorkerIntervals::default();
        let seconds = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                    _ => Err(ConfigError::InvalidValue(
                        key.to_string(),
                        format!("'{}' is not a positive number of seconds", raw),
                    )),
                },
            }
        };
        let worker_intervals = WorkerIntervals {
            text_generation: seconds("TEXT_WORKER_INTERVAL_SECS", defaults.text_generation)?,
            image_generation: seconds("IMAGE_WORKER_INTERVAL_SECS", defaults.image_generation)?,
            image_fetch: seconds("IMAGE_FETCH_WORKER_INTERVAL_SECS", defaults.image_fetch)?,
            story_request: seconds("STORY_REQUEST_WORKER_INTERVAL_SECS", defaults.story_request)?,
        };
        let gateway_timeout = seconds("GATEWAY_TIMEOUT_SECS", Duration::from_secs(60))?;

        let auto_story_requests_str = or_default("AUTO_STORY_REQUESTS", "true");
        let auto_story_requests = auto_story_requests_str.parse::<bool>().map_err(|_| {
            ConfigError::InvalidValue(
                "AUTO_STORY_REQUESTS".to_string(),
                format!("'{}' is not true or false", auto_story_requests_str),
            )
        })?;

        // --- Load Identity Settings ---
        let key = match (lookup("JWT_PUBLIC_KEY_PEM"), lookup("JWT_SECRET")) {
            (Some(pem), _) if !pem.trim().is_empty() => JwtKey::RsaPublicKeyPem(pem),
            (_, Some(secret)) if !secret.is_empty() => JwtKey::Secret(secret),
            _ => return Err(ConfigError::MissingVar("JWT_PUBLIC_KEY_PEM or JWT_SECRET".to_string())),
        };
        let identity = IdentityConfig {
            issuer: required("JWT_ISSUER")?,
            audience: required("JWT_AUDIENCE")?,
            key,
        };

        let cors_allowed_origin_str = or_default("CORS_ALLOWED_ORIGIN", "*");
        let cors_allowed_origin = match cors_allowed_origin_str.trim() {
            "*" => None,
            origin => Some(HeaderValue::from_str(origin).map_err(|e| {
                ConfigError::InvalidValue("CORS_ALLOWED_ORIGIN".to_string(), e.to_string())
            })?),
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            text_model,
            image_api_key,
            image_api_base_url,
            image_model_id,
            worker_intervals,
            auto_story_requests,
            gateway_timeout,
            identity,
            cors_allowed_origin,
        })
    }
}
