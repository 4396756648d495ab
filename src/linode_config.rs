//! Linode configuration.
//!
//! Unique responsibility: load client and reconciler settings from environment variables.
//!
//! In local dev, `from_env()` also attempts to load `.env` from the current directory.
//! A missing `.env` does not fail.

use std::{env, time::Duration};

use thiserror::Error;

/// Default Linode API v4 base URL.
pub const DEFAULT_API_URL: &str = "https://api.linode.com/v4";

/// Configuration for the Linode REST client.
#[derive(Clone, Debug)]
pub struct LinodeClientConfig {
    /// Linode personal access token.
    /// Env: `LINODE_TOKEN` (required)
    pub token: String,

    /// REST API URL for Linode.
    /// Env: `LINODE_URL` (default: "<https://api.linode.com/v4>")
    pub api_url: String,

    /// HTTP request timeout in milliseconds.
    /// Env: `LINODE_HTTP_TIMEOUT_MS` (default: 30000)
    pub timeout_ms: u64,

    /// User agent for HTTP requests.
    /// Env: `LINODE_USER_AGENT` (default: "linode-lifecycle/0.1")
    pub user_agent: String,
}

impl LinodeClientConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            token: must_env("LINODE_TOKEN")?,
            api_url: env::var("LINODE_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            timeout_ms: parse_u64_env("LINODE_HTTP_TIMEOUT_MS", 30_000)?,
            user_agent: env::var("LINODE_USER_AGENT")
                .unwrap_or_else(|_| "linode-lifecycle/0.1".to_string()),
        })
    }
}

/// Configuration for the reconciler's readiness waits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Poll interval for readiness checks in milliseconds.
    /// Env: `LINODE_POLL_INTERVAL_MS` (default: 3000)
    pub poll_interval_ms: u64,

    /// Maximum time a create may spend waiting on readiness, in milliseconds.
    /// Env: `LINODE_CREATE_TIMEOUT_MS` (default: 1200000 = 20 minutes)
    pub create_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            create_timeout_ms: 1_200_000,
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not an unsigned integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            poll_interval_ms: parse_u64_env("LINODE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            create_timeout_ms: parse_u64_env(
                "LINODE_CREATE_TIMEOUT_MS",
                defaults.create_timeout_ms,
            )?,
        })
    }

    /// Poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Create timeout as a `Duration`.
    #[must_use]
    pub const fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("missing required env var: {0}")]
    MissingEnv(&'static str),
    /// Invalid environment variable value.
    #[error("invalid env var {key}={value:?}: {reason}")]
    InvalidEnv {
        /// The environment variable key.
        key: &'static str,
        /// The environment variable value.
        value: String,
        /// The reason for invalidity.
        reason: &'static str,
    },
}

#[inline]
fn must_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(key))
}

#[inline]
fn parse_u64_env(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                key,
                value: v,
                reason: "expected an unsigned integer",
            })
        },
    )
}
