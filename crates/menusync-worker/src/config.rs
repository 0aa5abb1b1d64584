// Application configuration
// Decision: environment driven, `.env` is loaded by main before from_env runs

use std::time::Duration;

use menusync_queue::{ConsumerConfig, RetryPolicy, DEFAULT_VISIBILITY_TIMEOUT};
use thiserror::Error;

use crate::services::DEFAULT_STORE_TIMEOUT;
use crate::sheets::DEFAULT_SHEETS_BASE_URL;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Time budget for each store operation and transaction
    pub store_timeout: Duration,
    pub max_retries: u32,
    /// Backoff before retry n is `retry_unit * 2^n`
    pub retry_unit: Duration,
    pub prefetch_count: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub sheets_api_key: Option<String>,
    pub sheets_base_url: String,
}

impl AppConfig {
    /// Create configuration from environment variables
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (default 20)
    /// - `STORE_TIMEOUT_SECS` (default 10)
    /// - `QUEUE_MAX_RETRIES` (default 3)
    /// - `QUEUE_RETRY_UNIT_MS` (default 1000)
    /// - `QUEUE_PREFETCH_COUNT` (default 10)
    /// - `QUEUE_POLL_INTERVAL_MS` (default 250)
    /// - `QUEUE_VISIBILITY_TIMEOUT_SECS` (default 300)
    /// - `GOOGLE_SHEETS_API_KEY` (optional)
    /// - `GOOGLE_SHEETS_BASE_URL` (default `https://sheets.googleapis.com`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 20)?,
            store_timeout: Duration::from_secs(parse_or(
                &var,
                "STORE_TIMEOUT_SECS",
                DEFAULT_STORE_TIMEOUT.as_secs(),
            )?),
            max_retries: parse_or(&var, "QUEUE_MAX_RETRIES", 3)?,
            retry_unit: Duration::from_millis(parse_or(&var, "QUEUE_RETRY_UNIT_MS", 1000)?),
            prefetch_count: parse_or(&var, "QUEUE_PREFETCH_COUNT", 10)?,
            poll_interval: Duration::from_millis(parse_or(&var, "QUEUE_POLL_INTERVAL_MS", 250)?),
            visibility_timeout: Duration::from_secs(parse_or(
                &var,
                "QUEUE_VISIBILITY_TIMEOUT_SECS",
                DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
            )?),
            sheets_api_key: var("GOOGLE_SHEETS_API_KEY"),
            sheets_base_url: var("GOOGLE_SHEETS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SHEETS_BASE_URL.to_string()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_retries(self.max_retries)
            .with_base_delay(self.retry_unit)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
            .with_retry(self.retry_policy())
            .with_prefetch_count(self.prefetch_count)
            .with_poll_interval(self.poll_interval)
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}
