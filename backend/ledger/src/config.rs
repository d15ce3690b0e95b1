//! Application configuration loaded from environment variables.

use crate::errors::{LedgerError, Result};
use crate::txn::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Retry budget for optimistic transactions
    pub retry: RetryPolicy,
    /// Where confirmation messages are POSTed; logged only when unset
    pub notify_webhook_url: Option<String>,
    /// HTTP timeout for a single notification delivery
    pub notify_timeout_secs: u64,
    /// User granted the admin role at start-up
    pub bootstrap_admin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup so tests don't have to
    /// mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RetryPolicy::default();
        let config = Config {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./campaign_ledger.db".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 3002)?,
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, "TXN_MAX_ATTEMPTS", defaults.max_attempts)?,
                base_backoff_ms: parse_or(&lookup, "TXN_BASE_BACKOFF_MS", defaults.base_backoff_ms)?,
                max_backoff_ms: parse_or(&lookup, "TXN_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            },
            notify_webhook_url: lookup("NOTIFY_WEBHOOK_URL").filter(|url| !url.trim().is_empty()),
            notify_timeout_secs: parse_or(&lookup, "NOTIFY_TIMEOUT_SECS", 10)?,
            bootstrap_admin: lookup("BOOTSTRAP_ADMIN_ID").filter(|id| !id.trim().is_empty()),
        };

        if config.retry.max_attempts == 0 {
            return Err(LedgerError::Config(
                "TXN_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| LedgerError::Config(format!("Invalid {key}: {raw}"))),
        None => Ok(default),
    }
}
