//! Process configuration read from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::database::models::StatusFilter;
use crate::database::repositories::{ClaimStrategy, LockSettings};
use crate::worker::WorkerConfig;
use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:credential-queue.db?mode=rwc";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_CLAIM_PAGE_SIZE: i64 = 100;
const DEFAULT_CLAIM_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_LOCK_LEASE_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_CLAIM_STATUS_CODES: &str = "NEW,REPROCESS";
const DEFAULT_REPROCESS_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    /// Overrides the default log filter when set.
    pub log_filter: Option<String>,
    pub claim_page_size: i64,
    pub claim_poll_interval: Duration,
    pub lock_timeout: Duration,
    pub lock_lease: Duration,
    pub claim_strategy: ClaimStrategy,
    pub claim_status_codes: Vec<String>,
    pub reprocess_status_codes: Vec<String>,
    pub reprocess_interval: Duration,
    pub object_store_root: Option<PathBuf>,
    /// Hex-encoded 32-byte key.
    pub object_store_master_key: Option<String>,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, treating blank values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let claim_page_size: i64 = parse_or(&get, "CLAIM_PAGE_SIZE", DEFAULT_CLAIM_PAGE_SIZE)?;
        if claim_page_size <= 0 {
            return Err(Error::config("CLAIM_PAGE_SIZE must be positive"));
        }

        let lock_timeout =
            Duration::from_millis(parse_or(&get, "LOCK_TIMEOUT_MS", DEFAULT_LOCK_TIMEOUT_MS)?);
        let lock_lease =
            Duration::from_millis(parse_or(&get, "LOCK_LEASE_MS", DEFAULT_LOCK_LEASE_MS)?);
        if lock_lease <= lock_timeout {
            return Err(Error::config("LOCK_LEASE_MS must exceed LOCK_TIMEOUT_MS"));
        }

        let claim_strategy = match get("CLAIM_STRATEGY").as_deref().map(str::trim) {
            None | Some("skip_locked") => ClaimStrategy::SkipLocked,
            Some("lock_wait") => ClaimStrategy::lock_wait(lock_timeout),
            Some(other) => {
                return Err(Error::config(format!(
                    "CLAIM_STRATEGY must be skip_locked or lock_wait, got {other:?}"
                )));
            }
        };

        let claim_status_codes = split_codes(
            get("CLAIM_STATUS_CODES")
                .as_deref()
                .unwrap_or(DEFAULT_CLAIM_STATUS_CODES),
        );
        if claim_status_codes.is_empty() {
            return Err(Error::config("CLAIM_STATUS_CODES must name at least one status"));
        }

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: PathBuf::from(get("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
            log_filter: get("LOG_FILTER"),
            claim_page_size,
            claim_poll_interval: Duration::from_millis(parse_or(
                &get,
                "CLAIM_POLL_INTERVAL_MS",
                DEFAULT_CLAIM_POLL_INTERVAL_MS,
            )?),
            lock_timeout,
            lock_lease,
            claim_strategy,
            claim_status_codes,
            reprocess_status_codes: get("REPROCESS_STATUS_CODES")
                .map(|v| split_codes(&v))
                .unwrap_or_default(),
            reprocess_interval: Duration::from_secs(parse_or(
                &get,
                "REPROCESS_INTERVAL_SECS",
                DEFAULT_REPROCESS_INTERVAL_SECS,
            )?),
            object_store_root: get("OBJECT_STORE_ROOT").map(PathBuf::from),
            object_store_master_key: get("OBJECT_STORE_MASTER_KEY"),
        })
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            lock_timeout: self.lock_timeout,
            lease: self.lock_lease,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            page_size: self.claim_page_size,
            poll_interval: self.claim_poll_interval,
            strategy: self.claim_strategy,
            claim_filter: StatusFilter::from(self.claim_status_codes.clone()),
            reprocess_statuses: self.reprocess_status_codes.clone(),
            reprocess_interval: self.reprocess_interval,
            ..WorkerConfig::default()
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

fn split_codes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.claim_page_size, 100);
        assert_eq!(config.claim_strategy, ClaimStrategy::SkipLocked);
        assert_eq!(config.claim_status_codes, vec!["NEW", "REPROCESS"]);
        assert!(config.reprocess_status_codes.is_empty());
        assert!(config.object_store_root.is_none());
        assert_eq!(config.lock_settings(), LockSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("CLAIM_PAGE_SIZE", "25"),
            ("CLAIM_STRATEGY", "lock_wait"),
            ("LOCK_TIMEOUT_MS", "250"),
            ("CLAIM_STATUS_CODES", "new, reprocess ,"),
            ("REPROCESS_STATUS_CODES", "FAILED,STALE"),
            ("OBJECT_STORE_ROOT", "/var/lib/objects"),
            ("LOG_FILTER", ""),
        ])
        .unwrap();

        assert_eq!(config.claim_page_size, 25);
        assert_eq!(
            config.claim_strategy,
            ClaimStrategy::lock_wait(Duration::from_millis(250))
        );
        assert_eq!(config.claim_status_codes, vec!["NEW", "REPROCESS"]);
        assert_eq!(config.reprocess_status_codes, vec!["FAILED", "STALE"]);
        assert_eq!(
            config.object_store_root.as_deref(),
            Some(std::path::Path::new("/var/lib/objects"))
        );
        assert_eq!(config.log_filter, None);

        let worker = config.worker_config();
        assert_eq!(worker.page_size, 25);
        assert_eq!(worker.claim_filter.codes(), vec!["NEW", "REPROCESS"]);
    }

    #[test]
    fn test_invalid_values() {
        for pairs in [
            &[("CLAIM_PAGE_SIZE", "ten")][..],
            &[("CLAIM_PAGE_SIZE", "0")][..],
            &[("CLAIM_STRATEGY", "fifo")][..],
            &[("CLAIM_STATUS_CODES", " , ")][..],
            &[("LOCK_TIMEOUT_MS", "5000"), ("LOCK_LEASE_MS", "1000")][..],
        ] {
            assert!(
                matches!(config_from(pairs), Err(Error::Configuration(_))),
                "{pairs:?}"
            );
        }
    }
}
