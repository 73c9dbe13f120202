//! Configuration loading and representation.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `REGARDS_JOBS_POOL_SIZE` | `10` | Job slots shared by all tenants |
//! | `REGARDS_JOBS_SCAN_DELAY_MS` | `1000` | Idle wait between job scans |
//! | `REGARDS_LOCK_EXPIRATION_SECS` | `60` | Lifetime of a job lock |
//! | `REGARDS_LOCK_RETRY_MS` | `500` | Poll interval of blocking lock waits |
//! | `REGARDS_TENANTS` | `default` | Comma-separated tenant roster |
//! | `DATABASE_URL` | unset | Postgres lock store; in-memory when unset |

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Serializer};

use regards_core::TenantName;

use crate::jobs::JobPullerConfig;
use crate::jobs::puller::DEFAULT_CAPACITY;

pub const POOL_SIZE: &str = "REGARDS_JOBS_POOL_SIZE";
pub const SCAN_DELAY_MS: &str = "REGARDS_JOBS_SCAN_DELAY_MS";
pub const LOCK_EXPIRATION_SECS: &str = "REGARDS_LOCK_EXPIRATION_SECS";
pub const LOCK_RETRY_MS: &str = "REGARDS_LOCK_RETRY_MS";
pub const TENANTS: &str = "REGARDS_TENANTS";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Scheduler process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    pub pool_size: NonZeroUsize,
    #[serde(rename = "scan_delay_ms", serialize_with = "millis")]
    pub scan_delay: Duration,
    pub lock_expiration_secs: u64,
    #[serde(rename = "lock_retry_ms", serialize_with = "millis")]
    pub lock_retry_interval: Duration,
    pub tenants: Vec<TenantName>,
    /// Never logged: may carry credentials.
    #[serde(skip)]
    pub database_url: Option<String>,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pool_size = parse_or(&lookup, POOL_SIZE, DEFAULT_CAPACITY)?;
        let scan_delay_ms: u64 = parse_positive(&lookup, SCAN_DELAY_MS, 1000)?;
        let lock_expiration_secs: u64 = parse_positive(&lookup, LOCK_EXPIRATION_SECS, 60)?;
        let lock_retry_ms: u64 = parse_positive(&lookup, LOCK_RETRY_MS, 500)?;
        let tenants = parse_tenants(lookup(TENANTS).as_deref().unwrap_or("default"))?;
        let database_url = lookup(DATABASE_URL).filter(|url| !url.trim().is_empty());

        Ok(Self {
            pool_size,
            scan_delay: Duration::from_millis(scan_delay_ms),
            lock_expiration_secs,
            lock_retry_interval: Duration::from_millis(lock_retry_ms),
            tenants,
            database_url,
        })
    }
}

impl From<&SchedulerConfig> for JobPullerConfig {
    fn from(config: &SchedulerConfig) -> Self {
        JobPullerConfig::default()
            .with_capacity(config.pool_size)
            .with_scan_delay(config.scan_delay)
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Comma-separated roster. Blank entries are ignored, duplicates keep their first position.
fn parse_tenants(raw: &str) -> Result<Vec<TenantName>, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: TENANTS,
        value: raw.to_string(),
    };

    let mut tenants: Vec<TenantName> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let tenant = TenantName::new(part).map_err(|_| invalid())?;
        if !tenants.contains(&tenant) {
            tenants.push(tenant);
        }
    }

    if tenants.is_empty() {
        return Err(invalid());
    }
    Ok(tenants)
}

fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<SchedulerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.pool_size.get(), 10);
        assert_eq!(config.scan_delay, Duration::from_secs(1));
        assert_eq!(config.lock_expiration_secs, 60);
        assert_eq!(config.lock_retry_interval, Duration::from_millis(500));
        assert_eq!(config.tenants, vec![TenantName::new("default").unwrap()]);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            (POOL_SIZE, "4"),
            (SCAN_DELAY_MS, "250"),
            (TENANTS, " project1, project2 ,,project1"),
            (DATABASE_URL, "postgres://localhost/regards"),
        ])
        .unwrap();

        assert_eq!(config.pool_size.get(), 4);
        assert_eq!(config.scan_delay, Duration::from_millis(250));
        assert_eq!(
            config.tenants,
            vec![
                TenantName::new("project1").unwrap(),
                TenantName::new("project2").unwrap()
            ]
        );
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/regards"));

        let puller = JobPullerConfig::from(&config);
        assert_eq!(puller.capacity.get(), 4);
        assert_eq!(puller.scan_delay, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_name_the_key() {
        assert_eq!(
            load(&[(POOL_SIZE, "0")]),
            Err(ConfigError::Invalid {
                key: POOL_SIZE,
                value: "0".to_string()
            })
        );
        assert!(matches!(
            load(&[(SCAN_DELAY_MS, "soon")]),
            Err(ConfigError::Invalid { key: SCAN_DELAY_MS, .. })
        ));
        assert!(matches!(
            load(&[(LOCK_EXPIRATION_SECS, "0")]),
            Err(ConfigError::Invalid { key: LOCK_EXPIRATION_SECS, .. })
        ));
        assert!(matches!(
            load(&[(TENANTS, " , ")]),
            Err(ConfigError::Invalid { key: TENANTS, .. })
        ));
    }

    #[test]
    fn database_url_is_not_serialized() {
        let config = load(&[(DATABASE_URL, "postgres://user:secret@db/regards")]).unwrap();
        let json = serde_json::to_value(&config).unwrap();

        assert!(json.get("database_url").is_none());
        assert_eq!(json["scan_delay_ms"], 1000);
        assert_eq!(json["tenants"], serde_json::json!(["default"]));
    }
}
