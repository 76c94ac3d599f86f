//! Configuration management for the agent.

use crate::alerts::DispatcherConfig;
use crate::identity::Credential;
use crate::sync::WorkerConfig;
use sentinel_engine::{BackoffPolicy, DeviceId, EmergencyContact, EvaluatorConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API host address
    pub host: String,
    /// Control API port
    pub port: u16,
    /// SQLite connection URL for the local event store
    pub database_url: String,
    /// Base URL of the remote store
    pub remote_url: String,
    pub principal_id: String,
    pub auth_token: Option<String>,
    /// Devices this agent syncs for
    pub device_ids: Vec<DeviceId>,
    /// JSON array of geofences
    pub geofences_path: Option<PathBuf>,

    pub sync_interval: Duration,
    pub push_batch_size: usize,
    pub pull_page_size: u32,
    pub request_timeout: Duration,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub probe_interval: Duration,

    pub accuracy_threshold_m: f64,
    pub debounce_ms: u64,

    pub dedup_bucket_ms: u64,
    pub suppression_window: Duration,
    pub alert_max_attempts: u32,
    pub alert_max_age: Duration,

    pub retention: Duration,
    pub prune_interval: Duration,
    /// Record quota; appends fail with StorageFull once reached
    pub max_local_records: Option<u64>,

    pub notify_webhook_url: Option<String>,
    pub summary_url: Option<String>,
    pub emergency_contact: Option<EmergencyContact>,
}

impl Config {
    /// Configuration with defaults for everything but the required values.
    pub fn new(
        database_url: impl Into<String>,
        remote_url: impl Into<String>,
        device_ids: Vec<DeviceId>,
    ) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4100,
            database_url: database_url.into(),
            remote_url: remote_url.into(),
            principal_id: "local".to_string(),
            auth_token: None,
            device_ids,
            geofences_path: None,
            sync_interval: Duration::from_secs(60),
            push_batch_size: 50,
            pull_page_size: 200,
            request_timeout: Duration::from_millis(10_000),
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            probe_interval: Duration::from_millis(15_000),
            accuracy_threshold_m: 50.0,
            debounce_ms: 30_000,
            dedup_bucket_ms: 60_000,
            suppression_window: Duration::from_secs(600),
            alert_max_attempts: 5,
            alert_max_age: Duration::from_secs(1_800),
            retention: Duration::from_secs(7 * 24 * 3_600),
            prune_interval: Duration::from_secs(3_600),
            max_local_records: None,
            notify_webhook_url: None,
            summary_url: None,
            emergency_contact: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let remote_url = env::var("REMOTE_URL").map_err(|_| ConfigError::Missing("REMOTE_URL"))?;

        let device_ids: Vec<DeviceId> = env::var("DEVICE_IDS")
            .map_err(|_| ConfigError::Missing("DEVICE_IDS"))?
            .split(',')
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if device_ids.is_empty() {
            return Err(ConfigError::Missing("DEVICE_IDS"));
        }

        let mut config = Self::new(database_url, remote_url, device_ids);

        config.host = env::var("HOST").unwrap_or(config.host);
        config.port = parse("PORT", config.port)?;
        config.principal_id = env::var("PRINCIPAL_ID").unwrap_or(config.principal_id);
        config.auth_token = optional("AUTH_TOKEN");
        config.geofences_path = optional("GEOFENCES_PATH").map(PathBuf::from);

        config.sync_interval = Duration::from_secs(parse("SYNC_INTERVAL_SECS", 60)?);
        config.push_batch_size = parse("PUSH_BATCH_SIZE", config.push_batch_size)?;
        config.pull_page_size = parse("PULL_PAGE_SIZE", config.pull_page_size)?;
        config.request_timeout = Duration::from_millis(parse("REQUEST_TIMEOUT_MS", 10_000)?);
        config.backoff_base_ms = parse("BACKOFF_BASE_MS", config.backoff_base_ms)?;
        config.backoff_max_ms = parse("BACKOFF_MAX_MS", config.backoff_max_ms)?;
        config.probe_interval = Duration::from_millis(parse("PROBE_INTERVAL_MS", 15_000)?);

        config.accuracy_threshold_m = parse("ACCURACY_THRESHOLD_M", config.accuracy_threshold_m)?;
        config.debounce_ms = parse("DEBOUNCE_MS", config.debounce_ms)?;

        config.dedup_bucket_ms = parse("DEDUP_BUCKET_MS", config.dedup_bucket_ms)?;
        config.suppression_window = Duration::from_secs(parse("SUPPRESSION_WINDOW_SECS", 600)?);
        config.alert_max_attempts = parse("ALERT_MAX_ATTEMPTS", config.alert_max_attempts)?;
        config.alert_max_age = Duration::from_secs(parse("ALERT_MAX_AGE_SECS", 1_800)?);

        config.retention = Duration::from_secs(parse("RETENTION_SECS", 7 * 24 * 3_600)?);
        config.prune_interval = Duration::from_secs(parse("PRUNE_INTERVAL_SECS", 3_600)?);
        config.max_local_records = optional("MAX_LOCAL_RECORDS")
            .map(|v| {
                v.parse().map_err(|_| ConfigError::Invalid {
                    name: "MAX_LOCAL_RECORDS",
                    value: v,
                })
            })
            .transpose()?;

        config.notify_webhook_url = optional("NOTIFY_WEBHOOK_URL");
        config.summary_url = optional("SUMMARY_URL");
        config.emergency_contact = match (
            optional("EMERGENCY_CONTACT_NAME"),
            optional("EMERGENCY_CONTACT_PHONE"),
        ) {
            (Some(name), Some(phone)) => Some(EmergencyContact { name, phone }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteContact),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.push_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "PUSH_BATCH_SIZE",
                value: "0".into(),
            });
        }
        if self.pull_page_size == 0 {
            return Err(ConfigError::Invalid {
                name: "PULL_PAGE_SIZE",
                value: "0".into(),
            });
        }
        if self.alert_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "ALERT_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        Ok(())
    }

    pub fn evaluator(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            accuracy_threshold_m: self.accuracy_threshold_m,
            debounce_ms: self.debounce_ms,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base_ms, self.backoff_max_ms)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            interval: self.sync_interval,
            push_batch_size: self.push_batch_size,
            pull_page_size: self.pull_page_size,
            request_timeout: self.request_timeout,
            backoff: self.backoff(),
            probe_interval: self.probe_interval,
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            dedup_bucket_ms: self.dedup_bucket_ms,
            suppression_ms: self.suppression_window.as_millis() as u64,
            max_age_ms: self.alert_max_age.as_millis() as u64,
            max_attempts: self.alert_max_attempts,
            retry: self.backoff(),
            delivery_timeout: self.request_timeout,
            summary_timeout: self.request_timeout,
            emergency_contact: self.emergency_contact.clone(),
            ..DispatcherConfig::default()
        }
    }

    /// Initial credential, if a token was configured.
    pub fn credential(&self) -> Option<Credential> {
        self.auth_token
            .as_ref()
            .map(|token| Credential::new(self.principal_id.clone(), token.clone()))
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("EMERGENCY_CONTACT_NAME and EMERGENCY_CONTACT_PHONE must be set together")]
    IncompleteContact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::new("sqlite::memory:", "http://remote", vec!["phone".into()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.evaluator().debounce_ms, 30_000);
        assert_eq!(config.dispatcher().suppression_ms, 600_000);
        assert_eq!(config.worker().push_batch_size, 50);
        assert!(config.credential().is_none());
    }

    #[test]
    fn zero_batch_rejected() {
        let mut config = Config::new("sqlite::memory:", "http://remote", vec!["phone".into()]);
        config.push_batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "PUSH_BATCH_SIZE", .. })
        ));
    }
}
