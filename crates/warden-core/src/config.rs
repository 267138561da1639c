use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::duration::parse_duration;
use crate::error::ControlError;

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

/// Daemon configuration.
///
/// Loaded from a YAML file (unknown keys are rejected) with environment
/// overrides for the defaults. Durations in the file use the wire notation
/// (`200`, `30d`, `1h30m`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// Timezone used for cron evaluation.
    pub timezone: String,

    /// Max records per log/metric write batch.
    pub log_flush_batch: usize,

    /// Max delay before a batch is flushed, in milliseconds.
    pub log_flush_interval_ms: u64,

    /// In-memory backpressure bound per workload for log records.
    pub log_queue_max: usize,

    /// Resource sampling cadence while a workload runs, in milliseconds.
    pub metric_sample_interval_ms: u64,

    /// Grace period for `stop` when the caller does not supply one.
    pub default_stop_grace_ms: u64,

    /// Coordinator-to-supervisor reply timeout, in milliseconds.
    pub command_timeout_ms: u64,

    /// Log/metric retention ceiling by age (wire duration notation).
    #[serde(with = "crate::duration::serde_duration")]
    pub retention_max_age: Duration,

    /// Per-workload log/metric record cap.
    pub retention_max_records: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let retention_max_age = std::env::var("WARDEN_RETENTION_MAX_AGE")
            .ok()
            .and_then(|v| parse_duration(&v).ok())
            .unwrap_or(Duration::from_secs(30 * 86400));

        Self {
            timezone: std::env::var("WARDEN_TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            log_flush_batch: env_parse("WARDEN_LOG_FLUSH_BATCH", 100),
            log_flush_interval_ms: env_parse("WARDEN_LOG_FLUSH_INTERVAL_MS", 200),
            log_queue_max: env_parse("WARDEN_LOG_QUEUE_MAX", 10_000),
            metric_sample_interval_ms: env_parse("WARDEN_METRIC_SAMPLE_INTERVAL_MS", 5_000),
            default_stop_grace_ms: env_parse("WARDEN_DEFAULT_STOP_GRACE_MS", 10_000),
            command_timeout_ms: env_parse("WARDEN_COMMAND_TIMEOUT_MS", 5_000),
            retention_max_age,
            retention_max_records: env_parse("WARDEN_RETENTION_MAX_RECORDS", 1_000_000),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a YAML file, rejecting unknown keys.
    pub fn from_file(path: &Path) -> Result<Self, ControlError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ControlError::InvalidField {
            field: "config".to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: DaemonConfig =
            serde_yaml::from_str(&raw).map_err(|e| ControlError::InvalidField {
                field: "config".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        self.tz()?;
        if self.log_flush_batch == 0 {
            return Err(ControlError::InvalidField {
                field: "log_flush_batch".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.log_queue_max == 0 {
            return Err(ControlError::InvalidField {
                field: "log_queue_max".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves the configured timezone name.
    pub fn tz(&self) -> Result<chrono_tz::Tz, ControlError> {
        self.timezone
            .parse()
            .map_err(|_| ControlError::InvalidField {
                field: "timezone".to_string(),
                reason: format!("unknown timezone '{}'", self.timezone),
            })
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn metric_sample_interval(&self) -> Duration {
        Duration::from_millis(self.metric_sample_interval_ms)
    }

    pub fn default_stop_grace(&self) -> Duration {
        Duration::from_millis(self.default_stop_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
