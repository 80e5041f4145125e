//! Alerting configuration

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::{Severity, SuppressionSettings};
use crate::notify::{DeliverySettings, RetryPolicy};

/// Slack on top of the worst-case delivery time when stopping the scheduler
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Engine, suppression, delivery and scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub evaluation_interval_seconds: u64,
    pub escalation_check_interval_seconds: u64,
    pub max_alert_history_size: usize,
    /// Rate cap per rule over `rate_window_seconds`
    pub max_alerts_per_minute: usize,
    /// Channels used by rules that name none
    pub default_channels: Vec<String>,
    pub notification_timeout_seconds: u64,
    pub enable_auto_suppression: bool,
    /// Start with maintenance suppression enabled
    pub maintenance_mode: bool,
    /// Alerts at or above this severity bypass maintenance suppression
    pub emergency_severity_threshold: Severity,
    pub metrics_history_capacity: usize,
    pub burst_threshold: usize,
    pub burst_window_seconds: u64,
    pub suppression_duration_seconds: u64,
    pub rate_window_seconds: u64,
    pub degraded_after_failures: u32,
    /// Total send attempts per channel; 1 disables retries
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Grace period for scheduler shutdown; never shorter than one full
    /// delivery so in-flight sends are recorded
    pub stop_timeout_seconds: u64,
    pub suppression_sweep_interval_seconds: u64,
    /// Load the built-in pipeline rules at startup
    pub builtin_rules: bool,
    /// File for the JSON-lines channel; the channel is registered only when set
    pub alert_log_path: Option<PathBuf>,
    /// Endpoint for the webhook channel; registered only when set
    pub webhook_url: Option<String>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 30,
            escalation_check_interval_seconds: 60,
            max_alert_history_size: 1000,
            max_alerts_per_minute: 10,
            default_channels: vec!["console".to_string(), "log".to_string()],
            notification_timeout_seconds: 10,
            enable_auto_suppression: true,
            maintenance_mode: false,
            emergency_severity_threshold: Severity::Critical,
            metrics_history_capacity: 1000,
            burst_threshold: 5,
            burst_window_seconds: 300,
            suppression_duration_seconds: 1800,
            rate_window_seconds: 60,
            degraded_after_failures: 3,
            retry_max_attempts: 1,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5_000,
            stop_timeout_seconds: 5,
            suppression_sweep_interval_seconds: 60,
            builtin_rules: true,
            alert_log_path: None,
            webhook_url: None,
        }
    }
}

impl AlertingConfig {
    /// Defaults overridden by `PIPEWATCH_*` environment variables.
    ///
    /// PIPEWATCH_EVALUATION_INTERVAL_SECONDS=30
    /// PIPEWATCH_DEFAULT_CHANNELS=console,log
    /// PIPEWATCH_MAINTENANCE_MODE=true
    /// PIPEWATCH_EMERGENCY_SEVERITY_THRESHOLD=critical
    /// PIPEWATCH_ALERT_LOG_PATH=/var/log/pipewatch/alerts.jsonl
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Load from a JSON document; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup, then validate
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        env.set("EVALUATION_INTERVAL_SECONDS", &mut self.evaluation_interval_seconds)?;
        env.set("ESCALATION_CHECK_INTERVAL_SECONDS", &mut self.escalation_check_interval_seconds)?;
        env.set("MAX_ALERT_HISTORY_SIZE", &mut self.max_alert_history_size)?;
        env.set("MAX_ALERTS_PER_MINUTE", &mut self.max_alerts_per_minute)?;
        env.set("NOTIFICATION_TIMEOUT_SECONDS", &mut self.notification_timeout_seconds)?;
        env.set_bool("ENABLE_AUTO_SUPPRESSION", &mut self.enable_auto_suppression)?;
        env.set_bool("MAINTENANCE_MODE", &mut self.maintenance_mode)?;
        env.set("EMERGENCY_SEVERITY_THRESHOLD", &mut self.emergency_severity_threshold)?;
        env.set("METRICS_HISTORY_CAPACITY", &mut self.metrics_history_capacity)?;
        env.set("BURST_THRESHOLD", &mut self.burst_threshold)?;
        env.set("BURST_WINDOW_SECONDS", &mut self.burst_window_seconds)?;
        env.set("SUPPRESSION_DURATION_SECONDS", &mut self.suppression_duration_seconds)?;
        env.set("RATE_WINDOW_SECONDS", &mut self.rate_window_seconds)?;
        env.set("DEGRADED_AFTER_FAILURES", &mut self.degraded_after_failures)?;
        env.set("RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts)?;
        env.set("RETRY_INITIAL_BACKOFF_MS", &mut self.retry_initial_backoff_ms)?;
        env.set("RETRY_MAX_BACKOFF_MS", &mut self.retry_max_backoff_ms)?;
        env.set("STOP_TIMEOUT_SECONDS", &mut self.stop_timeout_seconds)?;
        env.set("SUPPRESSION_SWEEP_INTERVAL_SECONDS", &mut self.suppression_sweep_interval_seconds)?;
        env.set_bool("BUILTIN_RULES", &mut self.builtin_rules)?;

        if let Some(channels) = env.get("DEFAULT_CHANNELS") {
            self.default_channels = channels
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = env.get("ALERT_LOG_PATH") {
            self.alert_log_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env.get("WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("evaluation_interval_seconds", self.evaluation_interval_seconds),
            ("escalation_check_interval_seconds", self.escalation_check_interval_seconds),
            ("max_alert_history_size", self.max_alert_history_size as u64),
            ("max_alerts_per_minute", self.max_alerts_per_minute as u64),
            ("notification_timeout_seconds", self.notification_timeout_seconds),
            ("metrics_history_capacity", self.metrics_history_capacity as u64),
            ("burst_threshold", self.burst_threshold as u64),
            ("burst_window_seconds", self.burst_window_seconds),
            ("suppression_duration_seconds", self.suppression_duration_seconds),
            ("rate_window_seconds", self.rate_window_seconds),
            ("retry_max_attempts", self.retry_max_attempts as u64),
            ("stop_timeout_seconds", self.stop_timeout_seconds),
            ("suppression_sweep_interval_seconds", self.suppression_sweep_interval_seconds),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
            }
        }

        if self.default_channels.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid("default_channels contains an empty name".to_string()));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry_initial_backoff_ms exceeds retry_max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }

    pub fn escalation_check_interval(&self) -> Duration {
        Duration::from_secs(self.escalation_check_interval_seconds)
    }

    pub fn suppression_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.suppression_sweep_interval_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        let delivery = self.delivery_settings().max_delivery_time().saturating_add(STOP_MARGIN);
        Duration::from_secs(self.stop_timeout_seconds).max(delivery)
    }

    pub fn suppression_settings(&self) -> SuppressionSettings {
        SuppressionSettings {
            enable_auto_suppression: self.enable_auto_suppression,
            burst_threshold: self.burst_threshold,
            burst_window: Duration::from_secs(self.burst_window_seconds),
            suppression_duration: Duration::from_secs(self.suppression_duration_seconds),
            max_alerts_per_window: self.max_alerts_per_minute,
            rate_window: Duration::from_secs(self.rate_window_seconds),
            emergency_severity_threshold: self.emergency_severity_threshold,
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            timeout: Duration::from_secs(self.notification_timeout_seconds),
            retry: RetryPolicy::exponential(
                self.retry_max_attempts,
                Duration::from_millis(self.retry_initial_backoff_ms),
                Duration::from_millis(self.retry_max_backoff_ms),
            ),
            degraded_after: self.degraded_after_failures,
        }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(name: &str) -> String {
        format!("PIPEWATCH_{}", name)
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::key(name)).filter(|v| !v.trim().is_empty())
    }

    fn set<T: FromStr>(&self, name: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(name) {
            *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: Self::key(name),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    fn set_bool(&self, name: &str, target: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(name) {
            *target = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: Self::key(name),
                        value: raw,
                    })
                }
            };
        }
        Ok(())
    }
}

/// Configuration errors; these fail startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AlertingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.evaluation_interval(), Duration::from_secs(30));
        assert_eq!(config.emergency_severity_threshold, Severity::Critical);
        assert_eq!(config.delivery_settings().retry.max_attempts, 1);
    }

    #[test]
    fn test_stop_timeout_outlasts_delivery() {
        let config = AlertingConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(11));

        let config = AlertingConfig {
            stop_timeout_seconds: 60,
            ..Default::default()
        };
        assert_eq!(config.stop_timeout(), Duration::from_secs(60));

        let config = AlertingConfig {
            notification_timeout_seconds: 10,
            retry_max_attempts: 2,
            retry_max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.stop_timeout(), Duration::from_millis(22_100));
    }

    #[test]
    fn test_env_overrides() {
        let config = AlertingConfig::default()
            .apply_env(lookup(&[
                ("PIPEWATCH_EVALUATION_INTERVAL_SECONDS", "5"),
                ("PIPEWATCH_DEFAULT_CHANNELS", "log, jsonl"),
                ("PIPEWATCH_MAINTENANCE_MODE", "yes"),
                ("PIPEWATCH_EMERGENCY_SEVERITY_THRESHOLD", "error"),
            ]))
            .unwrap();

        assert_eq!(config.evaluation_interval_seconds, 5);
        assert_eq!(config.default_channels, vec!["log".to_string(), "jsonl".to_string()]);
        assert!(config.maintenance_mode);
        assert_eq!(config.emergency_severity_threshold, Severity::Error);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let err = AlertingConfig::default()
            .apply_env(lookup(&[("PIPEWATCH_BURST_THRESHOLD", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = AlertingConfig::default()
            .apply_env(lookup(&[("PIPEWATCH_EVALUATION_INTERVAL_SECONDS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_json_file_keeps_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_alerts_per_minute": 3, "default_channels": ["log"], "emergency_severity_threshold": "error"}}"#
        )
        .unwrap();

        let config = AlertingConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_alerts_per_minute, 3);
        assert_eq!(config.default_channels, vec!["log".to_string()]);
        assert_eq!(config.notification_timeout_seconds, 10);
        assert_eq!(config.suppression_settings().max_alerts_per_window, 3);
    }

    #[test]
    fn test_json_file_errors() {
        assert!(matches!(
            AlertingConfig::from_json_file("/nonexistent/pipewatch.json"),
            Err(ConfigError::Io(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            AlertingConfig::from_json_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }
}
