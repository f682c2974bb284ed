use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use crate::error::{Result, PipelineError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PipelineConfig {
    pub sessions: SessionConfig,
    pub alerting: AlertingConfig,
    pub notifications: NotificationConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    pub inactivity_gap_secs: u64,
    pub max_duration_secs: u64,
    pub top_n: usize,
    /// Event ids remembered per source for replay detection.
    pub dedup_capacity: usize,
    pub anomaly: AnomalyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AnomalyConfig {
    pub min_baseline_sessions: u64,
    pub deviation_factor: f64,
    pub min_ratio_delta: f64,
    pub min_session_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AlertingConfig {
    pub suppression_window_secs: u64,
    pub escalation_delay_secs: u64,
    pub escalation_poll_secs: u64,
    pub scheduler_failure_threshold: u32,
    /// How long a claimed escalation may stay in flight before another tick
    /// re-fires it.
    pub escalation_lease_secs: u64,
    /// Upper bound on samples kept per threshold window.
    pub max_window_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct NotificationConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub per_channel_rate_per_sec: u32,
    pub per_channel_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkersConfig {
    pub shards: usize,
    pub queue_depth: usize,
    /// Times a shard worker runs an event whose alert stage failed before
    /// giving it up.
    pub max_redeliveries: u32,
    pub redelivery_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_gap_secs: 1800,
            max_duration_secs: 14_400,
            top_n: 5,
            dedup_capacity: 4096,
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self { min_baseline_sessions: 3, deviation_factor: 3.0, min_ratio_delta: 0.2, min_session_requests: 5 }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            suppression_window_secs: 3600,
            escalation_delay_secs: 900,
            escalation_poll_secs: 30,
            scheduler_failure_threshold: 3,
            escalation_lease_secs: 300,
            max_window_samples: 10_000,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            request_timeout_secs: 10,
            per_channel_rate_per_sec: 5,
            per_channel_concurrency: 4,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { shards: num_cpus::get().max(1), queue_depth: 1024, max_redeliveries: 3, redelivery_backoff_ms: 500 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sessions: SessionConfig::default(),
            alerting: AlertingConfig::default(),
            notifications: NotificationConfig::default(),
            workers: WorkersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn inactivity_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_gap_secs as i64)
    }

    pub fn max_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_duration_secs as i64)
    }
}

impl AlertingConfig {
    pub fn suppression_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.suppression_window_secs as i64)
    }

    pub fn escalation_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.escalation_delay_secs as i64)
    }

    pub fn escalation_poll(&self) -> Duration {
        Duration::from_secs(self.escalation_poll_secs)
    }

    pub fn escalation_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.escalation_lease_secs as i64)
    }
}

impl NotificationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::ConfigError(format!("Invalid value for {}: '{}'", name, raw)))?;
    }
    Ok(())
}

impl PipelineConfig {
    /// Read, apply `LLM_WATCH_*` overrides, validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            return serde_yaml::from_str(&content)
                .map_err(|e| PipelineError::ConfigError(format!("Failed to parse config: {}", e)));
        }

        // TOML first, then YAML for files without a telling extension
        match toml::from_str::<PipelineConfig>(&content) {
            Ok(config) => Ok(config),
            Err(toml_err) => serde_yaml::from_str::<PipelineConfig>(&content)
                .map_err(|_| PipelineError::ConfigError(format!("Failed to parse config: {}", toml_err))),
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        env_parse("LLM_WATCH_SESSION_INACTIVITY_GAP_SECS", &mut self.sessions.inactivity_gap_secs)?;
        env_parse("LLM_WATCH_SESSION_MAX_DURATION_SECS", &mut self.sessions.max_duration_secs)?;
        env_parse("LLM_WATCH_SESSION_TOP_N", &mut self.sessions.top_n)?;
        env_parse("LLM_WATCH_SUPPRESSION_WINDOW_SECS", &mut self.alerting.suppression_window_secs)?;
        env_parse("LLM_WATCH_ESCALATION_DELAY_SECS", &mut self.alerting.escalation_delay_secs)?;
        env_parse("LLM_WATCH_ESCALATION_POLL_SECS", &mut self.alerting.escalation_poll_secs)?;
        env_parse("LLM_WATCH_ESCALATION_LEASE_SECS", &mut self.alerting.escalation_lease_secs)?;
        env_parse("LLM_WATCH_NOTIFY_MAX_ATTEMPTS", &mut self.notifications.max_attempts)?;
        env_parse("LLM_WATCH_NOTIFY_TIMEOUT_SECS", &mut self.notifications.request_timeout_secs)?;
        env_parse("LLM_WATCH_NOTIFY_RATE_PER_SEC", &mut self.notifications.per_channel_rate_per_sec)?;
        env_parse("LLM_WATCH_WORKER_SHARDS", &mut self.workers.shards)?;
        env_parse("LLM_WATCH_QUEUE_DEPTH", &mut self.workers.queue_depth)?;
        env_parse("LLM_WATCH_MAX_REDELIVERIES", &mut self.workers.max_redeliveries)?;
        if let Ok(level) = std::env::var("LLM_WATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        env_parse("LLM_WATCH_LOG_JSON", &mut self.logging.json)?;
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PipelineError::ConfigError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.sessions;
        if s.inactivity_gap_secs == 0 || s.max_duration_secs == 0 {
            return Err(PipelineError::ConfigError("Session windows must be positive".to_string()));
        }
        if s.inactivity_gap_secs > s.max_duration_secs {
            return Err(PipelineError::ConfigError(format!(
                "inactivity_gap_secs ({}) exceeds max_duration_secs ({})",
                s.inactivity_gap_secs, s.max_duration_secs
            )));
        }
        if s.top_n == 0 {
            return Err(PipelineError::ConfigError("sessions.top_n must be at least 1".to_string()));
        }
        if s.anomaly.deviation_factor <= 0.0 {
            return Err(PipelineError::ConfigError("anomaly.deviation_factor must be positive".to_string()));
        }

        let a = &self.alerting;
        if a.suppression_window_secs == 0
            || a.escalation_delay_secs == 0
            || a.escalation_poll_secs == 0
            || a.escalation_lease_secs == 0
        {
            return Err(PipelineError::ConfigError("Alerting windows must be positive".to_string()));
        }
        if a.scheduler_failure_threshold == 0 || a.max_window_samples == 0 {
            return Err(PipelineError::ConfigError(
                "scheduler_failure_threshold and max_window_samples must be positive".to_string(),
            ));
        }

        let n = &self.notifications;
        if n.max_attempts == 0 {
            return Err(PipelineError::ConfigError("notifications.max_attempts must be at least 1".to_string()));
        }
        if n.max_backoff_ms < n.initial_backoff_ms {
            return Err(PipelineError::ConfigError(format!(
                "max_backoff_ms ({}) is below initial_backoff_ms ({})",
                n.max_backoff_ms, n.initial_backoff_ms
            )));
        }
        if n.request_timeout_secs == 0 || n.per_channel_rate_per_sec == 0 || n.per_channel_concurrency == 0 {
            return Err(PipelineError::ConfigError(
                "Notification timeout, rate and concurrency must be positive".to_string(),
            ));
        }

        if self.workers.shards == 0 || self.workers.queue_depth == 0 {
            return Err(PipelineError::ConfigError("workers.shards and queue_depth must be positive".to_string()));
        }
        Ok(())
    }
}
