use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

/// Mail sync tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SyncConfig {
    /// Upper bound on accounts synced at the same time.
    pub max_concurrent_accounts: usize,
    /// Attempts per run when the provider reports a transient failure.
    pub fetch_attempts: u32,
    pub fetch_retry_base_ms: u64,
    pub gmail_api_base: Option<String>,
    pub gmail_token_endpoint: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: 4,
            fetch_attempts: 3,
            fetch_retry_base_ms: 500,
            gmail_api_base: None,
            gmail_token_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SchedulerConfig {
    pub autostart: bool,
    pub interval_secs: u64,
    pub event_lead_hours: i64,
    pub deadline_lead_hours: i64,
    pub drain_timeout_secs: u64,
    /// Items left in `sending` for longer than this are requeued on start
    /// and at the top of every tick.
    pub stale_sending_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            interval_secs: 300,
            event_lead_hours: 24,
            deadline_lead_hours: 72,
            drain_timeout_secs: 30,
            stale_sending_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DeliveryConfig {
    pub webhook_url: Option<String>,
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_attempts: 5,
            base_backoff_secs: 30,
            max_backoff_secs: 3600,
            timeout_secs: 10,
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Optional event extraction service. Disabled when `endpoint` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ExtractionConfig {
    pub endpoint: Option<String>,
    pub template: String,
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            template: "interview".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid SCHEDULER_INTERVAL_SECS override: {0}")]
    InvalidInterval(std::num::ParseIntError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(url) = env::var("NOTIFY_WEBHOOK_URL") {
            self.delivery.webhook_url = Some(url);
        }

        if let Ok(interval) = env::var("SCHEDULER_INTERVAL_SECS") {
            self.scheduler.interval_secs =
                interval.parse().map_err(ConfigError::InvalidInterval)?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.paths.database)?;
        apply_env_marker(&mut self.extraction.template)?;
        for value in [
            &mut self.telemetry.otlp_endpoint,
            &mut self.delivery.webhook_url,
            &mut self.extraction.endpoint,
            &mut self.sync.gmail_api_base,
            &mut self.sync.gmail_token_endpoint,
        ]
        .into_iter()
        .flatten()
        {
            apply_env_marker(value)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.max_concurrent_accounts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_concurrent_accounts must be at least 1".into(),
            ));
        }
        if self.sync.fetch_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sync.fetch_attempts must be at least 1".into(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.event_lead_hours < 0 || self.scheduler.deadline_lead_hours < 0 {
            return Err(ConfigError::Invalid(
                "scheduler lead windows cannot be negative".into(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_attempts must be at least 1".into(),
            ));
        }
        if self.delivery.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "delivery.timeout_secs must be positive".into(),
            ));
        }
        if self.delivery.max_backoff_secs < self.delivery.base_backoff_secs {
            return Err(ConfigError::Invalid(
                "delivery.max_backoff_secs must not be smaller than base_backoff_secs".into(),
            ));
        }
        Ok(())
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
