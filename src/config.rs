use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the sync core
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncCoreConfig {
    /// Policy applied to every remote call unless a component overrides it
    pub retry: RetrySettings,
    /// Realtime subscription settings
    pub realtime: RealtimeConfig,
    /// Durable telemetry queue settings
    pub queue: QueueConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

/// Serializable form of a `RetryPolicy`; durations are milliseconds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrySettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    /// Number of recent event ids remembered per resource
    pub dedup_capacity: usize,
    /// How long a seen event id stays in the window
    pub dedup_ttl_secs: u64,
    /// Policy for re-opening a dropped transport channel
    pub resubscribe: RetrySettings,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 500,
            dedup_ttl_secs: 300,
            resubscribe: RetrySettings {
                max_retries: 5,
                base_delay_ms: 1_000,
                ..RetrySettings::default()
            },
        }
    }
}

impl RealtimeConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Location of the durable event list
    pub path: PathBuf,
    /// Oldest events are evicted beyond this many
    pub max_events: usize,
    /// Upper bound on a whole flush attempt
    pub flush_budget_ms: u64,
    /// Policy for each sink call made during a flush
    pub flush: RetrySettings,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".tasksync/event-queue.json"),
            max_events: 1_000,
            flush_budget_ms: 15_000,
            flush: RetrySettings {
                timeout_ms: 5_000,
                max_retries: 2,
                ..RetrySettings::default()
            },
        }
    }
}

impl QueueConfig {
    pub fn flush_budget(&self) -> Duration {
        Duration::from_millis(self.flush_budget_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log filter directive, e.g. "info" or "tasksync=debug"
    pub log_level: String,
    /// Emit JSON lines instead of compact text
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for SyncCoreConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            realtime: RealtimeConfig::default(),
            queue: QueueConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl SyncCoreConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `tasksync.toml` in the working directory
    /// 3. An explicit file, if given
    /// 4. Environment variables (`TASKSYNC__QUEUE__MAX_EVENTS=50`)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&SyncCoreConfig::default())
            .context("failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("tasksync.toml").exists() {
            builder = builder.add_source(File::with_name("tasksync"));
        }

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKSYNC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to build configuration")?;
        let loaded: SyncCoreConfig = config
            .try_deserialize()
            .context("invalid tasksync configuration")?;
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = self.to_toml()?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[queue]\nmax_events = 25\n\n[realtime]\ndedup_capacity = 64\n",
        )
        .unwrap();

        let config = SyncCoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config.queue.max_events, 25);
        assert_eq!(config.realtime.dedup_capacity, 64);
        // untouched sections keep their defaults
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.queue.flush.max_retries, 2);
    }

    #[test]
    fn test_toml_round_trip_through_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = SyncCoreConfig::default();
        config.retry.max_retries = 7;
        config.save_to_file(&path).unwrap();

        let loaded = SyncCoreConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.retry.max_retries, 7);
    }
}
