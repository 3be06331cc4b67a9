//! Runtime configuration from YAML and environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Whether step traces are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Development,
    /// Traces are suppressed
    Production,
}

impl ExecutionMode {
    /// Interpret an environment value: anything starting with `prod` is production
    pub fn from_env_value(value: &str) -> Self {
        if value.trim().to_lowercase().starts_with("prod") {
            ExecutionMode::Production
        } else {
            ExecutionMode::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, ExecutionMode::Production)
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub ladder: LadderSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub trace: TraceSettings,
}

/// Connection ladder retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderSettings {
    /// Fixed delay before a failed ladder is climbed again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for LadderSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LadderSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Message broker settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Connection URLs, tried in rotation
    #[serde(default)]
    pub urls: Vec<String>,

    /// Instance name used to build per-instance reply queues (defaults to `<host>:0`)
    #[serde(default)]
    pub instance: Option<String>,
}

/// Document store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database URL or path; the in-memory store is used when absent
    #[serde(default)]
    pub url: Option<String>,
}

/// Console trace layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    /// Columns of indentation per scope depth
    #[serde(default = "default_indent")]
    pub indent: usize,
}

fn default_indent() -> usize {
    4
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            indent: default_indent(),
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_yaml::from_str(yaml).context("Failed to parse runtime config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    /// Apply `STEPLINE_*` environment overrides
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("STEPLINE_ENV") {
            self.mode = ExecutionMode::from_env_value(&env);
        }
        if let Some(pool) = lookup("STEPLINE_BROKER_POOL") {
            self.broker.urls = pool
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = lookup("STEPLINE_STORE_URL") {
            self.store.url = Some(url);
        }
        if let Some(delay) = lookup("STEPLINE_RETRY_DELAY_MS") {
            self.ladder.retry_delay_ms = delay
                .parse()
                .with_context(|| format!("Invalid STEPLINE_RETRY_DELAY_MS: {}", delay))?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.ladder.retry_delay_ms == 0 {
            anyhow::bail!("ladder.retry_delay_ms must be greater than zero");
        }
        Ok(())
    }
}
