//! AgentDaemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main AgentDaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider connections, first entry is the default
    pub providers: Vec<ProviderConfig>,

    /// Name of the provider used once after primary retry exhaustion
    #[serde(rename = "fallback-provider")]
    pub fallback_provider: Option<String>,

    /// Retry/backoff executor tuning
    pub executor: ExecutorConfig,

    /// Scheduler tick and policies
    pub scheduler: SchedulerConfig,

    /// Manual-trigger poll protocol
    pub trigger: TriggerConfig,

    /// Metrics broadcaster tuning
    pub telemetry: TelemetryConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks provider wiring and API key environment variables so the
    /// daemon fails fast with clear messages instead of failing mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(eyre::eyre!("No providers configured"));
        }
        for provider in &self.providers {
            if std::env::var(&provider.api_key_env).is_err() {
                return Err(eyre::eyre!(
                    "API key for provider '{}' not found. Set the {} environment variable.",
                    provider.name,
                    provider.api_key_env
                ));
            }
        }
        if let Some(fallback) = &self.fallback_provider
            && !self.providers.iter().any(|p| &p.name == fallback)
        {
            return Err(eyre::eyre!("fallback-provider '{}' is not a configured provider", fallback));
        }
        Ok(())
    }

    /// Find a provider config by name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .agentdaemon.yml
        let local_config = PathBuf::from(".agentdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/agentdaemon/agentdaemon.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentdaemon").join("agentdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Supported provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

/// One provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Name agents reference in their `provider` field
    pub name: String,

    /// Backend protocol
    pub kind: ProviderKind,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// USD per million input tokens, for cost accounting
    #[serde(rename = "input-cost-per-mtok")]
    pub input_cost_per_mtok: f64,

    /// USD per million output tokens, for cost accounting
    #[serde(rename = "output-cost-per-mtok")]
    pub output_cost_per_mtok: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "anthropic".to_string(),
            kind: ProviderKind::Anthropic,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout_ms: 120_000,
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
        }
    }
}

/// Retry/backoff executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempt budget on the primary provider
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles each attempt (5s, 10s, 20s, ...)
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Minimum spacing after every provider call, success included
    #[serde(rename = "min-spacing-ms")]
    pub min_spacing_ms: u64,

    /// Hard wall-clock bound for one execution, retries included
    #[serde(rename = "hard-timeout-ms")]
    pub hard_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 5_000,
            min_spacing_ms: 2_000,
            hard_timeout_ms: 300_000,
        }
    }
}

/// Scheduler tick and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between due-agent evaluation passes
    #[serde(rename = "tick-secs")]
    pub tick_secs: u64,

    /// Whether a manual trigger also resets the automatic next_run_at
    #[serde(rename = "reschedule-on-manual")]
    pub reschedule_on_manual: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            reschedule_on_manual: false,
        }
    }
}

/// Manual-trigger poll protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Seconds between outcome polls after an accepted trigger
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Poll attempts before telling the caller to consult the ledger
    #[serde(rename = "max-polls")]
    pub max_polls: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            max_polls: 10,
        }
    }
}

/// Metrics broadcaster tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between snapshot pushes to subscribers
    #[serde(rename = "tick-secs")]
    pub tick_secs: u64,

    /// Hard cap on concurrent stream channels; subscribes beyond it are
    /// rejected, not queued
    #[serde(rename = "channel-cap")]
    pub channel_cap: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            channel_cap: 10,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite ledger database
    #[serde(rename = "ledger-path")]
    pub ledger_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/agentdaemon on Linux)
        let ledger_path = dirs::data_dir()
            .map(|d| d.join("agentdaemon"))
            .unwrap_or_else(|| PathBuf::from(".agentdaemon"))
            .join("ledger.db");

        Self { ledger_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.providers.is_empty());
        assert_eq!(config.executor.max_attempts, 4);
        assert_eq!(config.executor.base_delay_ms, 5_000);
        assert_eq!(config.scheduler.tick_secs, 30);
        assert!(!config.scheduler.reschedule_on_manual);
        assert_eq!(config.telemetry.channel_cap, 10);
        assert_eq!(config.trigger.max_polls, 10);
    }

    #[test]
    fn test_provider_config_defaults() {
        let config = ProviderConfig::default();

        assert_eq!(config.kind, ProviderKind::Anthropic);
        assert_eq!(config.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.base_url, "https://api.anthropic.com");
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
providers:
  - name: anthropic
    kind: anthropic
    api-key-env: MY_API_KEY
    base-url: https://api.example.com
    timeout-ms: 60000
    input-cost-per-mtok: 3.0
    output-cost-per-mtok: 15.0
  - name: openai
    kind: openai
    api-key-env: OPENAI_API_KEY
    base-url: https://api.openai.com
fallback-provider: openai

executor:
  max-attempts: 3
  base-delay-ms: 1000
  hard-timeout-ms: 120000

scheduler:
  tick-secs: 10
  reschedule-on-manual: true

telemetry:
  channel-cap: 4
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].api_key_env, "MY_API_KEY");
        assert_eq!(config.providers[1].kind, ProviderKind::Openai);
        assert_eq!(config.fallback_provider.as_deref(), Some("openai"));
        assert_eq!(config.executor.max_attempts, 3);
        // Unspecified executor field keeps its default
        assert_eq!(config.executor.min_spacing_ms, 2_000);
        assert_eq!(config.scheduler.tick_secs, 10);
        assert!(config.scheduler.reschedule_on_manual);
        assert_eq!(config.telemetry.channel_cap, 4);
        assert_eq!(config.telemetry.tick_secs, 5);
    }

    #[test]
    fn test_validate_rejects_unknown_fallback() {
        let mut config = Config {
            providers: vec![ProviderConfig::default()],
            fallback_provider: Some("missing".to_string()),
            ..Default::default()
        };
        // Make the api key check pass deterministically
        config.providers[0].api_key_env = "PATH".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fallback-provider"));
    }

    #[test]
    fn test_validate_rejects_empty_providers() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_lookup() {
        let config = Config {
            providers: vec![ProviderConfig::default()],
            ..Default::default()
        };
        assert!(config.provider("anthropic").is_some());
        assert!(config.provider("openai").is_none());
    }
}
