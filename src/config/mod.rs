/// Configuration management for the replica router

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::ReplicaConfig;
use crate::executor::ExecutorConfig;
use crate::RouterOptions;

/// Main router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Health check configuration
    #[serde(default)]
    pub health: HealthConfig,
    /// Query executor configuration
    #[serde(default)]
    pub executor: ExecutorSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Replicas registered at startup
    #[serde(default)]
    pub replicas: Vec<ReplicaSettings>,
    /// Routing rules, evaluated in file order
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Periodic probe interval in seconds
    pub interval_sec: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_sec: 30 }
    }
}

/// Query executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Attempts per replica when a replica entry does not set `max_retries`
    pub default_max_retries: u32,
    /// Linear backoff step between attempts on the same replica
    pub retry_backoff_ms: u64,
    /// Move on to another healthy replica once one is exhausted
    pub reselect_on_failure: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_backoff_ms: 10,
            reselect_on_failure: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// One `[[replicas]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSettings {
    pub name: String,
    /// SQLite database file (or `file:` URI)
    pub path: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    5000
}

/// One `[[rules]]` entry; replicas are referenced by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSettings {
    pub pattern: String,
    pub replicas: Vec<String>,
    #[serde(default)]
    pub fallback_to_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_sec: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            executor: ExecutorSettings::default(),
            logging: LoggingConfig::default(),
            replicas: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_sec must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        let mut names = HashSet::new();
        for replica in &self.replicas {
            if replica.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica name cannot be empty".to_string(),
                ));
            }
            if !names.insert(replica.name.as_str()) {
                return Err(ConfigError::ValidationError(
                    format!("Duplicate replica name: {}", replica.name)
                ));
            }
            if replica.path.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    format!("Replica {} has an empty path", replica.name)
                ));
            }
            if !replica.weight.is_finite() || replica.weight <= 0.0 {
                return Err(ConfigError::ValidationError(
                    format!("Replica {} weight must be greater than 0", replica.name)
                ));
            }
            if replica.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(
                    format!("Replica {} timeout_ms must be greater than 0", replica.name)
                ));
            }
        }

        for rule in &self.rules {
            regex::Regex::new(&rule.pattern)
                .map_err(|e| ConfigError::ValidationError(
                    format!("Invalid rule pattern '{}': {}", rule.pattern, e)
                ))?;

            if rule.replicas.is_empty() {
                return Err(ConfigError::ValidationError(
                    format!("Rule '{}' names no replicas", rule.pattern)
                ));
            }
            if let Some(unknown) = rule.replicas.iter().find(|name| !names.contains(name.as_str())) {
                return Err(ConfigError::ValidationError(
                    format!("Rule '{}' references unknown replica {}", rule.pattern, unknown)
                ));
            }
        }

        Ok(())
    }

    /// Router tuning derived from the `[health]` and `[executor]` sections
    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            health_interval: Duration::from_secs(self.health.interval_sec),
            executor: ExecutorConfig {
                retry_backoff: Duration::from_millis(self.executor.retry_backoff_ms),
                reselect_on_failure: self.executor.reselect_on_failure,
            },
        }
    }

    /// Replica configs ready for registration, in file order
    pub fn replica_configs(&self) -> Vec<ReplicaConfig> {
        self.replicas
            .iter()
            .map(|settings| {
                let mut config = ReplicaConfig::new(settings.name.clone(), settings.path.clone())
                    .with_weight(settings.weight)
                    .with_priority(settings.priority)
                    .with_timeout(Duration::from_millis(settings.timeout_ms))
                    .with_max_retries(settings.max_retries.unwrap_or(self.executor.default_max_retries));
                for tag in &settings.tags {
                    config = config.with_tag(tag.clone());
                }
                config
            })
            .collect()
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let replica = |name: &str, weight: f64, tags: &[&str]| ReplicaSettings {
            name: name.to_string(),
            path: format!("/var/lib/helpdesk/{}.db", name),
            weight,
            priority: 1,
            timeout_ms: 5000,
            max_retries: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };

        let config = Config {
            replicas: vec![
                replica("replica-a", 1.0, &[]),
                replica("replica-b", 3.0, &["analytics", "export"]),
                replica("replica-c", 1.0, &["background"]),
            ],
            rules: vec![RuleSettings {
                pattern: "analytics_".to_string(),
                replicas: vec!["replica-b".to_string()],
                fallback_to_primary: false,
                cache_ttl_sec: Some(300),
            }],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
