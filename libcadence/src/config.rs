//! Configuration management for Cadence

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long an authorization may stay unresolved before the sweeper releases it
    pub hold_ttl_secs: i64,
    /// Optimistic-update retries before an authorize gives up
    pub max_cas_attempts: u32,
    /// Seconds between expired-hold sweeps in the daemon
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: 300,
            max_cas_attempts: 8,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub jitter_ratio: f64,
    /// How far back the decision engine looks at post history
    pub lookback_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1000,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            jitter_ratio: 0.5,
            lookback_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub generation_secs: u64,
    pub publish_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation_secs: 30,
            publish_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub default: i64,
    pub platforms: HashMap<String, i64>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            default: 20,
            platforms: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub enabled: Vec<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;

        if let Ok(path) = std::env::var("CADENCE_DB_PATH") {
            config.database.path = path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/cadence/cadence.db".to_string(),
            },
            server: ServerConfig::default(),
            ledger: LedgerConfig::default(),
            queue: QueueConfig::default(),
            timeouts: TimeoutConfig::default(),
            admission: AdmissionConfig::default(),
            costs: CostConfig::default(),
            platforms: PlatformsConfig {
                enabled: vec!["mastodon".to_string(), "nostr".to_string()],
            },
        }
    }

    /// Reject settings that would break queue or ledger guarantees
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()));
        }
        if self.queue.workers == 0 {
            return Err(invalid("queue.workers", "must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max_attempts", "must be at least 1"));
        }
        if self.queue.backoff_base_secs <= 0 || self.queue.backoff_max_secs < self.queue.backoff_base_secs {
            return Err(invalid(
                "queue.backoff_base_secs",
                "must be positive and not above queue.backoff_max_secs",
            ));
        }
        if !(0.0..1.0).contains(&self.queue.jitter_ratio) {
            return Err(invalid("queue.jitter_ratio", "must be in [0, 1)"));
        }
        if self.admission.limit == 0 || self.admission.window_secs == 0 {
            return Err(invalid("admission", "limit and window_secs must be positive"));
        }
        if self.ledger.max_cas_attempts == 0 {
            return Err(invalid("ledger.max_cas_attempts", "must be at least 1"));
        }
        let call_budget = self.timeouts.generation_secs + self.timeouts.publish_secs;
        if self.ledger.hold_ttl_secs <= call_budget as i64 {
            return Err(invalid(
                "ledger.hold_ttl_secs",
                &format!(
                    "must exceed generation + publish timeouts ({}s)",
                    call_budget
                ),
            ));
        }
        if self.costs.default <= 0 || self.costs.platforms.values().any(|c| *c <= 0) {
            return Err(invalid("costs", "action costs must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("cadence"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_minimal_config_fills_defaults() {
        let config = Config::from_toml(
            r#"
[database]
path = "/tmp/cadence.db"
"#,
        )
        .unwrap();

        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.admission.limit, 5);
        assert_eq!(config.admission.window_secs, 60);
        assert_eq!(config.costs.default, 20);
        assert_eq!(config.ledger.hold_ttl_secs, 300);
        assert!(config.platforms.enabled.is_empty());
    }

    #[test]
    #[serial]
    fn test_full_config_parses() {
        let config = Config::from_toml(
            r#"
[database]
path = "/tmp/cadence.db"

[queue]
workers = 2
max_attempts = 5

[costs]
default = 10

[costs.platforms]
mastodon = 25

[platforms]
enabled = ["mastodon", "nostr"]
"#,
        )
        .unwrap();

        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.costs.platforms.get("mastodon"), Some(&25));
        assert_eq!(config.platforms.enabled, vec!["mastodon", "nostr"]);
    }

    #[test]
    #[serial]
    fn test_hold_ttl_must_cover_external_calls() {
        let result = Config::from_toml(
            r#"
[database]
path = "/tmp/cadence.db"

[ledger]
hold_ttl_secs = 60

[timeouts]
generation_secs = 30
publish_secs = 60
"#,
        );

        match result {
            Err(CadenceError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "ledger.hold_ttl_secs");
            }
            other => panic!("Expected invalid hold TTL, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_zero_workers_rejected() {
        let result = Config::from_toml(
            r#"
[database]
path = "/tmp/cadence.db"

[queue]
workers = 0
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        std::env::set_var("CADENCE_DB_PATH", "/tmp/override.db");
        let config = Config::from_toml(
            r#"
[database]
path = "/tmp/cadence.db"
"#,
        )
        .unwrap();
        std::env::remove_var("CADENCE_DB_PATH");

        assert_eq!(config.database.path, "/tmp/override.db");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default_config().validate().is_ok());
    }
}
