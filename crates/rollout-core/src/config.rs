//! Engine configuration.
//!
//! Loaded from a TOML file, then overridden by `ROLLOUT_*` environment
//! variables. Every field has a default so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::health::HealthWatch;
use crate::telemetry;

/// Persistence backend for resume, snapshot and status state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON files under `state_dir`
    Directory,
    /// SurrealKV database under `state_dir`
    Surreal,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "directory" => Ok(BackendKind::Directory),
            "surreal" => Ok(BackendKind::Surreal),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolloutConfig {
    pub state_dir: PathBuf,
    pub backend: BackendKind,
    pub health_poll_interval_ms: u64,
    /// Upper bound on waiting for tracked services after activation
    pub deployment_timeout_secs: u64,
    /// Per-service close limit when removing obsolete services; 0 waits forever
    pub close_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_json: bool,
    pub log_level: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./rollout-state"),
            backend: BackendKind::Directory,
            health_poll_interval_ms: 1000,
            deployment_timeout_secs: 900,
            close_timeout_secs: 60,
            shutdown_timeout_secs: 30,
            log_json: false,
            log_level: "info".to_string(),
        }
    }
}

impl RolloutConfig {
    /// Read a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, "<inline>")
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::File {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `ROLLOUT_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ROLLOUT_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(backend) = lookup("ROLLOUT_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(v) = lookup("ROLLOUT_HEALTH_POLL_INTERVAL_MS") {
            self.health_poll_interval_ms = parse_u64("ROLLOUT_HEALTH_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("ROLLOUT_DEPLOYMENT_TIMEOUT_SECS") {
            self.deployment_timeout_secs = parse_u64("ROLLOUT_DEPLOYMENT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ROLLOUT_CLOSE_TIMEOUT_SECS") {
            self.close_timeout_secs = parse_u64("ROLLOUT_CLOSE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ROLLOUT_SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout_secs = parse_u64("ROLLOUT_SHUTDOWN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ROLLOUT_LOG_JSON") {
            self.log_json = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(level) = lookup("ROLLOUT_LOG_LEVEL") {
            self.log_level = level;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_poll_interval_ms == 0 {
            return Err(invalid("health_poll_interval_ms", "0"));
        }
        if self.deployment_timeout_secs == 0 {
            return Err(invalid("deployment_timeout_secs", "0"));
        }
        if telemetry::parse_level(&self.log_level).is_none() {
            return Err(invalid("log_level", &self.log_level));
        }
        Ok(())
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        (self.close_timeout_secs > 0).then(|| Duration::from_secs(self.close_timeout_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_watch(&self) -> HealthWatch {
        HealthWatch::new(self.health_poll_interval(), self.deployment_timeout())
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = RolloutConfig::from_toml_str("").unwrap();
        assert_eq!(config, RolloutConfig::default());
        assert_eq!(config.close_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = RolloutConfig::from_toml_str(
            r#"
            backend = "surreal"
            close_timeout_secs = 0
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Surreal);
        assert_eq!(config.close_timeout(), None);
        assert_eq!(config.deployment_timeout_secs, 900);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RolloutConfig::from_toml_str("health_poll = 5").unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }

    #[test]
    fn environment_wins_over_file_values() {
        let env = HashMap::from([
            ("ROLLOUT_BACKEND", "Directory"),
            ("ROLLOUT_HEALTH_POLL_INTERVAL_MS", "250"),
            ("ROLLOUT_LOG_JSON", "true"),
        ]);
        let mut config = RolloutConfig::from_toml_str("backend = \"surreal\"").unwrap();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend, BackendKind::Directory);
        assert_eq!(config.health_poll_interval(), Duration::from_millis(250));
        assert!(config.log_json);
    }

    #[test]
    fn bad_values_name_the_key() {
        let mut config = RolloutConfig::default();
        let err = config
            .apply_overrides(|k| (k == "ROLLOUT_CLOSE_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ROLLOUT_CLOSE_TIMEOUT_SECS"));

        let err = RolloutConfig::from_toml_str("log_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RolloutConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RolloutConfig::default());
    }
}
