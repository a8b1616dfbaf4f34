use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::paths::{resolve_path, runplex_config_path};
use crate::run::DEFAULT_LIFECYCLE_CAPACITY;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunplexConfig {
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub backend: BackendConfig,
    pub storage: StorageConfig,
    pub debug: DebugConfig,
}

impl RunplexConfig {
    /// Load `config.toml` from the runplex home; a missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = runplex_config_path().map_err(ConfigError::Path)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Per-event tracing: `debug.trace_events`, or `{debug_env}=1`.
    pub fn trace_events_enabled(&self) -> bool {
        if self.debug.trace_events {
            return true;
        }
        matches!(
            std::env::var(&self.debug.debug_env).ok().as_deref(),
            Some("1")
        )
    }

    pub fn db_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        match self.storage.db_path.as_deref() {
            Some(path) => resolve_path(path).map(Some).map_err(ConfigError::Path),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub lifecycle_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lifecycle_capacity: DEFAULT_LIFECYCLE_CAPACITY,
        }
    }
}

/// Outcome of a stream that ends without a terminal event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    #[default]
    Success,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub cancel_reason: String,
    pub close_without_terminal: ClosePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cancel_reason: "cancelled by user".to_string(),
            close_without_terminal: ClosePolicy::Success,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 30,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub trace_events: bool,
    pub debug_env: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            trace_events: false,
            debug_env: "RUNPLEX_DEBUG".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RunplexConfig::from_toml("").unwrap();
        assert_eq!(config.registry.lifecycle_capacity, 256);
        assert_eq!(config.coordinator.cancel_reason, "cancelled by user");
        assert_eq!(config.coordinator.close_without_terminal, ClosePolicy::Success);
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert!(config.backend.auth_token.is_none());
        assert!(config.storage.db_path.is_none());
        assert_eq!(config.debug.debug_env, "RUNPLEX_DEBUG");
    }

    #[test]
    fn sections_override_defaults() {
        let config = RunplexConfig::from_toml(
            r#"
            [registry]
            lifecycle_capacity = 8

            [coordinator]
            close_without_terminal = "failed"

            [backend]
            base_url = "https://agents.example.com/api"
            auth_token = "secret"

            [debug]
            trace_events = true
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.lifecycle_capacity, 8);
        assert_eq!(config.coordinator.close_without_terminal, ClosePolicy::Failed);
        assert_eq!(config.coordinator.cancel_reason, "cancelled by user");
        assert_eq!(config.backend.base_url, "https://agents.example.com/api");
        assert_eq!(config.backend.auth_token.as_deref(), Some("secret"));
        assert!(config.trace_events_enabled());
    }

    #[test]
    fn unknown_close_policy_is_a_parse_error() {
        let err = RunplexConfig::from_toml("[coordinator]\nclose_without_terminal = \"maybe\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn trace_events_follows_debug_env() {
        let mut config = RunplexConfig::default();
        config.debug.debug_env = "RUNPLEX_TEST_TRACE_EVENTS".to_string();
        assert!(!config.trace_events_enabled());
        std::env::set_var("RUNPLEX_TEST_TRACE_EVENTS", "1");
        assert!(config.trace_events_enabled());
        std::env::remove_var("RUNPLEX_TEST_TRACE_EVENTS");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("runplex-missing-config-for-test.toml");
        let config = RunplexConfig::load_from(&path).unwrap();
        assert_eq!(config.registry.lifecycle_capacity, DEFAULT_LIFECYCLE_CAPACITY);
    }
}
