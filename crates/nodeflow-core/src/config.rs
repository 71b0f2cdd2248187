use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeflowError, Result};
use crate::types::EventDeliveryMode;

/// Default poll cadence for the authorization handshake.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
/// Default give-up window for the authorization handshake.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 60_000;

/// Top-level nodeflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Version stamped onto a node after it builds successfully.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime_version: default_runtime_version(),
            polling: PollingConfig::default(),
            build: BuildConfig::default(),
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

fn default_runtime_version() -> String { env!("CARGO_PKG_VERSION").to_string() }

/// Authorization polling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Milliseconds between validate ticks.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Milliseconds from session start until silent give-up.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Stop the session as soon as a tick response reports the field connected.
    #[serde(default = "default_stop_on_connected")]
    pub stop_on_connected: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            stop_on_connected: default_stop_on_connected(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_interval_ms() -> u64 { DEFAULT_POLL_INTERVAL_MS }
fn default_timeout_ms() -> u64 { DEFAULT_POLL_TIMEOUT_MS }
fn default_stop_on_connected() -> bool { true }

/// Build trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub event_delivery: EventDeliveryMode,
    /// Analytics event name recorded for each issued build.
    #[serde(default = "default_analytics_event")]
    pub analytics_event: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            event_delivery: EventDeliveryMode::default(),
            analytics_event: default_analytics_event(),
        }
    }
}

fn default_analytics_event() -> String { "Flow Build - Clicked".to_string() }

/// Backend HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Flow that build requests are scoped to.
    #[serde(default)]
    pub flow_id: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            flow_id: None,
        }
    }
}

fn default_base_url() -> String { "http://localhost:7860".to_string() }
fn default_request_timeout() -> u64 { 30 }

/// Auth field defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Field key used when the node does not name its auth field.
    #[serde(default = "default_auth_field")]
    pub default_field: String,
    /// Placeholder API key value that counts as "not configured".
    #[serde(default = "default_api_key_placeholder")]
    pub api_key_placeholder: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_field: default_auth_field(),
            api_key_placeholder: default_api_key_placeholder(),
        }
    }
}

impl AuthConfig {
    /// Whether `key` is a usable API key (present and not the placeholder).
    pub fn has_usable_api_key(&self, key: Option<&str>) -> bool {
        match key {
            Some(k) => !k.trim().is_empty() && k != self.api_key_placeholder,
            None => false,
        }
    }
}

fn default_auth_field() -> String { "auth_link".to_string() }
fn default_api_key_placeholder() -> String { "COMPOSIO_API_KEY".to_string() }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| NodeflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| NodeflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the timers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(NodeflowError::Config(
                "polling.interval_ms must be greater than zero".into(),
            ));
        }
        if self.polling.timeout_ms == 0 {
            return Err(NodeflowError::Config(
                "polling.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(NodeflowError::Config("backend.base_url is empty".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Leave the placeholder as written when the variable is unset
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_NODEFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_NODEFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_NODEFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_NODEFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_NODEFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.polling.interval_ms, 3_000);
        assert_eq!(config.polling.timeout_ms, 60_000);
        assert!(config.polling.stop_on_connected);
        assert_eq!(config.build.event_delivery, EventDeliveryMode::Streaming);
        assert_eq!(config.build.analytics_event, "Flow Build - Clicked");
        assert_eq!(config.auth.default_field, "auth_link");
        assert_eq!(config.runtime_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_polling_durations() {
        let polling = PollingConfig {
            interval_ms: 250,
            timeout_ms: 5_000,
            stop_on_connected: false,
        };
        assert_eq!(polling.interval(), Duration::from_millis(250));
        assert_eq!(polling.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config: AppConfig = toml::from_str("[polling]\ninterval_ms = 0").unwrap();
        assert!(matches!(config.validate(), Err(NodeflowError::Config(_))));
    }

    #[test]
    fn test_usable_api_key() {
        let auth = AuthConfig::default();
        assert!(!auth.has_usable_api_key(None));
        assert!(!auth.has_usable_api_key(Some("")));
        assert!(!auth.has_usable_api_key(Some("COMPOSIO_API_KEY")));
        assert!(auth.has_usable_api_key(Some("ck_live_123")));
    }
}
