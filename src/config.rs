//! Configuration for the dispatch service
//!
//! Loaded from a TOML file. Broker credentials are never stored in the file;
//! the `[mqtt]` section names the environment variables that hold them.

use crate::protocol::QosLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Primary broker host
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    /// Broker port, shared by the primary and fallback hosts
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host tried once when the primary handshake fails
    #[serde(default = "default_fallback_host")]
    pub fallback_host: Option<String>,
    /// Client id prefix; a random suffix is appended per process
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Abort startup when credentials cannot be resolved
    #[serde(default)]
    pub require_credentials: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK per broker target
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a publish waits for PUBACK before reporting it unacknowledged
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_fallback_host() -> Option<String> {
    Some("localhost".to_string())
}

fn default_client_id_prefix() -> String {
    "nest-dispatch".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_ack_timeout_ms() -> u64 {
    1000
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            port: default_port(),
            fallback_host: default_fallback_host(),
            client_id_prefix: default_client_id_prefix(),
            username_env: None,
            password_env: None,
            require_credentials: false,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Command dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    #[serde(default)]
    pub default_qos: QosLevel,
    /// Confirmation window (default: 3000ms)
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    /// Connectivity check granularity; must not exceed 100ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_confirm_timeout_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            default_qos: QosLevel::default(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl DispatchSection {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Supervisor reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum reconnect attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

fn default_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_sustained_delay_ms() -> u64 {
    5000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

/// Health endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

/// Resolved broker credentials
#[derive(Clone, PartialEq)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DispatchConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.mqtt.broker_host.trim().is_empty() {
            return invalid("mqtt.broker_host must not be empty");
        }
        if self.mqtt.port == 0 {
            return invalid("mqtt.port must be greater than 0");
        }
        if matches!(&self.mqtt.fallback_host, Some(host) if host.trim().is_empty()) {
            return invalid("mqtt.fallback_host must not be empty when set");
        }
        if self.mqtt.client_id_prefix.is_empty() {
            return invalid("mqtt.client_id_prefix must not be empty");
        }
        if self.mqtt.connect_timeout_ms == 0 || self.mqtt.ack_timeout_ms == 0 {
            return invalid("mqtt timeouts must be greater than 0");
        }
        if self.dispatch.confirm_timeout_ms == 0 {
            return invalid("dispatch.confirm_timeout_ms must be greater than 0");
        }
        if self.dispatch.poll_interval_ms == 0 || self.dispatch.poll_interval_ms > 100 {
            return invalid("dispatch.poll_interval_ms must be between 1 and 100");
        }
        if self.reconnect.max_attempts == Some(0) {
            return invalid("reconnect.max_attempts must be greater than 0 or omitted");
        }
        if self.reconnect.sustained_delay_ms == 0 {
            return invalid("reconnect.sustained_delay_ms must be greater than 0");
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Resolve broker credentials from the configured environment variables
    ///
    /// A username without a password authenticates with an empty password.
    /// When `require_credentials` is set, any missing variable is an error.
    pub fn resolve_credentials(&self) -> Result<Option<MqttCredentials>, ConfigError> {
        let username = Self::get_env_var_optional(self.mqtt.username_env.as_ref());
        let password = Self::get_env_var_optional(self.mqtt.password_env.as_ref());

        if self.mqtt.require_credentials {
            let username_env = self.mqtt.username_env.as_deref().ok_or_else(|| {
                ConfigError::InvalidConfig(
                    "mqtt.require_credentials is set but mqtt.username_env is missing".to_string(),
                )
            })?;
            if username.is_none() {
                return Err(ConfigError::EnvVarNotFound(username_env.to_string()));
            }
            if let (Some(password_env), None) = (&self.mqtt.password_env, &password) {
                return Err(ConfigError::EnvVarNotFound(password_env.clone()));
            }
        }

        Ok(username.map(|username| MqttCredentials {
            username,
            password: password.unwrap_or_default(),
        }))
    }
}
