//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! broker target selection, CONNACK reason mapping and option construction.

use crate::config::{MqttCredentials, MqttSection, ReconnectSection};
use crate::protocol::QosLevel;
use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use rumqttc::v5::{mqttbytes::QoS, ConnectionError, MqttOptions};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection status of the single broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection; initial state and the state after a close or a drop
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// CONNACK received, ready for publish/subscribe
    Connected,
    /// Last handshake attempt failed
    Failed(ConnectReason),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
}

impl BrokerTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Primary target followed by the fallback, if one is configured and differs
    pub fn candidates(config: &MqttSection) -> Vec<BrokerTarget> {
        let primary = BrokerTarget::new(&config.broker_host, config.port);
        let mut targets = vec![primary];

        if let Some(fallback_host) = &config.fallback_host {
            if fallback_host != &config.broker_host {
                targets.push(BrokerTarget::new(fallback_host, config.port));
            }
        }

        targets
    }
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a handshake failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReason {
    BadCredentials,
    NotAuthorized,
    ServerUnavailable,
    /// Broker refused the CONNECT for a protocol-level reason
    ProtocolRejected(String),
    NetworkUnreachable(String),
    /// No CONNACK within the connect timeout
    Timeout,
    /// Connection closed by the broker or by us
    Closed(String),
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReason::BadCredentials => f.write_str("bad username or password"),
            ConnectReason::NotAuthorized => f.write_str("not authorized"),
            ConnectReason::ServerUnavailable => f.write_str("server unavailable"),
            ConnectReason::ProtocolRejected(code) => write!(f, "refused by broker: {code}"),
            ConnectReason::NetworkUnreachable(detail) => write!(f, "network unreachable: {detail}"),
            ConnectReason::Timeout => f.write_str("no CONNACK before timeout"),
            ConnectReason::Closed(detail) => write!(f, "connection closed: {detail}"),
        }
    }
}

impl ConnectReason {
    /// Map a refused CONNACK to a reason code
    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::BadUserNamePassword => ConnectReason::BadCredentials,
            ConnectReturnCode::NotAuthorized => ConnectReason::NotAuthorized,
            ConnectReturnCode::ServerUnavailable | ConnectReturnCode::ServerBusy => {
                ConnectReason::ServerUnavailable
            }
            other => ConnectReason::ProtocolRejected(format!("{other:?}")),
        }
    }

    /// Map an event loop error to a reason code
    pub fn from_connection_error(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::from_return_code(*code),
            ConnectionError::Io(e) => ConnectReason::NetworkUnreachable(e.to_string()),
            other => ConnectReason::Closed(other.to_string()),
        }
    }
}

/// Reconnection policy applied by the supervisor
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection to {target} failed: {reason}")]
    ConnectionFailed {
        target: BrokerTarget,
        reason: ConnectReason,
    },
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Random per-process client id: `{prefix}-{8 hex chars}`
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// Build MQTT options for one broker target
pub fn configure_mqtt_options(
    client_id: &str,
    target: &BrokerTarget,
    config: &MqttSection,
    credentials: Option<&MqttCredentials>,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, target.host.clone(), target.port);

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_clean_start(true);

    mqtt_options
}

/// Convert a protocol QoS level to the rumqttc representation
pub fn to_mqtt_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}
