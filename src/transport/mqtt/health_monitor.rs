//! Pure health monitoring and reconnection logic for MQTT client
//!
//! State transitions are decided here so the event loop only has to feed in
//! events. Nothing in this module performs I/O.

use super::connection::{ConnectReason, ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let backoff_delay = config.calculate_backoff_delay(current_attempts + 1);
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: backoff_delay,
        }
    }

    /// Determine next state after connection event (pure function)
    ///
    /// A closed connection stays closed: only a fresh `ConnectStarted` leaves
    /// `Disconnected`, so late events from a torn-down loop cannot revive it.
    /// A live connection must be closed before a new handshake can start.
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match (current_state, event) {
            (ConnectionState::Connected, ConnectionEvent::ConnectStarted) => {
                ConnectionState::Connected
            }
            (_, ConnectionEvent::ConnectStarted) => ConnectionState::Connecting,
            (_, ConnectionEvent::ClosedByClient) => ConnectionState::Disconnected,
            (ConnectionState::Disconnected, _) => ConnectionState::Disconnected,
            (ConnectionState::Failed(reason), _) => ConnectionState::Failed(reason.clone()),
            (ConnectionState::Connecting, ConnectionEvent::ConnAckReceived) => {
                ConnectionState::Connected
            }
            (ConnectionState::Connected, ConnectionEvent::ConnAckReceived) => {
                ConnectionState::Connected
            }
            (ConnectionState::Connecting, ConnectionEvent::NetworkError(reason)) => {
                ConnectionState::Failed(reason)
            }
            (ConnectionState::Connecting, ConnectionEvent::DisconnectedByBroker) => {
                ConnectionState::Failed(ConnectReason::Closed("broker disconnected".to_string()))
            }
            (ConnectionState::Connected, ConnectionEvent::NetworkError(_))
            | (ConnectionState::Connected, ConnectionEvent::DisconnectedByBroker) => {
                ConnectionState::Disconnected
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
            }
            (_, ConnectionState::Failed(reason)) => {
                error!(reason = %reason, "MQTT connection attempt failed");
            }
            _ if from == to => {}
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A new handshake was started
    ConnectStarted,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error, including a refused CONNACK
    NetworkError(ConnectReason),
    /// Local close requested
    ClosedByClient,
}
