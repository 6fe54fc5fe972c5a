//! Transport layer for robot agent communication
//!
//! This module provides the transport abstraction and its MQTT implementation.
//! The dispatch layer only ever talks to `dyn Transport`, which keeps it
//! testable without a broker.

use crate::protocol::{PublishAck, QosLevel};
use crate::transport::mqtt::{BrokerTarget, ConnectionState, MqttError};

pub mod mqtt;

/// Transport trait for command dispatch
///
/// This trait provides an abstraction over different transport mechanisms
/// (primarily MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the primary broker, falling back once to the alternate host
    async fn connect(&self) -> Result<BrokerTarget, MqttError>;

    /// Close the connection; outstanding acknowledgement waits resolve immediately
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Publish raw bytes to `topic`
    ///
    /// Fails fast with [`MqttError::NotConnected`] when the connection is not up.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<PublishAck, MqttError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;
}

/// Receives every inbound message delivered by a transport
///
/// Called on the transport's event loop task; implementations must not block.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8], retained: bool);
}
