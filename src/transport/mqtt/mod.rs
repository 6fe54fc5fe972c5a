//! MQTT transport for robot command dispatch
//!
//! Pure functions are kept apart from I/O so most of the connection logic is
//! testable without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Connection state, broker targets, option construction
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - State transitions and reconnection decisions
//! - [`ack_tracker`] - Correlation of publishes with PUBACK/PUBREC
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use nest_dispatch::config::MqttSection;
//! use nest_dispatch::dispatch::StateDispatcher;
//! use nest_dispatch::transport::mqtt::MqttClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let dispatcher = Arc::new(StateDispatcher::new());
//! let client = MqttClient::new(MqttSection::default(), None, dispatcher);
//! let target = client.connect().await?;
//! println!("connected to {target}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use ack_tracker::{AckTicket, AckTracker};
pub use client::MqttClient;
pub use connection::{
    configure_mqtt_options, generate_client_id, to_mqtt_qos, BrokerTarget, ConnectReason,
    ConnectionState, MqttError, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
