//! nest-dispatch - command dispatch for MQTT-connected robots
//!
//! Sends commands to robot agents over a single long-lived MQTT connection
//! and correlates each command with the state report the device publishes
//! back.
//!
//! # Overview
//!
//! - [`protocol`] - Agent topic addressing and message types
//! - [`transport`] - Broker connection, publish acknowledgement, inbound routing
//! - [`dispatch`] - Command publishing, state cache and confirmation waits
//! - [`supervisor`] - Reconnection policy on top of the transport
//! - [`observability`] - Logging, metrics and health endpoints
//!
//! Commands go to `agent/{id}/commands` as `{"command":"<verb>"}`; devices
//! report on `agent/{id}/state`. A dispatch ends in one of four outcomes:
//! `Confirmed`, `Pending` (no report before the deadline), `DeliveryFailed`
//! or `NotConnected`.
//!
//! # Quick Start
//!
//! ```rust
//! use nest_dispatch::config::DispatchSection;
//! use nest_dispatch::dispatch::{ConfirmationCoordinator, StateDispatcher};
//! use nest_dispatch::protocol::DispatchOutcome;
//! use nest_dispatch::testing::MockTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let dispatcher = Arc::new(StateDispatcher::new());
//! let transport = Arc::new(MockTransport::with_device(
//!     dispatcher.clone(),
//!     Duration::from_millis(10),
//! ));
//! let coordinator =
//!     ConfirmationCoordinator::new(transport, dispatcher, &DispatchSection::default());
//!
//! let result = coordinator.dispatch_command("robot1", "on", Some(1000)).await?;
//! assert_eq!(result.outcome, DispatchOutcome::Confirmed);
//! assert_eq!(result.state_field(), Some("on"));
//! # Ok::<(), nest_dispatch::DispatchError>(())
//! # });
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use config::*;
pub use dispatch::{CommandPublisher, ConfirmationCoordinator, StateDispatcher};
pub use error::{DispatchError, NestResult};
pub use protocol::*;
pub use supervisor::ConnectionSupervisor;
pub use transport::mqtt::MqttClient;
pub use transport::{InboundHandler, Transport};
