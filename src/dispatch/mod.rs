//! Command dispatch and confirmation
//!
//! - [`publisher`] - Serializes commands onto agent command topics
//! - [`inbound`] - Demultiplexes state messages into a cache and pending waits
//! - [`coordinator`] - Publishes and waits for the matching state report

pub mod coordinator;
pub mod inbound;
pub mod publisher;

pub use coordinator::ConfirmationCoordinator;
pub use inbound::{PendingWait, StateDispatcher};
pub use publisher::CommandPublisher;
