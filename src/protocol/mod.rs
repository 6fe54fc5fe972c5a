//! Robot command protocol: topic addressing and message types
//!
//! Topics follow `agent/{id}/commands` and `agent/{id}/state`; see
//! [`topics`] for the addressing rules and [`messages`] for the payloads.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
