//! Testing utilities and mock implementations
//!
//! Lets the dispatch path be exercised end to end without an MQTT broker.

pub mod mocks;

pub use mocks::*;
