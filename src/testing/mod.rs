//! Testing utilities and mock implementations
//!
//! Lets the router, engine and service run without an MQTT broker or a
//! database behind them.

pub mod mocks;

pub use mocks::*;
