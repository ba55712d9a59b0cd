//! Service lifecycle for the alert controller
//!
//! Wires the store, alert engine, transport and device router together and
//! owns the background tasks between `start` and `shutdown`.

pub mod lifecycle;

pub use lifecycle::*;
