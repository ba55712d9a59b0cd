//! Alert state engine
//!
//! The alert level is an append-only counter ledger. Named states split the
//! counter range into bands by threshold; exactly one state is current once
//! any in-game state exists.

pub mod engine;
pub mod model;

pub use engine::AlertEngine;
pub use model::*;
