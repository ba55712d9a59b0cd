//! Device channel protocol
//!
//! Device classification, routing key grammar and outbound packet shapes.

pub mod device;
pub mod packets;
pub mod topics;

pub use device::*;
pub use packets::*;
pub use topics::*;
