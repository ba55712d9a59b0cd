//! Device message routing
//!
//! Inbound device messages flow parser → coordinator → transport. The
//! dispatcher owns the consumer loop and also reacts to alert state changes.

pub mod coordinator;
pub mod dispatcher;
pub mod parser;
pub mod pinger;

pub use coordinator::ConfigSyncCoordinator;
pub use dispatcher::DeviceRouter;
pub use parser::{decode_payload, DeviceEvent, MessageParser, ParsedMessage};
pub use pinger::{ping_all, Pinger};
