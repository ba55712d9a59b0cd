//! Alert Control - alert level state engine and device router
//!
//! Drives the alert level of a live game and keeps the physical devices of
//! the venue in sync with it.
//!
//! # Overview
//!
//! - An append-only counter ledger banded into ordered alert states, with
//!   exactly one current state at any time
//! - Normalization of device replies arriving on `ask.<type>.<uid>.<command>`
//! - Config sync: smart devices get their stored configuration pushed when
//!   their reported hash differs, simple devices get the configuration of the
//!   current alert state broadcast on every state change
//! - MQTT transport with reconnection, bounded publishing and periodic pings
//!
//! # Quick Start
//!
//! ```rust
//! use alert_control::config::ControlConfig;
//! use alert_control::state::{AlertEngine, CounterRequest};
//! use alert_control::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ControlConfig::from_toml_str(r#"
//! [service]
//! id = "controller-1"
//!
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//!
//! [[states]]
//! name = "green"
//! threshold = 0
//! order = 1
//! current = true
//!
//! [[states]]
//! name = "red"
//! threshold = 100
//! order = 2
//! "#)?;
//!
//! let store = Arc::new(MemoryStore::from_config(&config)?);
//! let engine = AlertEngine::new(store, config.alert.clone());
//!
//! engine.append_counter(CounterRequest::absolute(120), true).await?;
//! assert_eq!(engine.get_current_state().await?.name, "red");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod router;
pub mod service;
pub mod state;
pub mod storage;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ControlConfig};
pub use error::{ControlError, ControlResult};
pub use router::{ConfigSyncCoordinator, DeviceRouter};
pub use service::{ControlService, LifecycleError};
pub use state::AlertEngine;
pub use storage::MemoryStore;
pub use transport::mqtt::MqttClient;
