//! Persistence contract for the alert ledger, states and device records
//!
//! The core only talks to storage through [`AlertStore`] and [`DeviceStore`].
//! [`MemoryStore`] implements both and is seeded from the configuration file.

use crate::devices::{DeviceConfigRecord, DeviceStatusRecord};
use crate::state::{AlertCounter, CurrentSwap, NewCounter, State, StatePatch};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Storage layer errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {field} = {value}")]
    UniqueViolation { field: &'static str, value: String },

    /// Concurrent writer touched the same rows; the transaction was rolled back
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counter ledger and state table
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Most recent counter entry
    async fn last_counter(&self) -> StoreResult<Option<AlertCounter>>;

    /// Persist a new counter; the store assigns id and timestamp
    async fn append_counter(&self, counter: NewCounter) -> StoreResult<AlertCounter>;

    /// All counter entries, newest first
    async fn list_counters(&self) -> StoreResult<Vec<AlertCounter>>;

    async fn state_by_name(&self, name: &str) -> StoreResult<Option<State>>;

    /// In-game state with the greatest threshold not above `value`
    async fn state_for_counter(&self, value: i64) -> StoreResult<Option<State>>;

    async fn current_state(&self) -> StoreResult<Option<State>>;

    /// All states ordered by `order`
    async fn list_states(&self) -> StoreResult<Vec<State>>;

    /// Insert a new state, enforcing unique name, order and in-game threshold
    async fn insert_state(&self, state: State) -> StoreResult<State>;

    /// Write the field changes of `patch`; the `current` flag is ignored
    async fn update_state_fields(&self, name: &str, patch: &StatePatch) -> StoreResult<State>;

    /// Atomically clear `current` on every state and set it on `name`
    async fn swap_current(&self, name: &str) -> StoreResult<CurrentSwap>;
}

/// Device configuration, liveness and per-state simple configuration
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn device_config(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceConfigRecord>>;

    async fn write_status(&self, record: DeviceStatusRecord) -> StoreResult<()>;

    async fn device_status(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceStatusRecord>>;

    /// Configuration for a simple device type while `state_name` is current
    async fn simple_config(&self, device_type: &str, state_name: &str)
        -> StoreResult<Option<Value>>;
}
