//! Mock implementations for testing
//!
//! Provides a recording [`MockTransport`] and a [`ConflictingStore`] that
//! injects transaction conflicts, so the router and engine can be exercised
//! without a broker or a database.

use crate::devices::{DeviceConfigRecord, DeviceStatusRecord};
use crate::protocol::Command;
use crate::state::{AlertCounter, CurrentSwap, NewCounter, State, StatePatch};
use crate::storage::{AlertStore, DeviceStore, MemoryStore, StoreError, StoreResult};
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One publish recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub retry: bool,
}

impl PublishedMessage {
    /// Payload decoded as JSON, `Null` when it is not JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

/// Mock transport recording every publish
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<Command>>>,
    pub message_sender: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    should_fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    /// Make every following connect and publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.should_fail.load(Ordering::SeqCst)
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Published messages whose routing key is exactly `routing_key`
    pub async fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }

    /// Deliver a message through the registered sender, as the broker would
    pub async fn inject(&self, message: InboundMessage) -> bool {
        let sender = self.message_sender.lock().await.clone();
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.failing() {
            Err(MqttError::ConnectionFailedStr(
                "Mock connection failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        retry: bool,
    ) -> Result<(), Self::Error> {
        if self.failing() {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        self.published.lock().await.push(PublishedMessage {
            routing_key: routing_key.to_string(),
            payload,
            retry,
        });
        Ok(())
    }

    async fn subscribe(&mut self, commands: &[Command]) -> Result<(), Self::Error> {
        self.subscriptions.lock().await.extend_from_slice(commands);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.failing()
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.failing() {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        } else {
            Some(ConnectionState::Connected)
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut message_sender) = self.message_sender.try_lock() {
            *message_sender = Some(sender);
        }
    }
}

/// Store wrapper whose next `swap_current` calls fail with a conflict
pub struct ConflictingStore {
    inner: MemoryStore,
    remaining_conflicts: AtomicU32,
    swap_calls: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: MemoryStore, conflicts: u32) -> Self {
        Self {
            inner,
            remaining_conflicts: AtomicU32::new(conflicts),
            swap_calls: AtomicU32::new(0),
        }
    }

    /// Number of `swap_current` calls seen, failed ones included
    pub fn swap_calls(&self) -> u32 {
        self.swap_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl AlertStore for ConflictingStore {
    async fn last_counter(&self) -> StoreResult<Option<AlertCounter>> {
        self.inner.last_counter().await
    }

    async fn append_counter(&self, counter: NewCounter) -> StoreResult<AlertCounter> {
        self.inner.append_counter(counter).await
    }

    async fn list_counters(&self) -> StoreResult<Vec<AlertCounter>> {
        self.inner.list_counters().await
    }

    async fn state_by_name(&self, name: &str) -> StoreResult<Option<State>> {
        self.inner.state_by_name(name).await
    }

    async fn state_for_counter(&self, value: i64) -> StoreResult<Option<State>> {
        self.inner.state_for_counter(value).await
    }

    async fn current_state(&self) -> StoreResult<Option<State>> {
        self.inner.current_state().await
    }

    async fn list_states(&self) -> StoreResult<Vec<State>> {
        self.inner.list_states().await
    }

    async fn insert_state(&self, state: State) -> StoreResult<State> {
        self.inner.insert_state(state).await
    }

    async fn update_state_fields(&self, name: &str, patch: &StatePatch) -> StoreResult<State> {
        self.inner.update_state_fields(name, patch).await
    }

    async fn swap_current(&self, name: &str) -> StoreResult<CurrentSwap> {
        self.swap_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .remaining_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict(format!(
                "injected conflict swapping to {name}"
            )));
        }
        self.inner.swap_current(name).await
    }
}

#[async_trait]
impl DeviceStore for ConflictingStore {
    async fn device_config(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceConfigRecord>> {
        self.inner.device_config(device_type, device_uid).await
    }

    async fn write_status(&self, record: DeviceStatusRecord) -> StoreResult<()> {
        self.inner.write_status(record).await
    }

    async fn device_status(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceStatusRecord>> {
        self.inner.device_status(device_type, device_uid).await
    }

    async fn simple_config(
        &self,
        device_type: &str,
        state_name: &str,
    ) -> StoreResult<Option<Value>> {
        self.inner.simple_config(device_type, state_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;

    #[tokio::test]
    async fn test_mock_transport_records_publishes() {
        let transport = MockTransport::new();
        transport
            .publish("lock.A1.cup", b"{\"a\":1}".to_vec(), true)
            .await
            .unwrap();

        let published = transport.published_to("lock.A1.cup").await;
        assert_eq!(published.len(), 1);
        assert!(published[0].retry);
        assert_eq!(published[0].json()["a"], 1);
    }

    #[tokio::test]
    async fn test_mock_transport_failure_toggle() {
        let transport = MockTransport::with_failure();
        assert!(transport.publish("x.y.z", vec![], false).await.is_err());
        assert!(!transport.is_connected());

        transport.set_failing(false);
        assert!(transport.publish("x.y.z", vec![], false).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_inject() {
        let transport = MockTransport::new();
        assert!(!transport.inject(InboundMessage::text("ask.lock.A1.sup", "{}")).await);

        let (tx, mut rx) = mpsc::channel(1);
        transport.set_message_sender(tx);
        assert!(transport.inject(InboundMessage::text("ask.lock.A1.sup", "{}")).await);
        assert_eq!(rx.recv().await.unwrap().routing_key, "ask.lock.A1.sup");
    }

    #[tokio::test]
    async fn test_conflicting_store_injects_then_delegates() {
        let inner = MemoryStore::from_config(&ControlConfig::test_config()).unwrap();
        let store = ConflictingStore::new(inner, 1);

        assert!(matches!(
            store.swap_current("red").await,
            Err(StoreError::Conflict(_))
        ));
        let swap = store.swap_current("red").await.unwrap();
        assert_eq!(swap.current.name, "red");
        assert_eq!(store.swap_calls(), 2);
    }
}
