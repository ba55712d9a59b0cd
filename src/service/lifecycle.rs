//! Controller lifecycle management
//!
//! Startup order: seed the store, make sure an alert state is current,
//! connect the transport, bind the inbound queues, start the router, push
//! the simple device configs of the current state, then start the pinger.

use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::lifecycle_span;
use crate::observability::{metrics, HealthServer};
use crate::protocol::Command;
use crate::router::{ConfigSyncCoordinator, DeviceRouter, Pinger};
use crate::state::AlertEngine;
use crate::storage::{MemoryStore, StoreError};
use crate::transport::{InboundMessage, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Capacity of the channel between transport and router
const INBOUND_CHANNEL_CAPACITY: usize = 100;

/// How long background tasks get to stop after the shutdown signal
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Alert controller lifecycle with an injected transport
pub struct ControlService<T>
where
    T: Transport + 'static,
{
    config: ControlConfig,
    engine: AlertEngine<MemoryStore>,
    transport: Option<T>,
    running_transport: Option<Arc<T>>,
    health_server: Option<Arc<HealthServer>>,
    shutdown_tx: watch::Sender<bool>,
    router_handle: Option<JoinHandle<()>>,
    pinger_handle: Option<JoinHandle<()>>,
}

impl<T> ControlService<T>
where
    T: Transport + 'static,
{
    /// Build the service, seeding the in-memory store from `config`
    pub fn new(config: ControlConfig, transport: T) -> Result<Self, LifecycleError> {
        let store = MemoryStore::from_config(&config).map_err(LifecycleError::StoreSeed)?;
        let engine = AlertEngine::new(Arc::new(store), config.alert.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            engine,
            transport: Some(transport),
            running_transport: None,
            health_server: None,
            shutdown_tx,
            router_handle: None,
            pinger_handle: None,
        })
    }

    pub fn set_health_server(&mut self, health_server: Arc<HealthServer>) {
        self.health_server = Some(health_server);
    }

    pub fn engine(&self) -> &AlertEngine<MemoryStore> {
        &self.engine
    }

    pub fn service_id(&self) -> &str {
        &self.config.service.id
    }

    /// Transport handle once the service is running
    pub fn transport(&self) -> Option<&Arc<T>> {
        self.running_transport.as_ref()
    }

    /// Make sure an alert state is current before any device traffic
    pub async fn initialize(&mut self) -> Result<(), LifecycleError> {
        let span = lifecycle_span!(phase = "initialize", service_id = %self.config.service.id);
        async {
            metrics().set_service_state("initializing");
            match self.engine.ensure_current().await? {
                Some(state) => info!(state = %state.name, "Alert level ready"),
                None => warn!("Starting without a current alert state"),
            }
            metrics().set_service_state("initialized");
            Ok::<(), LifecycleError>(())
        }
        .instrument(span)
        .await
    }

    /// Connect, subscribe and spawn the router and pinger tasks
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        info!("Starting alert controller: {}", self.config.service.id);

        let mut transport = self.transport.take().ok_or(LifecycleError::AlreadyStarted)?;

        transport
            .connect()
            .await
            .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
        info!("Transport connected");

        let (message_tx, message_rx) = Self::create_inbound_channel();
        transport.set_message_sender(message_tx);

        transport
            .subscribe(&Command::INBOUND)
            .await
            .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
        info!(commands = Command::INBOUND.len(), "Subscribed to inbound queues");

        let transport = Arc::new(transport);
        if let Some(health_server) = &self.health_server {
            health_server.set_mqtt_connected(transport.is_connected());
        }

        let router = Arc::new(self.create_router(transport.clone()));
        let changes = self.engine.subscribe_changes();
        let router_task = router.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.router_handle = Some(tokio::spawn(async move {
            router_task.run(message_rx, changes, shutdown_rx).await;
        }));

        // Simple devices only learn their config through broadcasts
        match router.broadcast_current().await {
            Ok(published) => info!(published, "Initial simple config broadcast"),
            Err(e) => warn!(error = %e, "Initial simple config broadcast failed"),
        }

        if self.config.mqtt.ping_interval_secs > 0 {
            let pinger = Pinger::new(
                transport.clone(),
                Duration::from_secs(self.config.mqtt.ping_interval_secs),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.pinger_handle = Some(tokio::spawn(async move {
                pinger.run(shutdown_rx).await;
            }));
        }

        self.running_transport = Some(transport);
        metrics().set_service_state("running");
        info!("Alert controller started");
        Ok(())
    }

    /// Stop background tasks and disconnect the transport
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        info!("Shutting down alert controller: {}", self.config.service.id);
        metrics().set_service_state("stopping");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in [
            ("router", self.router_handle.take()),
            ("pinger", self.pinger_handle.take()),
        ] {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(TASK_SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !e.is_cancelled() => error!("{} task ended with error: {}", name, e),
                Ok(Err(_)) => {}
                Err(_) => warn!("{} task did not stop within the grace period", name),
            }
        }

        if let Some(transport) = self.running_transport.take() {
            match Arc::try_unwrap(transport) {
                Ok(mut transport) => {
                    transport
                        .disconnect()
                        .await
                        .map_err(|e| LifecycleError::TransportError(Box::new(e)))?;
                }
                Err(_) => warn!("Transport still shared at shutdown, skipping disconnect"),
            }
        }

        if let Some(health_server) = &self.health_server {
            health_server.set_mqtt_connected(false);
        }
        metrics().set_service_state("stopped");
        info!("Alert controller shutdown complete");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.router_handle.is_some()
    }

    /// Check if the transport connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        match (&self.transport, &self.running_transport) {
            (Some(transport), _) => transport.is_permanently_disconnected(),
            (None, Some(transport)) => transport.is_permanently_disconnected(),
            (None, None) => false,
        }
    }

    /// Mirror the transport connection onto the health server
    pub fn refresh_health(&self) {
        if let (Some(health_server), Some(transport)) =
            (&self.health_server, &self.running_transport)
        {
            health_server.set_mqtt_connected(transport.is_connected());
        }
    }

    fn create_inbound_channel() -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>)
    {
        mpsc::channel(INBOUND_CHANNEL_CAPACITY)
    }

    fn create_router(&self, transport: Arc<T>) -> DeviceRouter<T, MemoryStore> {
        let coordinator = ConfigSyncCoordinator::new(self.engine.clone());
        let router = DeviceRouter::new(transport, coordinator);
        match &self.health_server {
            Some(health_server) => router.with_health_server(health_server.clone()),
            None => router,
        }
    }
}

/// Controller lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error")]
    ConfigurationError(#[source] crate::config::ConfigError),
    #[error("Failed to seed store from configuration")]
    StoreSeed(#[source] StoreError),
    #[error("Alert engine error")]
    Engine(#[source] ControlError),
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Service already started")]
    AlreadyStarted,
}

impl From<crate::config::ConfigError> for LifecycleError {
    fn from(err: crate::config::ConfigError) -> Self {
        LifecycleError::ConfigurationError(err)
    }
}

impl From<ControlError> for LifecycleError {
    fn from(err: ControlError) -> Self {
        LifecycleError::Engine(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    fn service() -> ControlService<MockTransport> {
        let mut config = ControlConfig::test_config();
        config.mqtt.ping_interval_secs = 0;
        ControlService::new(config, MockTransport::new()).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_keeps_configured_current_state() {
        let mut service = service();
        service.initialize().await.unwrap();

        let current = service.engine().get_current_state().await.unwrap();
        assert_eq!(current.name, "green");
    }

    #[tokio::test]
    async fn test_start_subscribes_and_broadcasts() {
        let mut service = service();
        service.initialize().await.unwrap();
        service.start().await.unwrap();
        assert!(service.is_running());

        let transport = service.transport().unwrap().clone();
        assert_eq!(
            transport.subscriptions.lock().await.as_slice(),
            &Command::INBOUND
        );
        let published = transport.get_published().await;
        assert!(published.iter().all(|m| m.routing_key.ends_with(".all.cup")));

        drop(transport);
        service.shutdown().await.unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut service = service();
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(LifecycleError::AlreadyStarted)
        ));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut service =
            ControlService::new(ControlConfig::test_config(), MockTransport::with_failure())
                .unwrap();
        assert!(matches!(
            service.start().await,
            Err(LifecycleError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_without_start() {
        let mut service = service();
        assert!(service.shutdown().await.is_ok());
    }
}
