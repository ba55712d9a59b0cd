//! Controller lifecycle tests with an in-process transport

use alert_control::config::ControlConfig;
use alert_control::observability::HealthServer;
use alert_control::protocol::Command;
use alert_control::service::{ControlService, LifecycleError};
use alert_control::state::CounterRequest;
use alert_control::testing::MockTransport;
use alert_control::transport::InboundMessage;
use std::sync::Arc;
use std::time::Duration;

use test_helpers::{venue_config, VENUE_TOML};

async fn wait_for_count(transport: &MockTransport, routing_key: &str, count: usize) {
    for _ in 0..200 {
        if transport.published_to(routing_key).await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} publishes to {routing_key}");
}

#[tokio::test]
async fn test_full_lifecycle_routes_device_traffic() {
    let mut service = ControlService::new(venue_config(), MockTransport::new()).unwrap();
    service.initialize().await.unwrap();
    service.start().await.unwrap();

    let transport = service.transport().unwrap().clone();
    assert_eq!(
        transport.subscriptions.lock().await.as_slice(),
        &Command::INBOUND
    );

    // Startup broadcast: light and scale are configured for green, power is not
    assert_eq!(transport.published_to("light.all.cup").await.len(), 1);
    assert_eq!(transport.published_to("scale.all.cup").await.len(), 1);
    assert!(transport.published_to("power.all.cup").await.is_empty());

    assert!(
        transport
            .inject(InboundMessage::text("ask.lock.A1.cup", r#"{"hash": "old"}"#))
            .await
    );
    wait_for_count(&transport, "lock.A1.cup", 1).await;

    service
        .engine()
        .append_counter(CounterRequest::absolute(100), true)
        .await
        .unwrap();
    wait_for_count(&transport, "power.all.cup", 1).await;
    wait_for_count(&transport, "light.all.cup", 2).await;

    drop(transport);
    service.shutdown().await.unwrap();
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_initialize_restores_state_from_ledger() {
    let toml = VENUE_TOML.replace("current = true", "").replace(
        "[alert]\n",
        "[alert]\ninitial_counter = 70\n",
    );
    let config = ControlConfig::from_toml_str(&toml).unwrap();
    let mut service = ControlService::new(config, MockTransport::new()).unwrap();

    service.initialize().await.unwrap();

    let current = service.engine().get_current_state().await.unwrap();
    assert_eq!(current.name, "yellow");
    // Restoring from the ledger does not write a counter
    let counters = service.engine().list_counters().await.unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].value, 70);
}

#[tokio::test]
async fn test_initialize_bootstraps_lowest_band_without_ledger() {
    let toml = VENUE_TOML.replace("current = true", "");
    let config = ControlConfig::from_toml_str(&toml).unwrap();
    let mut service = ControlService::new(config, MockTransport::new()).unwrap();

    service.initialize().await.unwrap();

    assert_eq!(
        service.engine().get_current_state().await.unwrap().name,
        "green"
    );
    assert_eq!(
        service.engine().last_counter().await.unwrap().unwrap().value,
        0
    );
}

#[tokio::test]
async fn test_start_reports_transport_failure() {
    let mut service = ControlService::new(venue_config(), MockTransport::with_failure()).unwrap();

    let result = service.start().await;

    assert!(matches!(result, Err(LifecycleError::TransportError(_))));
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_health_server_tracks_link_and_traffic() {
    let mut service = ControlService::new(venue_config(), MockTransport::new()).unwrap();
    let health_server = Arc::new(HealthServer::new("integration-control".to_string(), 0));
    service.set_health_server(health_server.clone());
    service.initialize().await.unwrap();
    service.start().await.unwrap();

    let routes = health_server.clone().routes();
    let ready = warp::test::request().path("/ready").reply(&routes).await;
    assert_eq!(ready.status(), 200);

    service.shutdown().await.unwrap();
    let ready = warp::test::request().path("/ready").reply(&routes).await;
    assert_eq!(ready.status(), 503);
}

#[tokio::test]
async fn test_pinger_runs_when_enabled() {
    let toml = VENUE_TOML.replace("ping_interval_secs = 0", "ping_interval_secs = 1");
    let config = ControlConfig::from_toml_str(&toml).unwrap();
    let mut service = ControlService::new(config, MockTransport::new()).unwrap();
    service.start().await.unwrap();

    let transport = service.transport().unwrap().clone();
    wait_for_count(&transport, "lock.all.ping", 1).await;
    let ping = &transport.published_to("lock.all.ping").await[0];
    assert!(!ping.retry);

    drop(transport);
    service.shutdown().await.unwrap();
}
