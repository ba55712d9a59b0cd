//! Health check HTTP server for container orchestration
//!
//! Exposes liveness, readiness, detailed health and the metrics snapshot
//! for operators and orchestration platforms.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// Seconds without a handled device message before processing is stale
const MESSAGE_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    service_id: String,
    port: u16,
    mqtt_connected: Arc<AtomicBool>,
    last_message_handled: Arc<AtomicU64>,
    additional_checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(service_id: String, port: u16) -> Self {
        Self {
            service_id,
            port,
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            last_message_handled: Arc::new(AtomicU64::new(0)),
            additional_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Record the unix time of the last handled device message
    pub fn set_last_message_handled(&self, timestamp: u64) {
        self.last_message_handled.store(timestamp, Ordering::Relaxed);
    }

    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// HTTP routes served by [`HealthServer::start`]
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self;

        // GET /health - detailed health status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status().await;
                    let status_code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&status),
                        status_code,
                    ))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - readiness probe, ready once the broker link is up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = ready_server.mqtt_connected.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), status_code)
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Message, MQTT, device and alert state metrics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
    }

    /// Serve the health endpoints until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();

        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert(
            "message_processing".to_string(),
            self.check_message_processing_health(),
        );
        checks.insert(
            "alert_state".to_string(),
            check_alert_state(&snapshot.alert.current_state, now),
        );

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        metrics().update_health_status(overall_healthy);

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service_id: self.service_id.clone(),
            alert_state: snapshot.alert.current_state,
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        if self.mqtt_connected.load(Ordering::Relaxed) {
            HealthCheck::healthy("MQTT connection established")
        } else {
            HealthCheck::new("unhealthy", "MQTT connection failed or disconnected")
        }
    }

    fn check_message_processing_health(&self) -> HealthCheck {
        let now = current_timestamp();
        let last_message = self.last_message_handled.load(Ordering::Relaxed);

        if last_message == 0 {
            HealthCheck::healthy("No device messages handled yet")
        } else if now.saturating_sub(last_message) > MESSAGE_STALENESS_THRESHOLD_SECONDS {
            let stale_duration = now - last_message;
            HealthCheck::new(
                "stale",
                format!("No device messages for {stale_duration} seconds"),
            )
        } else {
            HealthCheck::healthy("Recent device traffic")
        }
    }
}

fn check_alert_state(current_state: &str, now: u64) -> HealthCheck {
    if current_state.is_empty() {
        HealthCheck {
            status: "unhealthy".to_string(),
            message: Some("No current alert state".to_string()),
            last_check: now,
        }
    } else {
        HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!("Current alert state: {current_state}")),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new("healthy", message)
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service_id: String,
    alert_state: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_connection_status() {
        let health_server = HealthServer::new("ctrl".to_string(), 8080);
        assert_eq!(health_server.check_mqtt_health().status, "unhealthy");

        health_server.set_mqtt_connected(true);
        assert_eq!(health_server.check_mqtt_health().status, "healthy");
    }

    #[test]
    fn test_message_processing_staleness() {
        let health_server = HealthServer::new("ctrl".to_string(), 8080);
        assert_eq!(
            health_server.check_message_processing_health().status,
            "healthy"
        );

        let now = current_timestamp();
        health_server.set_last_message_handled(now);
        assert_eq!(
            health_server.check_message_processing_health().status,
            "healthy"
        );

        health_server.set_last_message_handled(now - 600);
        assert_eq!(
            health_server.check_message_processing_health().status,
            "stale"
        );
    }

    #[test]
    fn test_alert_state_check() {
        assert_eq!(check_alert_state("", 1).status, "unhealthy");
        let check = check_alert_state("green", 1);
        assert_eq!(check.status, "healthy");
        assert_eq!(check.message.as_deref(), Some("Current alert state: green"));
    }

    #[tokio::test]
    async fn test_additional_health_checks() {
        let health_server = HealthServer::new("ctrl".to_string(), 8080);

        health_server
            .add_health_check("store".to_string(), HealthCheck::healthy("ok"))
            .await;
        assert!(health_server.additional_checks.read().await.contains_key("store"));

        health_server.remove_health_check("store").await;
        assert!(!health_server.additional_checks.read().await.contains_key("store"));
    }

    #[tokio::test]
    async fn test_failing_custom_check_degrades_health() {
        let health_server = HealthServer::new("ctrl".to_string(), 8080);
        health_server.set_mqtt_connected(true);
        health_server
            .add_health_check("store".to_string(), HealthCheck::new("unhealthy", "down"))
            .await;

        let status = health_server.get_health_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.service_id, "ctrl");
        assert!(status.checks.contains_key("mqtt"));
        assert!(status.checks.contains_key("message_processing"));
        assert!(status.checks.contains_key("alert_state"));
    }

    #[tokio::test]
    async fn test_live_and_ready_routes() {
        let health_server = Arc::new(HealthServer::new("ctrl".to_string(), 8080));
        let routes = health_server.clone().routes();

        let live = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(live.status(), StatusCode::OK);

        let ready = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        health_server.set_mqtt_connected(true);
        let ready = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_route_serves_snapshot() {
        let routes = Arc::new(HealthServer::new("ctrl".to_string(), 8080)).routes();
        let response = warp::test::request().path("/metrics").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body.get("alert").is_some());
        assert!(body.get("mqtt").is_some());
    }
}
