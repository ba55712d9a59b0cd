//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! message handling, MQTT transport, device traffic and alert state activity.

use crate::protocol::classify;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Device stats key shared by every unrecognised device type
pub const UNKNOWN_DEVICE_TYPE: &str = "unknown";

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Message handling (atomic for high frequency)
    messages_handled: AtomicU64,
    handler_failures: AtomicU64,
    malformed_routing_keys: AtomicU64,
    payload_decode_failures: AtomicU64,
    passthrough_dropped: AtomicU64,
    unknown_device_types: AtomicU64,

    // MQTT metrics (atomic for high frequency)
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Alert state engine
    counters_appended: AtomicU64,
    state_transitions: AtomicU64,
    swap_conflicts: AtomicU64,
    current_alert_state: Mutex<String>,

    // Handling times in milliseconds
    handling_times: Mutex<Vec<u64>>,

    // Per device type traffic
    device_stats: Mutex<HashMap<String, DeviceTypeStats>>,

    // Lifecycle metrics
    service_state: Mutex<String>,
    uptime_start: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            messages_handled: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            malformed_routing_keys: AtomicU64::new(0),
            payload_decode_failures: AtomicU64::new(0),
            passthrough_dropped: AtomicU64::new(0),
            unknown_device_types: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            counters_appended: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            swap_conflicts: AtomicU64::new(0),
            current_alert_state: Mutex::new(String::new()),
            handling_times: Mutex::new(Vec::new()),
            device_stats: Mutex::new(HashMap::new()),
            service_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Message handling metrics
    pub fn message_handled(&self, duration: Duration, success: bool) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.record_handling_time(duration);
    }

    pub fn malformed_routing_key(&self) {
        self.malformed_routing_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload_decode_failure(&self) {
        self.payload_decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passthrough_dropped(&self) {
        self.passthrough_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_device_type(&self) {
        self.unknown_device_types.fetch_add(1, Ordering::Relaxed);
    }

    fn record_handling_time(&self, duration: Duration) {
        if let Ok(mut times) = self.handling_times.lock() {
            times.push(duration.as_millis() as u64);

            // Limit to last 1000 measurements to prevent unbounded growth
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Device traffic metrics; unrecognised types share one bucket
    fn with_device_stats(&self, device_type: &str, update: impl FnOnce(&mut DeviceTypeStats)) {
        let device_type = if classify(device_type).is_unknown() {
            UNKNOWN_DEVICE_TYPE
        } else {
            device_type
        };
        if let Ok(mut stats) = self.device_stats.lock() {
            let entry = stats
                .entry(device_type.to_string())
                .or_insert_with(|| DeviceTypeStats {
                    device_type: device_type.to_string(),
                    ..Default::default()
                });
            update(entry);
        }
    }

    pub fn device_message(&self, device_type: &str) {
        self.with_device_stats(device_type, |stats| {
            stats.messages += 1;
            stats.last_seen = current_timestamp();
        });
    }

    pub fn config_pushed(&self, device_type: &str) {
        self.with_device_stats(device_type, |stats| stats.config_pushes += 1);
    }

    pub fn config_unchanged(&self, device_type: &str) {
        self.with_device_stats(device_type, |stats| stats.hash_matches += 1);
    }

    pub fn ping_sent(&self, device_type: &str) {
        self.with_device_stats(device_type, |stats| stats.pings += 1);
    }

    // Alert state metrics
    pub fn counter_appended(&self) {
        self.counters_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swap_conflict(&self) {
        self.swap_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_alert_state(&self, state: &str) {
        if let Ok(mut current_state) = self.current_alert_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Lifecycle metrics
    pub fn set_service_state(&self, state: &str) {
        if let Ok(mut current_state) = self.service_state.lock() {
            *current_state = state.to_string();
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.messages_handled,
            &self.handler_failures,
            &self.malformed_routing_keys,
            &self.payload_decode_failures,
            &self.passthrough_dropped,
            &self.unknown_device_types,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.connection_start_time,
            &self.counters_appended,
            &self.state_transitions,
            &self.swap_conflicts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.handling_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.device_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.current_alert_state.lock() {
            state.clear();
        }
        if let Ok(mut state) = self.service_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate handling time statistics (avg, p50, p95, p99)
    fn handling_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.handling_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn read_string(value: &Mutex<String>) -> String {
        value
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_handling_time_ms, p50, p95, p99) = self.handling_time_statistics();
        let devices = self
            .device_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            messages: MessageMetrics {
                messages_handled: self.messages_handled.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                malformed_routing_keys: self.malformed_routing_keys.load(Ordering::Relaxed),
                payload_decode_failures: self.payload_decode_failures.load(Ordering::Relaxed),
                passthrough_dropped: self.passthrough_dropped.load(Ordering::Relaxed),
                unknown_device_types: self.unknown_device_types.load(Ordering::Relaxed),
                avg_handling_time_ms,
                handling_time_p50_ms: p50,
                handling_time_p95_ms: p95,
                handling_time_p99_ms: p99,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            alert: AlertMetrics {
                current_state: Self::read_string(&self.current_alert_state),
                counters_appended: self.counters_appended.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                swap_conflicts: self.swap_conflicts.load(Ordering::Relaxed),
            },
            devices,
            lifecycle: LifecycleMetrics {
                service_state: Self::read_string(&self.service_state),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub mqtt: MqttMetrics,
    pub alert: AlertMetrics,
    pub devices: HashMap<String, DeviceTypeStats>,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub messages_handled: u64,
    pub handler_failures: u64,
    pub malformed_routing_keys: u64,
    pub payload_decode_failures: u64,
    pub passthrough_dropped: u64,
    pub unknown_device_types: u64,
    pub avg_handling_time_ms: f64,
    pub handling_time_p50_ms: f64,
    pub handling_time_p95_ms: f64,
    pub handling_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct AlertMetrics {
    pub current_state: String,
    pub counters_appended: u64,
    pub state_transitions: u64,
    pub swap_conflicts: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceTypeStats {
    pub device_type: String,
    pub messages: u64,
    pub config_pushes: u64,
    pub hash_matches: u64,
    pub pings: u64,
    pub last_seen: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub service_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_message_metrics() {
        let collector = MetricsCollector::new();

        collector.message_handled(Duration::from_millis(20), true);
        collector.message_handled(Duration::from_millis(40), false);
        collector.payload_decode_failure();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.messages.messages_handled, 2);
        assert_eq!(metrics.messages.handler_failures, 1);
        assert_eq!(metrics.messages.payload_decode_failures, 1);
        assert!(metrics.messages.avg_handling_time_ms > 25.0);
    }

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_published();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.messages_published, 1);
        assert!(metrics.mqtt.connected);
    }

    #[test]
    fn test_device_metrics() {
        let collector = MetricsCollector::new();

        collector.device_message("lock");
        collector.device_message("lock");
        collector.config_pushed("lock");
        collector.config_unchanged("lock");
        collector.ping_sent("power");

        let metrics = collector.get_metrics();
        let lock = metrics.devices.get("lock").unwrap();
        assert_eq!(lock.messages, 2);
        assert_eq!(lock.config_pushes, 1);
        assert_eq!(lock.hash_matches, 1);
        assert!(lock.last_seen > 0);
        assert_eq!(metrics.devices.get("power").unwrap().pings, 1);
    }

    #[test]
    fn test_unrecognised_device_types_share_bucket() {
        let collector = MetricsCollector::new();

        collector.device_message("toaster");
        collector.device_message("kettle");
        collector.ping_sent("toaster");
        collector.device_message("light");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.devices.len(), 2);
        assert!(!metrics.devices.contains_key("toaster"));
        let unknown = metrics.devices.get(UNKNOWN_DEVICE_TYPE).unwrap();
        assert_eq!(unknown.device_type, "unknown");
        assert_eq!(unknown.messages, 2);
        assert_eq!(unknown.pings, 1);
    }

    #[test]
    fn test_alert_state_transitions_count_changes_only() {
        let collector = MetricsCollector::new();

        collector.set_alert_state("green");
        collector.set_alert_state("green");
        collector.set_alert_state("red");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.alert.state_transitions, 2);
        assert_eq!(metrics.alert.current_state, "red");
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    collector_clone.mqtt_message_received();
                    collector_clone.mqtt_message_published();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.messages_received, 1000);
        assert_eq!(metrics.mqtt.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.counter_appended();
        collector.mqtt_connection_established();
        collector.device_message("terminal");

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.alert.counters_appended, 0);
        assert!(!metrics.mqtt.connected);
        assert!(metrics.devices.is_empty());
    }
}
