//! Periodic liveness probes
//!
//! Every known device type gets a `ping` addressed to all of its devices;
//! devices answer with `pong`, which the router records as liveness.

use crate::error::{ControlError, ControlResult};
use crate::observability::metrics;
use crate::protocol::{known_device_types, OutboundPacket};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Send one ping per device type. Fails only when every publish failed.
pub async fn ping_all<T: Transport + ?Sized>(transport: &T) -> ControlResult<usize> {
    let mut sent = 0;
    let mut last_error = None;

    for device_type in known_device_types() {
        let packet = OutboundPacket::ping(device_type);
        let payload = packet
            .to_bytes()
            .map_err(|e| ControlError::publish_failure(&packet.routing_key, e))?;

        match transport.publish(&packet.routing_key, payload, false).await {
            Ok(()) => {
                metrics().ping_sent(device_type);
                sent += 1;
            }
            Err(e) => {
                warn!(routing_key = %packet.routing_key, error = %e, "Ping publish failed");
                last_error = Some(ControlError::publish_failure(&packet.routing_key, e));
            }
        }
    }

    match last_error {
        Some(e) if sent == 0 => Err(e),
        _ => {
            debug!(sent, "Pinged device types");
            Ok(sent)
        }
    }
}

/// Background task pinging devices at a fixed interval
pub struct Pinger<T: Transport> {
    transport: Arc<T>,
    interval: Duration,
}

impl<T: Transport> Pinger<T> {
    pub fn new(transport: Arc<T>, interval: Duration) -> Self {
        Self {
            transport,
            interval,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Pinger started");

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("Pinger stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = ping_all(self.transport.as_ref()).await {
                        warn!(error = %e, "Device ping round failed");
                    }
                }
            }
        }
    }
}
