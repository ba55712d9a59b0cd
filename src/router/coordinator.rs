//! Configuration sync between the server and devices
//!
//! Smart devices report the hash of the configuration they run; a mismatch
//! with the stored hash triggers a full push. Simple devices have no hash and
//! receive the configuration attached to the current alert state.

use super::parser::DeviceEvent;
use crate::devices::DeviceStatusRecord;
use crate::error::ControlResult;
use crate::observability::metrics;
use crate::protocol::{
    classify, device_task_id, now_timestamp, DeviceKind, OutboundPacket, SimpleDevice,
    BROADCAST_UID, SIMPLE_TASK_ID,
};
use crate::state::{AlertEngine, State};
use crate::storage::{AlertStore, DeviceStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Decides which configuration packets go back to devices
pub struct ConfigSyncCoordinator<S: AlertStore + DeviceStore + ?Sized> {
    engine: AlertEngine<S>,
    store: Arc<S>,
}

impl<S: AlertStore + DeviceStore + ?Sized> Clone for ConfigSyncCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: AlertStore + DeviceStore + ?Sized> ConfigSyncCoordinator<S> {
    pub fn new(engine: AlertEngine<S>) -> Self {
        let store = Arc::clone(engine.store());
        Self { engine, store }
    }

    pub fn engine(&self) -> &AlertEngine<S> {
        &self.engine
    }

    /// Packet to send back for a `cup`/`sup` event, if any
    pub async fn on_status_update(&self, event: &DeviceEvent) -> ControlResult<Option<OutboundPacket>> {
        match classify(&event.device_type) {
            DeviceKind::Smart(_) => self.smart_update(event).await,
            DeviceKind::Simple(_) | DeviceKind::Unknown => {
                self.simple_packet(&event.device_type, Some(&event.device_uid))
                    .await
            }
        }
    }

    /// Config packets for every simple device type under the current state
    pub async fn broadcast_simple_configs(&self) -> ControlResult<Vec<OutboundPacket>> {
        let mut packets = Vec::new();
        for device in SimpleDevice::ALL {
            if let Some(packet) = self.simple_packet(device.as_str(), None).await? {
                packets.push(packet);
            }
        }
        debug!(packets = packets.len(), "Simple device configs prepared");
        Ok(packets)
    }

    /// Write a liveness record for any device message
    pub async fn record_liveness(&self, event: &DeviceEvent, command: &str) -> ControlResult<()> {
        let record = DeviceStatusRecord {
            device_type: event.device_type.clone(),
            device_uid: event.device_uid.clone(),
            command: command.to_string(),
            hash: event.hash.clone(),
            timestamp: if event.timestamp > 0 {
                event.timestamp
            } else {
                now_timestamp()
            },
            datahold: event.datahold.clone(),
        };
        self.store.write_status(record).await?;
        metrics().device_message(&event.device_type);
        Ok(())
    }

    /// Configuration a simple device type receives under the current state.
    ///
    /// `None` when no state is current or nothing is configured.
    pub async fn simple_config(&self, device_type: &str) -> ControlResult<Option<Value>> {
        let Some(current) = self.store.current_state().await? else {
            debug!(device_type, "No current state, no simple config");
            return Ok(None);
        };

        if classify(device_type) == DeviceKind::Simple(SimpleDevice::Scale) {
            return self.scale_config(&current).await;
        }
        Ok(self.store.simple_config(device_type, &current.name).await?)
    }

    async fn smart_update(&self, event: &DeviceEvent) -> ControlResult<Option<OutboundPacket>> {
        let stored = self
            .store
            .device_config(&event.device_type, &event.device_uid)
            .await?;

        let Some(record) = stored else {
            debug!(
                device_type = %event.device_type,
                device_uid = %event.device_uid,
                "No stored config for device"
            );
            self.record_liveness(event, &event.command).await?;
            return Ok(None);
        };

        if record.is_ignored() {
            debug!(
                device_type = %event.device_type,
                device_uid = %event.device_uid,
                "Device is ignored, not pushing config"
            );
            self.record_liveness(event, &event.command).await?;
            return Ok(None);
        }

        if record.hash == event.hash {
            self.record_liveness(event, "sup").await?;
            metrics().config_unchanged(&event.device_type);
            return Ok(None);
        }

        info!(
            device_type = %event.device_type,
            device_uid = %event.device_uid,
            reported = %event.hash,
            stored = %record.hash,
            "Device config out of date, pushing"
        );
        metrics().device_message(&event.device_type);
        metrics().config_pushed(&event.device_type);
        Ok(Some(OutboundPacket::config_push(
            &event.device_type,
            &event.device_uid,
            record.config,
            device_task_id(&event.device_uid),
            Some(record.hash),
        )))
    }

    async fn simple_packet(
        &self,
        device_type: &str,
        requesting_uid: Option<&str>,
    ) -> ControlResult<Option<OutboundPacket>> {
        let Some(config) = self.simple_config(device_type).await? else {
            return Ok(None);
        };

        let target_uid = match (classify(device_type), requesting_uid) {
            (DeviceKind::Simple(SimpleDevice::Power | SimpleDevice::Scale), _) | (_, None) => {
                BROADCAST_UID
            }
            (_, Some(uid)) => uid,
        };

        metrics().config_pushed(device_type);
        Ok(Some(OutboundPacket::config_push(
            device_type,
            target_uid,
            config,
            SIMPLE_TASK_ID.to_string(),
            None,
        )))
    }

    /// `{borders, level, state}` where borders are the in-game thresholds and
    /// level is the latest counter clamped into them
    async fn scale_config(&self, current: &State) -> ControlResult<Option<Value>> {
        let mut borders: Vec<i64> = self
            .engine
            .list_states()
            .await?
            .iter()
            .filter(|s| s.is_in_game())
            .map(|s| s.threshold)
            .collect();
        borders.sort_unstable();

        let (Some(&low), Some(&high)) = (borders.first(), borders.last()) else {
            return Ok(None);
        };

        let level = self
            .engine
            .last_counter()
            .await?
            .map(|c| c.value)
            .unwrap_or(low)
            .clamp(low, high);

        Ok(Some(json!({
            "borders": borders,
            "level": level,
            "state": current.name,
        })))
    }
}
