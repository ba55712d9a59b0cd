//! In-memory store seeded from configuration

use super::{AlertStore, DeviceStore, StoreError, StoreResult};
use crate::config::ControlConfig;
use crate::devices::{config_fingerprint, DeviceAttributes, DeviceConfigRecord, DeviceStatusRecord};
use crate::state::{AlertCounter, CurrentSwap, NewCounter, State, StatePatch};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type DeviceKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    /// Insertion order; the last entry is the newest
    counters: Vec<AlertCounter>,
    states: Vec<State>,
    devices: HashMap<DeviceKey, DeviceConfigRecord>,
    statuses: HashMap<DeviceKey, DeviceStatusRecord>,
    simple_configs: HashMap<(String, String), Value>,
}

impl Tables {
    fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s.name == name)
    }

    /// Uniqueness of name, order and in-game threshold against every state but `skip`
    fn check_unique(&self, candidate: &State, skip: Option<usize>) -> StoreResult<()> {
        for (index, other) in self.states.iter().enumerate() {
            if Some(index) == skip {
                continue;
            }
            if other.name == candidate.name {
                return Err(StoreError::UniqueViolation {
                    field: "name",
                    value: candidate.name.clone(),
                });
            }
            if other.order == candidate.order {
                return Err(StoreError::UniqueViolation {
                    field: "order",
                    value: candidate.order.to_string(),
                });
            }
            if candidate.is_in_game() && other.threshold == candidate.threshold {
                return Err(StoreError::UniqueViolation {
                    field: "threshold",
                    value: candidate.threshold.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Single-process store backing the binary and the tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding the seed tables of a validated configuration
    pub fn from_config(config: &ControlConfig) -> StoreResult<Self> {
        let mut tables = Tables::default();
        let now = Utc::now();

        for seed in &config.states {
            let current = seed.current;
            let mut state = seed.clone().into_state();
            state.current = current;
            tables.check_unique(&state, None)?;
            tables.states.push(state);
        }
        tables.states.sort_by_key(|s| s.order);

        for seed in &config.devices {
            let hash = seed
                .hash
                .clone()
                .unwrap_or_else(|| config_fingerprint(&seed.config));
            let record = DeviceConfigRecord {
                device_uid: seed.device_uid.clone(),
                attributes: DeviceAttributes {
                    name: seed.name.clone(),
                    device_type: seed.device_type.clone(),
                    device_addr: seed.device_addr.clone(),
                    timestamp: now,
                    ignored: seed.ignored,
                },
                config: seed.config.clone(),
                hash,
            };
            tables.devices.insert(
                (seed.device_type.clone(), seed.device_uid.clone()),
                record,
            );
        }

        for entry in &config.simple_configs {
            tables.simple_configs.insert(
                (entry.device_type.clone(), entry.state.clone()),
                entry.config.clone(),
            );
        }

        if let Some(value) = config.alert.initial_counter {
            tables.counters.push(AlertCounter {
                id: Uuid::new_v4(),
                value,
                comment: config.alert.default_comment.clone(),
                timestamp: now,
            });
        }

        debug!(
            states = tables.states.len(),
            devices = tables.devices.len(),
            simple_configs = tables.simple_configs.len(),
            "Seeded in-memory store"
        );

        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Register or replace a smart device configuration
    pub async fn upsert_device(&self, record: DeviceConfigRecord) {
        let key = (
            record.attributes.device_type.clone(),
            record.device_uid.clone(),
        );
        self.tables.write().await.devices.insert(key, record);
    }

    pub async fn set_simple_config(&self, device_type: &str, state_name: &str, config: Value) {
        self.tables.write().await.simple_configs.insert(
            (device_type.to_string(), state_name.to_string()),
            config,
        );
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn last_counter(&self) -> StoreResult<Option<AlertCounter>> {
        Ok(self.tables.read().await.counters.last().cloned())
    }

    async fn append_counter(&self, counter: NewCounter) -> StoreResult<AlertCounter> {
        let record = AlertCounter {
            id: Uuid::new_v4(),
            value: counter.value,
            comment: counter.comment,
            timestamp: Utc::now(),
        };
        self.tables.write().await.counters.push(record.clone());
        Ok(record)
    }

    async fn list_counters(&self) -> StoreResult<Vec<AlertCounter>> {
        let tables = self.tables.read().await;
        Ok(tables.counters.iter().rev().cloned().collect())
    }

    async fn state_by_name(&self, name: &str) -> StoreResult<Option<State>> {
        let tables = self.tables.read().await;
        Ok(tables.states.iter().find(|s| s.name == name).cloned())
    }

    async fn state_for_counter(&self, value: i64) -> StoreResult<Option<State>> {
        let tables = self.tables.read().await;
        Ok(tables
            .states
            .iter()
            .filter(|s| s.is_in_game() && s.threshold <= value)
            .max_by_key(|s| s.threshold)
            .cloned())
    }

    async fn current_state(&self) -> StoreResult<Option<State>> {
        let tables = self.tables.read().await;
        Ok(tables.states.iter().find(|s| s.current).cloned())
    }

    async fn list_states(&self) -> StoreResult<Vec<State>> {
        Ok(self.tables.read().await.states.clone())
    }

    async fn insert_state(&self, state: State) -> StoreResult<State> {
        let mut tables = self.tables.write().await;
        tables.check_unique(&state, None)?;
        tables.states.push(state.clone());
        tables.states.sort_by_key(|s| s.order);
        Ok(state)
    }

    async fn update_state_fields(&self, name: &str, patch: &StatePatch) -> StoreResult<State> {
        let mut tables = self.tables.write().await;
        let index = tables
            .state_index(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let mut updated = tables.states[index].clone();
        patch.fields_only().apply_to(&mut updated);
        tables.check_unique(&updated, Some(index))?;

        if updated.name != name {
            let renamed: Vec<_> = tables
                .simple_configs
                .keys()
                .filter(|(_, state)| state == name)
                .cloned()
                .collect();
            for key in renamed {
                if let Some(config) = tables.simple_configs.remove(&key) {
                    tables
                        .simple_configs
                        .insert((key.0, updated.name.clone()), config);
                }
            }
        }

        tables.states[index] = updated.clone();
        tables.states.sort_by_key(|s| s.order);
        Ok(updated)
    }

    async fn swap_current(&self, name: &str) -> StoreResult<CurrentSwap> {
        let mut tables = self.tables.write().await;
        let index = tables
            .state_index(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let previous = tables.states.iter().find(|s| s.current).cloned();
        for state in tables.states.iter_mut() {
            state.current = false;
        }
        tables.states[index].current = true;

        Ok(CurrentSwap {
            previous,
            current: tables.states[index].clone(),
        })
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn device_config(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceConfigRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .get(&(device_type.to_string(), device_uid.to_string()))
            .cloned())
    }

    async fn write_status(&self, record: DeviceStatusRecord) -> StoreResult<()> {
        let key = (record.device_type.clone(), record.device_uid.clone());
        self.tables.write().await.statuses.insert(key, record);
        Ok(())
    }

    async fn device_status(
        &self,
        device_type: &str,
        device_uid: &str,
    ) -> StoreResult<Option<DeviceStatusRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .statuses
            .get(&(device_type.to_string(), device_uid.to_string()))
            .cloned())
    }

    async fn simple_config(
        &self,
        device_type: &str,
        state_name: &str,
    ) -> StoreResult<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .simple_configs
            .get(&(device_type.to_string(), state_name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::from_config(&ControlConfig::test_config()).unwrap()
    }

    #[tokio::test]
    async fn test_seeded_states_are_ordered() {
        let store = store();
        let names: Vec<_> = store
            .list_states()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["white", "green", "red"]);
        assert_eq!(store.current_state().await.unwrap().unwrap().name, "green");
    }

    #[tokio::test]
    async fn test_counters_newest_first() {
        let store = store();
        for value in [1, 2, 3] {
            store
                .append_counter(NewCounter {
                    value,
                    comment: "t".to_string(),
                })
                .await
                .unwrap();
        }
        let values: Vec<_> = store
            .list_counters()
            .await
            .unwrap()
            .iter()
            .map(|c| c.value)
            .collect();
        assert_eq!(values, vec![3, 2, 1]);
        assert_eq!(store.last_counter().await.unwrap().unwrap().value, 3);
    }

    #[tokio::test]
    async fn test_state_for_counter_skips_out_of_game() {
        let store = store();
        assert!(store.state_for_counter(-5).await.unwrap().is_none());
        assert_eq!(store.state_for_counter(0).await.unwrap().unwrap().name, "green");
        assert_eq!(store.state_for_counter(99).await.unwrap().unwrap().name, "green");
        assert_eq!(store.state_for_counter(100).await.unwrap().unwrap().name, "red");
    }

    #[tokio::test]
    async fn test_swap_current_is_exclusive() {
        let store = store();
        let swap = store.swap_current("red").await.unwrap();
        assert_eq!(swap.previous.unwrap().name, "green");
        assert_eq!(swap.current.name, "red");

        let current: Vec<_> = store
            .list_states()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.current)
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].name, "red");
    }

    #[tokio::test]
    async fn test_swap_unknown_state() {
        let store = store();
        let err = store.swap_current("purple").await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("purple".to_string()));
    }

    #[tokio::test]
    async fn test_update_rejects_duplicate_threshold() {
        let store = store();
        let err = store
            .update_state_fields("red", &StatePatch::threshold(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { field: "threshold", .. }));
    }

    #[tokio::test]
    async fn test_rename_carries_simple_configs() {
        let store = store();
        store
            .set_simple_config("light", "red", json!({"rgb": "ff0000"}))
            .await;
        let patch = StatePatch {
            name: Some("crimson".to_string()),
            ..Default::default()
        };
        store.update_state_fields("red", &patch).await.unwrap();
        assert!(store.simple_config("light", "red").await.unwrap().is_none());
        assert_eq!(
            store.simple_config("light", "crimson").await.unwrap().unwrap()["rgb"],
            "ff0000"
        );
    }

    #[tokio::test]
    async fn test_device_seed_fingerprint() {
        let mut config = ControlConfig::test_config();
        config.devices.push(crate::config::DeviceSeed {
            device_type: "lock".to_string(),
            device_uid: "A1".to_string(),
            name: "armory".to_string(),
            device_addr: None,
            ignored: false,
            config: json!({"closed": true}),
            hash: None,
        });
        let store = MemoryStore::from_config(&config).unwrap();
        let record = store.device_config("lock", "A1").await.unwrap().unwrap();
        assert_eq!(record.hash, config_fingerprint(&json!({"closed": true})));
        assert_eq!(record.device_type(), "lock");
        assert!(store.device_config("lock", "B2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initial_counter_seeded() {
        let mut config = ControlConfig::test_config();
        config.alert.initial_counter = Some(42);
        let store = MemoryStore::from_config(&config).unwrap();
        let counter = store.last_counter().await.unwrap().unwrap();
        assert_eq!(counter.value, 42);
        assert_eq!(counter.comment, "changed by system");
    }
}
