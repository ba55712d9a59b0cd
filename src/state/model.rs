//! Alert counter ledger and state records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Threshold of states that cannot be reached by the counter
pub const OUT_OF_GAME_THRESHOLD: i64 = -1;

/// One immutable entry of the alert counter ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertCounter {
    pub id: Uuid,
    pub value: i64,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

/// Counter entry before the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewCounter {
    pub value: i64,
    pub comment: String,
}

/// Caller request for a counter write.
///
/// With `relative` set, `value` is a delta applied to the latest counter,
/// added when `increase` is true and subtracted otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CounterRequest {
    pub value: i64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub relative: bool,
    #[serde(default)]
    pub increase: bool,
}

impl CounterRequest {
    pub fn absolute(value: i64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn increase_by(delta: i64) -> Self {
        Self {
            value: delta,
            relative: true,
            increase: true,
            comment: None,
        }
    }

    pub fn decrease_by(delta: i64) -> Self {
        Self {
            value: delta,
            relative: true,
            increase: false,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A named band of the alert spectrum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub id: Uuid,
    pub name: String,
    pub order: i32,
    pub info: String,
    pub threshold: i64,
    pub current: bool,
    pub counter_mod: i64,
}

impl State {
    /// Whether the counter can drive the game into this state
    pub fn is_in_game(&self) -> bool {
        self.threshold >= 0
    }
}

/// State definition as seeded from configuration or created by callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSeed {
    pub name: String,
    pub order: i32,
    #[serde(default)]
    pub info: String,
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default)]
    pub current: bool,
    #[serde(default = "default_counter_mod")]
    pub counter_mod: i64,
}

fn default_threshold() -> i64 {
    OUT_OF_GAME_THRESHOLD
}

fn default_counter_mod() -> i64 {
    5
}

impl StateSeed {
    /// Build the stored record; `current` is left for the engine to set
    pub fn into_state(self) -> State {
        State {
            id: Uuid::new_v4(),
            name: self.name,
            order: self.order,
            info: self.info,
            threshold: self.threshold,
            current: false,
            counter_mod: self.counter_mod,
        }
    }
}

/// Partial update of a state. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub threshold: Option<i64>,
    #[serde(default)]
    pub counter_mod: Option<i64>,
    #[serde(default)]
    pub current: Option<bool>,
}

impl StatePatch {
    pub fn current() -> Self {
        Self {
            current: Some(true),
            ..Default::default()
        }
    }

    pub fn threshold(threshold: i64) -> Self {
        Self {
            threshold: Some(threshold),
            ..Default::default()
        }
    }

    /// Patch with the `current` flag stripped, for plain field writes
    pub fn fields_only(&self) -> StatePatch {
        StatePatch {
            current: None,
            ..self.clone()
        }
    }

    pub fn has_field_changes(&self) -> bool {
        self.name.is_some()
            || self.order.is_some()
            || self.info.is_some()
            || self.threshold.is_some()
            || self.counter_mod.is_some()
    }

    /// Apply the field changes to a state record
    pub fn apply_to(&self, state: &mut State) {
        if let Some(name) = &self.name {
            state.name = name.clone();
        }
        if let Some(order) = self.order {
            state.order = order;
        }
        if let Some(info) = &self.info {
            state.info = info.clone();
        }
        if let Some(threshold) = self.threshold {
            state.threshold = threshold;
        }
        if let Some(counter_mod) = self.counter_mod {
            state.counter_mod = counter_mod;
        }
    }
}

/// Result of an atomic current-state swap
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSwap {
    pub previous: Option<State>,
    pub current: State,
}

/// Notification emitted after the current state changed
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub previous: Option<String>,
    pub current: State,
    pub at: DateTime<Utc>,
}
