//! Counter ledger and threshold-banded state transitions

use super::model::{
    AlertCounter, CounterRequest, CurrentSwap, NewCounter, State, StateChange, StatePatch,
    StateSeed,
};
use crate::config::AlertSection;
use crate::error::{ControlError, ControlResult};
use crate::observability::metrics;
use crate::state_span;
use crate::storage::{AlertStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

/// Capacity of the state change channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Owns the counter ledger and the state table.
///
/// Every current-state change goes through [`AlertEngine::set_current`], which
/// performs the swap as one storage transaction and then notifies subscribers
/// of [`AlertEngine::subscribe_changes`].
pub struct AlertEngine<S: AlertStore + ?Sized> {
    store: Arc<S>,
    settings: AlertSection,
    changes: broadcast::Sender<StateChange>,
}

impl<S: AlertStore + ?Sized> Clone for AlertEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<S: AlertStore + ?Sized> AlertEngine<S> {
    pub fn new(store: Arc<S>, settings: AlertSection) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            settings,
            changes,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Receive a [`StateChange`] for every committed current-state change
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Append a counter entry and, when `auto_switch` is set, move the current
    /// state to the band the new value falls into.
    ///
    /// Counters never drive a transition away from an out-of-game state.
    pub async fn append_counter(
        &self,
        request: CounterRequest,
        auto_switch: bool,
    ) -> ControlResult<AlertCounter> {
        let counter = self.record_counter(request).await?;

        if auto_switch {
            match self.store.current_state().await? {
                Some(current) if !current.is_in_game() => {
                    debug!(
                        state = %current.name,
                        value = counter.value,
                        "Current state is out of game, counter does not switch state"
                    );
                }
                _ => {
                    self.switch_state_by_counter(&counter).await?;
                }
            }
        }

        Ok(counter)
    }

    /// Move the counter by the current state's step
    pub async fn step_counter(
        &self,
        increase: bool,
        comment: Option<String>,
    ) -> ControlResult<AlertCounter> {
        let current = self.get_current_state().await?;
        let request = CounterRequest {
            value: current.counter_mod,
            comment,
            relative: true,
            increase,
        };
        self.append_counter(request, true).await
    }

    /// Make the in-game state whose band contains `counter` current.
    ///
    /// Returns the newly current state, or `None` when no band matches or the
    /// matching state is already current.
    pub async fn switch_state_by_counter(
        &self,
        counter: &AlertCounter,
    ) -> ControlResult<Option<State>> {
        let Some(target) = self.store.state_for_counter(counter.value).await? else {
            debug!(value = counter.value, "No in-game state below counter");
            return Ok(None);
        };

        if target.current {
            return Ok(None);
        }

        info!(
            value = counter.value,
            state = %target.name,
            threshold = target.threshold,
            "Counter crossed state threshold"
        );
        self.set_current(&target.name, true).await.map(Some)
    }

    /// Make `name` the only current state.
    ///
    /// With `auto_reset_counter`, an in-game state also snaps the counter to
    /// its threshold.
    pub async fn set_current(&self, name: &str, auto_reset_counter: bool) -> ControlResult<State> {
        let span = state_span!(state = name, auto_reset_counter);
        self.commit_current(name, auto_reset_counter)
            .instrument(span)
            .await
    }

    async fn commit_current(&self, name: &str, auto_reset_counter: bool) -> ControlResult<State> {
        let swap = self.swap_with_retry(name).await?;
        let state = swap.current.clone();

        if auto_reset_counter && state.is_in_game() {
            let request = CounterRequest::absolute(state.threshold)
                .with_comment(format!("Auto-set by state {}", state.name));
            self.record_counter(request).await?;
        }

        self.notify_change(swap);
        Ok(state)
    }

    /// Apply a partial update to a state.
    ///
    /// `current = true` selects the state through [`AlertEngine::set_current`];
    /// `current = false` is rejected because the current state only changes by
    /// selecting another one.
    pub async fn update_state(
        &self,
        name: &str,
        patch: StatePatch,
        auto_reset_counter: bool,
    ) -> ControlResult<State> {
        if patch.current == Some(false) {
            return Err(ControlError::invalid_patch(
                "current can only be set to true; select another state instead",
            ));
        }

        let existing = self
            .store
            .state_by_name(name)
            .await?
            .ok_or_else(|| ControlError::state_not_found(name))?;

        let mut updated = if patch.has_field_changes() {
            self.store.update_state_fields(name, &patch).await?
        } else {
            existing.clone()
        };

        if patch.current == Some(true) {
            updated = self.set_current(&updated.name, auto_reset_counter).await?;
        } else {
            let threshold_changed = updated.threshold != existing.threshold;
            if threshold_changed && updated.current && auto_reset_counter && updated.is_in_game() {
                let request = CounterRequest::absolute(updated.threshold)
                    .with_comment(format!("Auto-set by state {}", updated.name));
                self.record_counter(request).await?;
            }
        }

        debug!(state = %updated.name, "State updated");
        Ok(updated)
    }

    pub async fn get_current_state(&self) -> ControlResult<State> {
        self.store
            .current_state()
            .await?
            .ok_or(ControlError::NoCurrentState)
    }

    /// Create a new state; a seed marked current is selected right away
    pub async fn create_state(&self, seed: StateSeed) -> ControlResult<State> {
        let make_current = seed.current;
        let state = self.store.insert_state(seed.into_state()).await?;
        info!(state = %state.name, threshold = state.threshold, "State created");

        if make_current {
            return self.set_current(&state.name, true).await;
        }
        Ok(state)
    }

    pub async fn list_states(&self) -> ControlResult<Vec<State>> {
        Ok(self.store.list_states().await?)
    }

    /// Band lookup without side effects
    pub async fn state_for_counter(&self, value: i64) -> ControlResult<Option<State>> {
        Ok(self.store.state_for_counter(value).await?)
    }

    pub async fn last_counter(&self) -> ControlResult<Option<AlertCounter>> {
        Ok(self.store.last_counter().await?)
    }

    /// Counter ledger, newest first
    pub async fn list_counters(&self) -> ControlResult<Vec<AlertCounter>> {
        Ok(self.store.list_counters().await?)
    }

    /// Make sure a state is current at startup.
    ///
    /// Picks the band of the latest counter without touching the ledger, and
    /// falls back to the lowest in-game state (resetting the counter to its
    /// threshold). Returns `None` when there is no in-game state at all.
    pub async fn ensure_current(&self) -> ControlResult<Option<State>> {
        if let Some(current) = self.store.current_state().await? {
            metrics().set_alert_state(&current.name);
            return Ok(Some(current));
        }

        if let Some(counter) = self.store.last_counter().await? {
            if let Some(state) = self.store.state_for_counter(counter.value).await? {
                info!(state = %state.name, value = counter.value, "Restored current state from counter");
                return self.set_current(&state.name, false).await.map(Some);
            }
        }

        let lowest = self
            .store
            .list_states()
            .await?
            .into_iter()
            .filter(State::is_in_game)
            .min_by_key(|s| s.threshold);

        match lowest {
            Some(state) => {
                info!(state = %state.name, "No current state, selecting lowest in-game state");
                self.set_current(&state.name, true).await.map(Some)
            }
            None => {
                warn!("No in-game states configured, alert level has no current state");
                Ok(None)
            }
        }
    }

    /// Persist a counter without evaluating state switches
    async fn record_counter(&self, request: CounterRequest) -> ControlResult<AlertCounter> {
        let value = if request.relative {
            let last = self
                .store
                .last_counter()
                .await?
                .ok_or(ControlError::NoPriorCounter)?;
            if request.increase {
                last.value.saturating_add(request.value)
            } else {
                last.value.saturating_sub(request.value)
            }
        } else {
            request.value
        };

        let comment = request
            .comment
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.settings.default_comment.clone());

        let counter = self
            .store
            .append_counter(NewCounter { value, comment })
            .await?;
        metrics().counter_appended();
        debug!(value = counter.value, comment = %counter.comment, "Counter appended");
        Ok(counter)
    }

    async fn swap_with_retry(&self, name: &str) -> ControlResult<CurrentSwap> {
        let max_attempts = self.settings.max_swap_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.store.swap_current(name).await {
                Ok(swap) => return Ok(swap),
                Err(StoreError::Conflict(reason)) => {
                    metrics().swap_conflict();
                    if attempts >= max_attempts {
                        warn!(state = name, attempts, %reason, "Current state swap kept conflicting");
                        return Err(ControlError::TransactionConflict { attempts });
                    }
                    debug!(state = name, attempts, %reason, "Current state swap conflicted, retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    fn notify_change(&self, swap: CurrentSwap) {
        let previous = swap.previous.map(|s| s.name);
        if previous.as_deref() == Some(swap.current.name.as_str()) {
            return;
        }

        info!(
            from = previous.as_deref().unwrap_or("none"),
            to = %swap.current.name,
            "Current state changed"
        );
        metrics().set_alert_state(&swap.current.name);

        // No subscribers is fine
        let _ = self.changes.send(StateChange {
            previous,
            current: swap.current,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::storage::MemoryStore;

    fn engine() -> AlertEngine<MemoryStore> {
        let config = ControlConfig::test_config();
        let store = Arc::new(MemoryStore::from_config(&config).unwrap());
        AlertEngine::new(store, config.alert)
    }

    async fn current_name(engine: &AlertEngine<MemoryStore>) -> String {
        engine.get_current_state().await.unwrap().name
    }

    #[tokio::test]
    async fn test_relative_counter_requires_prior() {
        let engine = engine();
        let err = engine
            .append_counter(CounterRequest::increase_by(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoPriorCounter));
    }

    #[tokio::test]
    async fn test_relative_counter_math() {
        let engine = engine();
        engine
            .append_counter(CounterRequest::absolute(10), false)
            .await
            .unwrap();
        let up = engine
            .append_counter(CounterRequest::increase_by(5), false)
            .await
            .unwrap();
        assert_eq!(up.value, 15);
        let down = engine
            .append_counter(CounterRequest::decrease_by(20), false)
            .await
            .unwrap();
        assert_eq!(down.value, -5);
    }

    #[tokio::test]
    async fn test_default_comment_applied() {
        let engine = engine();
        let counter = engine
            .append_counter(CounterRequest::absolute(1).with_comment(""), false)
            .await
            .unwrap();
        assert_eq!(counter.comment, "changed by system");
    }

    #[tokio::test]
    async fn test_counter_drives_state_and_resets() {
        let engine = engine();
        let mut changes = engine.subscribe_changes();

        engine
            .append_counter(CounterRequest::absolute(120), true)
            .await
            .unwrap();
        assert_eq!(current_name(&engine).await, "red");

        let last = engine.last_counter().await.unwrap().unwrap();
        assert_eq!(last.value, 100);
        assert_eq!(last.comment, "Auto-set by state red");

        let change = changes.try_recv().unwrap();
        assert_eq!(change.previous.as_deref(), Some("green"));
        assert_eq!(change.current.name, "red");
    }

    #[tokio::test]
    async fn test_same_band_is_noop() {
        let engine = engine();
        let mut changes = engine.subscribe_changes();
        engine
            .append_counter(CounterRequest::absolute(50), true)
            .await
            .unwrap();
        assert_eq!(current_name(&engine).await, "green");
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 50);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_game_state_ignores_counter() {
        let engine = engine();
        engine.set_current("white", true).await.unwrap();
        engine
            .append_counter(CounterRequest::absolute(500), true)
            .await
            .unwrap();
        assert_eq!(current_name(&engine).await, "white");
        // out-of-game states never reset the counter
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 500);
    }

    #[tokio::test]
    async fn test_set_current_unknown_state() {
        let engine = engine();
        let err = engine.set_current("purple", true).await.unwrap_err();
        assert!(matches!(err, ControlError::StateNotFound { ref name } if name == "purple"));
        assert_eq!(current_name(&engine).await, "green");
    }

    #[tokio::test]
    async fn test_step_counter_uses_counter_mod() {
        let engine = engine();
        engine
            .append_counter(CounterRequest::absolute(10), false)
            .await
            .unwrap();
        let counter = engine.step_counter(true, None).await.unwrap();
        assert_eq!(counter.value, 15);
        let counter = engine
            .step_counter(false, Some("calmed".to_string()))
            .await
            .unwrap();
        assert_eq!(counter.value, 10);
        assert_eq!(counter.comment, "calmed");
    }

    #[tokio::test]
    async fn test_update_state_rejects_unset_current() {
        let engine = engine();
        let patch = StatePatch {
            current: Some(false),
            ..Default::default()
        };
        let err = engine.update_state("green", patch, true).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidPatch { .. }));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_update_current_threshold_resnaps_counter() {
        let engine = engine();
        engine
            .append_counter(CounterRequest::absolute(3), false)
            .await
            .unwrap();
        let updated = engine
            .update_state("green", StatePatch::threshold(10), true)
            .await
            .unwrap();
        assert_eq!(updated.threshold, 10);
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 10);
    }

    #[tokio::test]
    async fn test_update_threshold_without_reset() {
        let engine = engine();
        engine
            .append_counter(CounterRequest::absolute(3), false)
            .await
            .unwrap();
        engine
            .update_state("green", StatePatch::threshold(10), false)
            .await
            .unwrap();
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 3);
    }

    #[tokio::test]
    async fn test_update_state_selects_current() {
        let engine = engine();
        let state = engine
            .update_state("red", StatePatch::current(), true)
            .await
            .unwrap();
        assert!(state.current);
        assert_eq!(current_name(&engine).await, "red");
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 100);
    }

    #[tokio::test]
    async fn test_update_unknown_state() {
        let engine = engine();
        let err = engine
            .update_state("purple", StatePatch::threshold(1), true)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_ensure_current_bootstraps_from_counter() {
        let mut config = ControlConfig::test_config();
        for state in &mut config.states {
            state.current = false;
        }
        config.alert.initial_counter = Some(130);
        let store = Arc::new(MemoryStore::from_config(&config).unwrap());
        let engine = AlertEngine::new(store, config.alert);

        let state = engine.ensure_current().await.unwrap().unwrap();
        assert_eq!(state.name, "red");
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 130);
    }

    #[tokio::test]
    async fn test_ensure_current_falls_back_to_lowest_band() {
        let mut config = ControlConfig::test_config();
        for state in &mut config.states {
            state.current = false;
        }
        let store = Arc::new(MemoryStore::from_config(&config).unwrap());
        let engine = AlertEngine::new(store, config.alert);

        let state = engine.ensure_current().await.unwrap().unwrap();
        assert_eq!(state.name, "green");
        assert_eq!(engine.last_counter().await.unwrap().unwrap().value, 0);
    }

    #[tokio::test]
    async fn test_create_state() {
        let engine = engine();
        let state = engine
            .create_state(StateSeed {
                name: "yellow".to_string(),
                order: 5,
                info: "caution".to_string(),
                threshold: 50,
                current: false,
                counter_mod: 10,
            })
            .await
            .unwrap();
        assert!(!state.current);
        assert_eq!(
            engine.state_for_counter(60).await.unwrap().unwrap().name,
            "yellow"
        );

        let err = engine
            .create_state(StateSeed {
                name: "yellow".to_string(),
                order: 6,
                info: String::new(),
                threshold: 70,
                current: false,
                counter_mod: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
