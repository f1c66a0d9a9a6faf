//! [`ParameterStore`] – in-process [`ParameterSource`].
//!
//! Holds an entity registry and the current state of every entity.  Writes
//! go through [`ParameterStore::set_state`], which stamps the
//! `last_changed`/`last_updated` times and forwards the transition to every
//! listener subscribed to that entity.
//!
//! Listeners whose receiving end has been dropped are pruned on the next
//! write.
//!
//! # Example
//!
//! ```rust
//! use simplepid_params::{ParameterSource, ParameterStore};
//! use simplepid_types::{Platform, StateValue};
//!
//! # tokio_test_block_on(async {
//! let store = ParameterStore::new();
//! let kp = store.register_entity(Platform::Number, "pid2_kp");
//! store.set_state(&kp, "1.5");
//!
//! assert_eq!(store.resolve(Platform::Number, "pid2_kp"), Some(kp.clone()));
//! let state = store.state(&kp).await.unwrap();
//! assert_eq!(state.value, StateValue::Known("1.5".into()));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use simplepid_types::{EntityId, ParameterState, Platform, StateValue};
use tracing::{debug, trace};

use crate::source::{Listener, ParameterSource, StateChange, Subscription};

type ListenerTable = HashMap<u64, (EntityId, Listener)>;

/// Shared in-memory parameter store.  Clone it cheaply – all clones share
/// the same registry, states, and listeners.
#[derive(Clone, Default)]
pub struct ParameterStore {
    registry: Arc<Mutex<HashMap<(Platform, String), EntityId>>>,
    states: Arc<Mutex<HashMap<EntityId, ParameterState>>>,
    listeners: Arc<Mutex<ListenerTable>>,
    next_listener_id: Arc<AtomicU64>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unique_id` on `platform` under the conventional entity id
    /// `<platform>.<unique_id lowercased>` and return it.
    pub fn register_entity(&self, platform: Platform, unique_id: &str) -> EntityId {
        let entity_id = EntityId::new(platform, &unique_id.to_lowercase());
        self.register_entity_as(platform, unique_id, entity_id.clone());
        entity_id
    }

    /// Register `unique_id` on `platform` under an explicit entity id.
    /// Re-registering replaces the previous mapping.
    pub fn register_entity_as(&self, platform: Platform, unique_id: &str, entity_id: EntityId) {
        debug!(%platform, unique_id, %entity_id, "registering entity");
        lock(&self.registry).insert((platform, unique_id.to_string()), entity_id);
    }

    /// Write a raw state string.  `"unknown"` and `"unavailable"` are stored
    /// as the corresponding sentinels.
    pub fn set_state(&self, entity_id: &EntityId, raw: &str) {
        self.set_value(entity_id, StateValue::from_raw(raw));
    }

    /// Write `value` and notify the entity's listeners.
    pub fn set_value(&self, entity_id: &EntityId, value: StateValue) {
        let now = Utc::now();
        let change = {
            let mut states = lock(&self.states);
            let old_state = states.get(entity_id).cloned();
            let last_changed = match &old_state {
                Some(old) if old.value == value => old.last_changed,
                _ => now,
            };
            let new_state = ParameterState {
                value,
                last_changed,
                last_updated: now,
            };
            states.insert(entity_id.clone(), new_state.clone());
            StateChange {
                entity_id: entity_id.clone(),
                old_state,
                new_state,
            }
        };
        trace!(entity_id = %entity_id, value = %change.new_state.value, "state written");
        self.notify(change);
    }

    /// Drop the state of `entity_id`; later reads return `None`.
    pub fn remove_state(&self, entity_id: &EntityId) {
        lock(&self.states).remove(entity_id);
    }

    /// Number of live listeners across all entities.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn notify(&self, change: StateChange) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|id, (entity_id, listener)| {
            if *entity_id != change.entity_id {
                return true;
            }
            let delivered = listener.send(change.clone()).is_ok();
            if !delivered {
                debug!(listener = id, %entity_id, "pruning closed listener");
            }
            delivered
        });
    }
}

#[async_trait]
impl ParameterSource for ParameterStore {
    fn resolve(&self, platform: Platform, unique_id: &str) -> Option<EntityId> {
        lock(&self.registry)
            .get(&(platform, unique_id.to_string()))
            .cloned()
    }

    async fn state(&self, entity: &EntityId) -> Option<ParameterState> {
        lock(&self.states).get(entity).cloned()
    }

    fn subscribe(&self, entity: &EntityId, listener: Listener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, (entity.clone(), listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                lock(&listeners).remove(&id);
            }
        })
    }
}

// A panic while holding one of these locks cannot leave a map half-written,
// so a poisoned lock is still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
