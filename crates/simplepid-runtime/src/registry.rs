//! [`ControllerRegistry`] – loaded instances and the target dispatcher.
//!
//! Every entity that belongs to an instance (its output sensor and each
//! resolved parameter entity) is registered as an alias of the instance id.
//! The override service resolves a request's target through these aliases.
//!
//! Unloading an instance keeps its aliases, so a request naming one of its
//! entities fails with [`PidError::NotLoaded`] rather than
//! [`PidError::UnknownTarget`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use simplepid_params::ParameterSource;
use simplepid_types::{EntityId, PidError};
use tracing::info;

use crate::device::DeviceConfig;
use crate::instance::{ControllerInstance, RuntimeSettings, setup_with_retry};

#[derive(Default)]
struct Entries {
    targets: HashMap<EntityId, String>,
    instances: HashMap<String, Arc<ControllerInstance>>,
}

/// Loaded controller instances, keyed by instance id.
pub struct ControllerRegistry {
    source: Arc<dyn ParameterSource>,
    settings: RuntimeSettings,
    entries: Mutex<Entries>,
}

impl ControllerRegistry {
    pub fn new(source: Arc<dyn ParameterSource>, settings: RuntimeSettings) -> Self {
        Self {
            source,
            settings,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Set up an instance for `config` (retrying while its sensor is not
    /// ready) and register it.  An instance already loaded under the same
    /// name is shut down and replaced.
    pub async fn load(&self, config: DeviceConfig) -> Result<Arc<ControllerInstance>, PidError> {
        let instance = setup_with_retry(config, Arc::clone(&self.source), &self.settings).await?;
        if let Some(previous) = self.insert(Arc::clone(&instance)) {
            previous.shutdown();
        }
        Ok(instance)
    }

    /// Register a set-up instance and its target aliases.  Returns the
    /// instance it replaced, if any.
    pub fn insert(&self, instance: Arc<ControllerInstance>) -> Option<Arc<ControllerInstance>> {
        let id = instance.id().to_string();
        let mut entries = lock(&self.entries);
        for target in instance.targets() {
            entries.targets.insert(target, id.clone());
        }
        entries.instances.insert(id, instance)
    }

    /// Instance owning `target`.
    pub fn resolve(&self, target: &EntityId) -> Result<Arc<ControllerInstance>, PidError> {
        let entries = lock(&self.entries);
        let id = entries
            .targets
            .get(target)
            .ok_or_else(|| PidError::UnknownTarget(target.to_string()))?;
        entries
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| PidError::NotLoaded(id.clone()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<ControllerInstance>> {
        lock(&self.entries).instances.get(id).cloned()
    }

    /// Remove and shut down instance `id`.
    pub fn unload(&self, id: &str) -> Option<Arc<ControllerInstance>> {
        let removed = lock(&self.entries).instances.remove(id);
        if let Some(instance) = &removed {
            instance.shutdown();
            info!(instance = id, "controller unloaded");
        }
        removed
    }

    /// Tear the instance down and set it up again with `config`.
    pub async fn reload(&self, config: DeviceConfig) -> Result<Arc<ControllerInstance>, PidError> {
        info!(instance = %config.name, "reloading controller");
        self.unload(&config.name);
        self.load(config).await
    }

    /// Shut down every loaded instance.
    pub fn unload_all(&self) {
        let drained: Vec<_> = lock(&self.entries).instances.drain().collect();
        for (id, instance) in drained {
            instance.shutdown();
            info!(instance = %id, "controller unloaded");
        }
    }

    /// Loaded instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock(&self.entries).instances.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{INSTANCE, OUTPUT, SENSOR, entity, fixture_config, fixture_store, settings};
    use simplepid_types::ParameterKey;

    #[tokio::test]
    async fn load_registers_output_and_parameter_targets() {
        let store = fixture_store("25.0");
        let registry = ControllerRegistry::new(Arc::new(store.clone()), settings());
        registry.load(fixture_config()).await.unwrap();

        assert_eq!(registry.instance_ids(), vec![INSTANCE.to_string()]);
        for target in [EntityId::from(OUTPUT), entity(ParameterKey::Setpoint)] {
            assert_eq!(registry.resolve(&target).unwrap().id(), INSTANCE);
        }
        // The sensor belongs to somebody else.
        assert!(matches!(
            registry.resolve(&EntityId::from(SENSOR)),
            Err(PidError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn unload_shuts_down_and_keeps_aliases() {
        let store = fixture_store("25.0");
        let registry = ControllerRegistry::new(Arc::new(store.clone()), settings());
        let instance = registry.load(fixture_config()).await.unwrap();

        let removed = registry.unload(INSTANCE).unwrap();
        assert!(Arc::ptr_eq(&removed, &instance));
        assert!(instance.is_shut_down());
        assert!(registry.get(INSTANCE).is_none());
        assert_eq!(
            registry.resolve(&EntityId::from(OUTPUT)).unwrap_err(),
            PidError::NotLoaded(INSTANCE.into())
        );
        assert!(registry.unload(INSTANCE).is_none());
    }

    #[tokio::test]
    async fn reload_replaces_instance_with_new_config() {
        let store = fixture_store("25.0");
        let registry = ControllerRegistry::new(Arc::new(store.clone()), settings());
        let first = registry.load(fixture_config()).await.unwrap();

        let config = fixture_config().with_input_range(-10.0, 10.0);
        let second = registry.reload(config).await.unwrap();

        assert!(first.is_shut_down());
        assert!(!second.is_shut_down());
        assert_eq!(second.handle().config().input_range_min, -10.0);
        assert!(Arc::ptr_eq(&registry.get(INSTANCE).unwrap(), &second));
        // Only the new instance still listens.
        assert_eq!(store.listener_count(), second.subscription_count());
    }

    #[tokio::test]
    async fn failed_load_registers_nothing() {
        let store = fixture_store("unavailable");
        let registry = ControllerRegistry::new(Arc::new(store.clone()), settings());
        let err = registry.load(fixture_config()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(registry.instance_ids().is_empty());
        assert!(matches!(
            registry.resolve(&EntityId::from(OUTPUT)),
            Err(PidError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn unload_all_empties_registry() {
        let store = fixture_store("25.0");
        let registry = ControllerRegistry::new(Arc::new(store.clone()), settings());
        let instance = registry.load(fixture_config()).await.unwrap();
        registry.unload_all();
        assert!(registry.instance_ids().is_empty());
        assert!(instance.is_shut_down());
        assert_eq!(store.listener_count(), 0);
    }
}
