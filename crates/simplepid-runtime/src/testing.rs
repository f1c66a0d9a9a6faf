//! Shared fixtures for the runtime tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use simplepid_params::{Listener, ParameterSource, ParameterStore, Subscription};
use simplepid_types::{EntityId, ParameterKey, ParameterState, Platform};
use tokio::sync::Notify;

use crate::device::{DeviceConfig, DeviceHandle, ParameterMap};
use crate::instance::{ControllerInstance, RetryPolicy, RuntimeSettings};
use crate::platform::{ParameterSeeds, register_parameter_entities};
use crate::registry::ControllerRegistry;
use crate::set_output::OutputOverrideService;

pub const INSTANCE: &str = "PID2";
pub const SENSOR: &str = "sensor.test_input";
pub const OUTPUT: &str = "sensor.pid2_pid_output";

/// Entity id of `key` for [`INSTANCE`].
pub fn entity(key: ParameterKey) -> EntityId {
    EntityId::new(key.platform(), &key.unique_id(INSTANCE).to_lowercase())
}

pub fn fixture_config() -> DeviceConfig {
    DeviceConfig::new(INSTANCE, SENSOR).with_output_range(0.0, 1.0)
}

/// Store with every parameter of [`INSTANCE`] registered (set-point 30,
/// output bounds 0..1) and the sensor reporting `sensor_state`.
pub fn fixture_store(sensor_state: &str) -> ParameterStore {
    let store = ParameterStore::new();
    let seeds = ParameterSeeds {
        setpoint: 30.0,
        ..ParameterSeeds::default()
    };
    register_parameter_entities(&store, &fixture_config(), &seeds);
    store.set_state(&EntityId::from(SENSOR), sensor_state);
    store
}

pub fn handle_for(store: &ParameterStore) -> DeviceHandle {
    let parameters = ParameterMap::build(store, INSTANCE);
    DeviceHandle::new(fixture_config(), parameters, Arc::new(store.clone()))
}

/// On-demand refresh only, single setup attempt.
pub fn settings() -> RuntimeSettings {
    RuntimeSettings {
        refresh_interval: None,
        retry: RetryPolicy {
            attempts: 1,
            delay: std::time::Duration::ZERO,
        },
    }
}

pub async fn load_fixture(
    store: &ParameterStore,
) -> (Arc<ControllerRegistry>, OutputOverrideService, Arc<ControllerInstance>) {
    let registry = Arc::new(ControllerRegistry::new(Arc::new(store.clone()), settings()));
    let instance = registry
        .load(fixture_config())
        .await
        .expect("fixture instance loads");
    let service = OutputOverrideService::new(Arc::clone(&registry));
    (registry, service, instance)
}

/// Let spawned listener and refresh tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// [`ParameterStore`] wrapper that counts subscribe and unsubscribe calls.
pub struct CountingSource {
    inner: ParameterStore,
    subscribed: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(inner: ParameterStore) -> Self {
        Self {
            inner,
            subscribed: Arc::default(),
            cancelled: Arc::default(),
        }
    }

    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterSource for CountingSource {
    fn resolve(&self, platform: Platform, unique_id: &str) -> Option<EntityId> {
        self.inner.resolve(platform, unique_id)
    }

    async fn state(&self, entity: &EntityId) -> Option<ParameterState> {
        self.inner.state(entity).await
    }

    fn subscribe(&self, entity: &EntityId, listener: Listener) -> Subscription {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.subscribe(entity, listener);
        let cancelled = Arc::clone(&self.cancelled);
        Subscription::new(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
            inner.cancel();
        })
    }
}

/// [`ParameterStore`] wrapper whose next read of one entity, once armed,
/// parks until [`release`](GatedSource::release) is called.
pub struct GatedSource {
    inner: ParameterStore,
    gated: EntityId,
    armed: AtomicBool,
    parked: Notify,
    released: Notify,
}

impl GatedSource {
    pub fn new(inner: ParameterStore, gated: EntityId) -> Self {
        Self {
            inner,
            gated,
            armed: AtomicBool::new(false),
            parked: Notify::new(),
            released: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a read is parked on the gate.
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl ParameterSource for GatedSource {
    fn resolve(&self, platform: Platform, unique_id: &str) -> Option<EntityId> {
        self.inner.resolve(platform, unique_id)
    }

    async fn state(&self, entity: &EntityId) -> Option<ParameterState> {
        if *entity == self.gated && self.armed.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.released.notified().await;
        }
        self.inner.state(entity).await
    }

    fn subscribe(&self, entity: &EntityId, listener: Listener) -> Subscription {
        self.inner.subscribe(entity, listener)
    }
}
