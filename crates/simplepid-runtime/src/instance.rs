//! [`ControllerInstance`] – lifecycle of one configured controller.
//!
//! Setup builds the parameter map, checks that the process variable is
//! readable, subscribes to every resolved parameter entity, runs the first
//! cycle, and starts the optional periodic refresh.  A sensor without a
//! usable reading fails setup with the retryable [`PidError::NotReady`];
//! [`setup_with_retry`] retries exactly those failures.
//!
//! Shutdown closes the handle and coordinator (an in-flight cycle is then
//! abandoned), cancels every subscription exactly once, and stops the
//! background tasks.  It is idempotent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use simplepid_control::OutputLimits;
use simplepid_params::{ParameterSource, Subscription};
use simplepid_types::{EntityId, PidError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::device::{DeviceConfig, DeviceHandle, ParameterMap};

/// Retry schedule for [`setup_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Runtime knobs shared by every instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Period of the background refresh; `None` refreshes only on demand.
    pub refresh_interval: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Some(Duration::from_secs(10)),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ControllerInstance {
    id: String,
    handle: Arc<DeviceHandle>,
    coordinator: Arc<RefreshCoordinator>,
    output_entity: EntityId,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ControllerInstance {
    /// Set up one instance.
    ///
    /// # Errors
    ///
    /// [`PidError::Config`] for an inverted or NaN output range,
    /// [`PidError::NotReady`] when the sensor has no usable reading.
    pub async fn setup(
        config: DeviceConfig,
        source: Arc<dyn ParameterSource>,
        settings: &RuntimeSettings,
    ) -> Result<Arc<Self>, PidError> {
        if let Err(e) = OutputLimits::new(config.output_range_min, config.output_range_max) {
            return Err(PidError::Config(format!("{}: {e}", config.name)));
        }

        let parameters = ParameterMap::build(source.as_ref(), &config.name);
        let missing = parameters.missing();
        if !missing.is_empty() {
            debug!(instance = %config.name, ?missing, "parameters without an entity");
        }

        let id = config.name.clone();
        let output_entity = config.output_entity_id();
        let handle = Arc::new(DeviceHandle::new(config, parameters, Arc::clone(&source)));

        if handle.read_process_variable().await.is_none() {
            let sensor = handle.config().sensor_entity_id.to_string();
            warn!("Sensor {} not ready; delaying setup", sensor);
            return Err(PidError::NotReady(sensor));
        }

        let coordinator = Arc::new(RefreshCoordinator::new(id.clone(), handle.clone()));

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions: Vec<_> = handle
            .parameters()
            .entities()
            .map(|(_, entity_id)| source.subscribe(entity_id, tx.clone()))
            .collect();
        drop(tx);

        let mut tasks = vec![spawn_change_listener(Arc::clone(&coordinator), rx)];

        coordinator.request_refresh().await;

        if let Some(period) = settings.refresh_interval {
            tasks.push(coordinator.spawn_periodic(period));
        }

        info!(
            instance = %id,
            subscriptions = subscriptions.len(),
            output = ?coordinator.data(),
            "controller ready"
        );
        Ok(Arc::new(Self {
            id,
            handle,
            coordinator,
            output_entity,
            subscriptions: Mutex::new(subscriptions),
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &Arc<DeviceHandle> {
        &self.handle
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn output_entity(&self) -> &EntityId {
        &self.output_entity
    }

    /// Entities that address this instance in an override request.
    pub fn targets(&self) -> Vec<EntityId> {
        std::iter::once(self.output_entity.clone())
            .chain(self.handle.parameters().entities().map(|(_, e)| e.clone()))
            .collect()
    }

    /// Number of still-active subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions)
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the instance.  Returns `false` when it was already stopped.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.handle.close();
        self.coordinator.close();

        let cancelled = lock(&self.subscriptions)
            .drain(..)
            .map(|mut subscription| subscription.cancel())
            .filter(|cancelled| *cancelled)
            .count();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!(instance = %self.id, cancelled, "controller shut down");
        true
    }
}

impl fmt::Debug for ControllerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerInstance")
            .field("id", &self.id)
            .field("output_entity", &self.output_entity)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Drop for ControllerInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Request a refresh for every burst of parameter changes.
fn spawn_change_listener(
    coordinator: Arc<RefreshCoordinator>,
    mut changes: mpsc::UnboundedReceiver<simplepid_params::StateChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            debug!(
                coordinator = coordinator.name(),
                entity_id = %change.entity_id,
                value = %change.new_state.value,
                "parameter changed"
            );
            while changes.try_recv().is_ok() {}
            coordinator.request_refresh().await;
        }
    })
}

/// [`ControllerInstance::setup`], retried on [`PidError::is_retryable`]
/// failures according to `settings.retry`.
pub async fn setup_with_retry(
    config: DeviceConfig,
    source: Arc<dyn ParameterSource>,
    settings: &RuntimeSettings,
) -> Result<Arc<ControllerInstance>, PidError> {
    let attempts = settings.retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        match ControllerInstance::setup(config.clone(), Arc::clone(&source), settings).await {
            Ok(instance) => return Ok(instance),
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!(instance = %config.name, attempt, attempts, error = %e, "setup will be retried");
                attempt += 1;
                tokio::time::sleep(settings.retry.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
