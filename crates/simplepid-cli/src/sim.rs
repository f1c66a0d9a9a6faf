//! Simulated first-order plant.
//!
//! Each configured controller gets a plant whose process value relaxes
//! toward `ambient + gain * output` with the configured time constant.  The
//! plant reads the controller's published output and writes the process
//! value to the controller's sensor entity, closing the loop in-process.

use std::sync::Arc;
use std::time::Duration;

use simplepid_params::ParameterStore;
use simplepid_runtime::ControllerRegistry;
use simplepid_types::EntityId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::config::SimulationConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Plant {
    value: f64,
    ambient: f64,
    gain: f64,
    time_constant: f64,
}

impl Plant {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            value: config.ambient,
            ambient: config.ambient,
            gain: config.gain,
            time_constant: config.time_constant_secs.max(f64::EPSILON),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advance by `dt` seconds with `output` applied.
    pub fn step(&mut self, output: f64, dt: f64) -> f64 {
        let target = self.ambient + self.gain * output;
        let alpha = (dt / self.time_constant).min(1.0);
        self.value += (target - self.value) * alpha;
        self.value
    }
}

/// Seed the sensor of controller `name`, then drive its plant until the
/// task is aborted.
///
/// While the controller is not loaded the plant coasts with zero output.
pub fn spawn_plant(
    name: String,
    sensor: EntityId,
    store: ParameterStore,
    registry: Arc<ControllerRegistry>,
    config: SimulationConfig,
) -> JoinHandle<()> {
    let mut plant = Plant::new(&config);
    store.set_state(&sensor, &format_value(plant.value()));

    tokio::spawn(async move {
        let step = Duration::from_millis(config.step_ms.max(1));
        let mut ticker = tokio::time::interval(step);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let instance = registry.get(&name);
            let output = instance
                .as_ref()
                .and_then(|i| i.coordinator().data())
                .unwrap_or(0.0);
            let value = plant.step(output, step.as_secs_f64());
            trace!(controller = %name, output, value, "plant step");
            store.set_state(&sensor, &format_value(value));
            if let Some(instance) = instance {
                store.set_state(instance.output_entity(), &format_value(output));
            }
        }
    })
}

fn format_value(value: f64) -> String {
    format!("{value:.3}")
}
