//! Registration of an instance's parameter entities on a [`ParameterStore`].
//!
//! A hosting process that keeps parameters in-process registers one entity
//! per [`ParameterKey`] (`number.<instance>_kp`, `switch.<instance>_auto_mode`,
//! `select.<instance>_start_mode`, …) plus the output sensor, and seeds each
//! with an initial state.

use serde::{Deserialize, Serialize};
use simplepid_params::ParameterStore;
use simplepid_types::{EntityId, ParameterKey, Platform, Preset};
use tracing::debug;

use crate::device::{DEFAULT_KD, DEFAULT_KI, DEFAULT_KP, DEFAULT_SETPOINT, DeviceConfig};

/// Initial parameter values.  Output bounds default to the configured
/// output range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSeeds {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    pub sample_time: Option<f64>,
    pub output_min: Option<f64>,
    pub output_max: Option<f64>,
    pub starting_output: f64,
    pub auto_mode: bool,
    pub proportional_on_measurement: bool,
    pub windup_protection: bool,
    pub start_mode: Preset,
}

impl Default for ParameterSeeds {
    fn default() -> Self {
        Self {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            kd: DEFAULT_KD,
            setpoint: DEFAULT_SETPOINT,
            sample_time: None,
            output_min: None,
            output_max: None,
            starting_output: 0.0,
            auto_mode: true,
            proportional_on_measurement: false,
            windup_protection: true,
            start_mode: Preset::ZeroStart,
        }
    }
}

impl ParameterSeeds {
    /// Initial raw state of `key`; `None` leaves the entity without state.
    pub fn raw_state(&self, key: ParameterKey, config: &DeviceConfig) -> Option<String> {
        let switch = |on: bool| if on { "on" } else { "off" }.to_string();
        Some(match key {
            ParameterKey::Kp => self.kp.to_string(),
            ParameterKey::Ki => self.ki.to_string(),
            ParameterKey::Kd => self.kd.to_string(),
            ParameterKey::Setpoint => self.setpoint.to_string(),
            ParameterKey::SampleTime => self.sample_time?.to_string(),
            ParameterKey::OutputMin => self.output_min.unwrap_or(config.output_range_min).to_string(),
            ParameterKey::OutputMax => self.output_max.unwrap_or(config.output_range_max).to_string(),
            ParameterKey::StartingOutput => self.starting_output.to_string(),
            ParameterKey::AutoMode => switch(self.auto_mode),
            ParameterKey::ProportionalOnMeasurement => switch(self.proportional_on_measurement),
            ParameterKey::WindupProtection => switch(self.windup_protection),
            ParameterKey::StartMode => self.start_mode.as_str().to_string(),
        })
    }
}

/// Register every parameter entity of `config.name` and its output sensor
/// on `store`, seeding states from `seeds`.  Returns the parameter entities
/// in key order.
pub fn register_parameter_entities(
    store: &ParameterStore,
    config: &DeviceConfig,
    seeds: &ParameterSeeds,
) -> Vec<EntityId> {
    let entities: Vec<_> = ParameterKey::ALL
        .into_iter()
        .map(|key| {
            let entity_id = store.register_entity(key.platform(), &key.unique_id(&config.name));
            if let Some(raw) = seeds.raw_state(key, config) {
                store.set_state(&entity_id, &raw);
            }
            entity_id
        })
        .collect();

    let output = config.output_entity_id();
    store.register_entity_as(
        Platform::Sensor,
        &format!("{}_pid_output", config.name),
        output.clone(),
    );
    debug!(instance = %config.name, %output, entities = entities.len(), "parameter entities registered");
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplepid_params::ParameterSource;
    use simplepid_types::StateValue;

    #[tokio::test]
    async fn registers_one_entity_per_key() {
        let store = ParameterStore::new();
        let config = DeviceConfig::new("Boiler", "sensor.boiler_temp").with_output_range(0.0, 1.0);
        let entities = register_parameter_entities(&store, &config, &ParameterSeeds::default());

        assert_eq!(entities.len(), ParameterKey::ALL.len());
        assert_eq!(
            store.resolve(Platform::Switch, "Boiler_auto_mode").unwrap().as_str(),
            "switch.boiler_auto_mode"
        );
        assert_eq!(
            store.resolve(Platform::Sensor, "Boiler_pid_output"),
            Some(EntityId::from("sensor.boiler_pid_output"))
        );

        let max = store.resolve(Platform::Number, "Boiler_output_max").unwrap();
        assert_eq!(store.state(&max).await.unwrap().value, StateValue::Known("1".into()));
        let mode = store.resolve(Platform::Select, "Boiler_start_mode").unwrap();
        assert_eq!(
            store.state(&mode).await.unwrap().value,
            StateValue::Known("zero_start".into())
        );
    }

    #[tokio::test]
    async fn unset_sample_time_has_no_state() {
        let store = ParameterStore::new();
        let config = DeviceConfig::new("pid", "sensor.x");
        register_parameter_entities(&store, &config, &ParameterSeeds::default());
        let sample_time = store.resolve(Platform::Number, "pid_sample_time").unwrap();
        assert!(store.state(&sample_time).await.is_none());
    }

    #[test]
    fn seeds_deserialize_with_defaults() {
        let seeds: ParameterSeeds =
            serde_json::from_str(r#"{"kp": 2.5, "auto_mode": false, "start_mode": "startup_value"}"#)
                .unwrap();
        assert_eq!(seeds.kp, 2.5);
        assert_eq!(seeds.ki, DEFAULT_KI);
        assert!(!seeds.auto_mode);
        assert_eq!(seeds.start_mode, Preset::StartupValue);
        assert_eq!(seeds.output_max, None);
    }
}
