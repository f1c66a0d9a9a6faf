//! Read-only diagnostics export.
//!
//! [`DiagnosticsSnapshot::collect`] copies the static configuration, the
//! current input sensor state, the handle's public fields, and the five
//! history buffers of one instance.  Nothing is mutated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use simplepid_control::CycleHistory;
use simplepid_types::{Contributions, EntityId, PidError, Tunings};

use crate::coordinator::RefreshStats;
use crate::device::DeviceConfig;
use crate::instance::ControllerInstance;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSensorInfo {
    pub entity_id: EntityId,
    pub state: String,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub auto_mode: bool,
    pub tunings: Tunings,
    pub setpoint: f64,
    pub sample_time: Option<f64>,
    pub output_limits: (f64, f64),
    pub held_output: Option<f64>,
    pub last_contributions: Option<Contributions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    #[serde(flatten)]
    pub config: DeviceConfig,
    pub input_sensor: Option<InputSensorInfo>,
    pub last_known_output: Option<f64>,
    pub published_output: Option<f64>,
    pub control: ControlSnapshot,
    pub last_update: Option<DateTime<Utc>>,
    pub last_measured_sample_time: Option<f64>,
    pub refresh: RefreshStats,
    pub history: CycleHistory,
}

impl DiagnosticsSnapshot {
    pub async fn collect(instance: &ControllerInstance) -> Self {
        let handle = instance.handle();
        let config = handle.config().clone();
        let input_sensor = handle
            .source()
            .state(&config.sensor_entity_id)
            .await
            .map(|state| InputSensorInfo {
                entity_id: config.sensor_entity_id.clone(),
                state: state.value.to_string(),
                last_changed: state.last_changed,
                last_updated: state.last_updated,
            });

        let snapshot = handle.snapshot();
        Self {
            config,
            input_sensor,
            last_known_output: snapshot.last_known_output,
            published_output: instance.coordinator().data(),
            control: ControlSnapshot {
                auto_mode: snapshot.auto_mode,
                tunings: snapshot.tunings,
                setpoint: snapshot.setpoint,
                sample_time: snapshot.sample_time,
                output_limits: snapshot.output_limits,
                held_output: snapshot.held_output,
                last_contributions: snapshot.last_contributions,
            },
            last_update: snapshot.last_update,
            last_measured_sample_time: snapshot.last_measured_sample_time,
            refresh: instance.coordinator().stats(),
            history: snapshot.history,
        }
    }

    pub fn to_json(&self) -> Result<String, PidError> {
        serde_json::to_string_pretty(self).map_err(|e| PidError::Serialization(e.to_string()))
    }
}
