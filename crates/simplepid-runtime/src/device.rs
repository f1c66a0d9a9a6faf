//! [`DeviceHandle`] – the bridge between named parameters and the Control
//! State.
//!
//! A handle is created once per configured controller instance.  It owns the
//! [`PidController`], the five telemetry buffers, and the timing bookkeeping
//! between cycles, and it is the only component that reads parameters from
//! the [`ParameterSource`].
//!
//! # Parameter resolution
//!
//! Logical [`ParameterKey`]s are resolved to entity ids once, at
//! construction, into a [`ParameterMap`].  At runtime a parameter whose
//! entity is missing, has no state, or is `unknown`/`unavailable` resolves to
//! `None`; callers keep the previous value or fall back to a documented
//! default, never to zero.  Enable switches are fail-open: an absent switch
//! reads as `true`.
//!
//! # Control cycle
//!
//! [`DeviceHandle::run_cycle`] reads the process variable and every
//! parameter (each read is a suspension point), then applies them to the
//! controller, computes the output, and records history in one synchronous
//! section.  A cycle without a usable sensor reading is skipped and leaves
//! no trace; a cycle whose handle was closed while it was suspended is
//! abandoned without touching the handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simplepid_control::{CycleHistory, PidController};
use simplepid_params::ParameterSource;
use simplepid_types::{Contributions, EntityId, ParameterKey, Preset, Tunings};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::set_output::preset_value;

pub const DEFAULT_INPUT_RANGE_MIN: f64 = 0.0;
pub const DEFAULT_INPUT_RANGE_MAX: f64 = 100.0;
pub const DEFAULT_OUTPUT_RANGE_MIN: f64 = 0.0;
pub const DEFAULT_OUTPUT_RANGE_MAX: f64 = 100.0;

pub const DEFAULT_KP: f64 = 1.0;
pub const DEFAULT_KI: f64 = 0.1;
pub const DEFAULT_KD: f64 = 0.05;
pub const DEFAULT_SETPOINT: f64 = 50.0;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Static configuration of one controller instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Instance identifier; parameter unique ids are `<name>_<key>`.
    pub name: String,
    /// Entity holding the process variable.
    pub sensor_entity_id: EntityId,
    #[serde(default = "default_input_range_min")]
    pub input_range_min: f64,
    #[serde(default = "default_input_range_max")]
    pub input_range_max: f64,
    #[serde(default = "default_output_range_min")]
    pub output_range_min: f64,
    #[serde(default = "default_output_range_max")]
    pub output_range_max: f64,
}

fn default_input_range_min() -> f64 {
    DEFAULT_INPUT_RANGE_MIN
}
fn default_input_range_max() -> f64 {
    DEFAULT_INPUT_RANGE_MAX
}
fn default_output_range_min() -> f64 {
    DEFAULT_OUTPUT_RANGE_MIN
}
fn default_output_range_max() -> f64 {
    DEFAULT_OUTPUT_RANGE_MAX
}

impl DeviceConfig {
    pub fn new(name: &str, sensor_entity_id: impl Into<EntityId>) -> Self {
        Self {
            name: name.to_string(),
            sensor_entity_id: sensor_entity_id.into(),
            input_range_min: DEFAULT_INPUT_RANGE_MIN,
            input_range_max: DEFAULT_INPUT_RANGE_MAX,
            output_range_min: DEFAULT_OUTPUT_RANGE_MIN,
            output_range_max: DEFAULT_OUTPUT_RANGE_MAX,
        }
    }

    pub fn with_output_range(mut self, min: f64, max: f64) -> Self {
        self.output_range_min = min;
        self.output_range_max = max;
        self
    }

    pub fn with_input_range(mut self, min: f64, max: f64) -> Self {
        self.input_range_min = min;
        self.input_range_max = max;
        self
    }

    /// Entity id of the published controller output.
    pub fn output_entity_id(&self) -> EntityId {
        EntityId::from(format!("sensor.{}_pid_output", self.name.to_lowercase()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ParameterMap
// ─────────────────────────────────────────────────────────────────────────────

/// Logical parameter name → resolved entity id, built once per instance.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    entities: BTreeMap<ParameterKey, EntityId>,
}

impl ParameterMap {
    /// Resolve every [`ParameterKey`] of `instance` against `source`.
    ///
    /// Keys without a registered entity are reported here, once, and
    /// resolve to `None` for the lifetime of the instance.
    pub fn build(source: &dyn ParameterSource, instance: &str) -> Self {
        let mut entities = BTreeMap::new();
        for key in ParameterKey::ALL {
            let unique_id = key.unique_id(instance);
            match source.resolve(key.platform(), &unique_id) {
                Some(entity_id) => {
                    entities.insert(key, entity_id);
                }
                None => {
                    debug!(
                        instance,
                        platform = %key.platform(),
                        unique_id,
                        "No entity found for parameter"
                    );
                }
            }
        }
        Self { entities }
    }

    pub fn get(&self, key: ParameterKey) -> Option<&EntityId> {
        self.entities.get(&key)
    }

    /// Every resolved entity, in key order.
    pub fn entities(&self) -> impl Iterator<Item = (ParameterKey, &EntityId)> {
        self.entities.iter().map(|(k, v)| (*k, v))
    }

    /// Keys that did not resolve.
    pub fn missing(&self) -> Vec<ParameterKey> {
        ParameterKey::ALL
            .into_iter()
            .filter(|k| !self.entities.contains_key(k))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle state
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one control cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// A new output was computed and recorded.
    Completed(f64),
    /// No usable input (or no held output in manual mode); nothing recorded.
    Skipped,
    /// The handle was closed while the cycle was suspended.
    Abandoned,
}

/// Parameters gathered at the start of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CycleParameters {
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
    pub setpoint: Option<f64>,
    pub sample_time: Option<f64>,
    pub output_min: Option<f64>,
    pub output_max: Option<f64>,
    pub starting_output: Option<f64>,
    pub auto_mode: bool,
    pub proportional_on_measurement: bool,
    pub windup_protection: bool,
    pub start_mode: Option<String>,
}

/// Mutable state of a handle.  Only ever touched inside one synchronous
/// section; the lock is never held across an `.await`.
#[derive(Debug)]
pub(crate) struct HandleState {
    pub pid: PidController,
    pub last_known_output: Option<f64>,
    pub last_contributions: Option<Contributions>,
    pub history: CycleHistory,
    pub last_update_timestamp: Option<Instant>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_measured_sample_time: Option<f64>,
}

impl HandleState {
    fn new(config: &DeviceConfig) -> Self {
        let mut pid = PidController::new(
            Tunings::new(DEFAULT_KP, DEFAULT_KI, DEFAULT_KD),
            DEFAULT_SETPOINT,
        );
        if let Err(e) = pid.set_output_limits(config.output_range_min, config.output_range_max) {
            warn!(instance = %config.name, error = %e, "configured output range rejected; output is unbounded");
        }
        Self {
            pid,
            last_known_output: None,
            last_contributions: None,
            history: CycleHistory::default(),
            last_update_timestamp: None,
            last_update_at: None,
            last_measured_sample_time: None,
        }
    }

    /// Push the gathered parameters into the controller and follow the
    /// `auto_mode` switch.
    fn apply(&mut self, config: &DeviceConfig, params: &CycleParameters) {
        let current = self.pid.tunings();
        self.pid.set_tunings(Tunings {
            kp: params.kp.unwrap_or(current.kp),
            ki: params.ki.unwrap_or(current.ki),
            kd: params.kd.unwrap_or(current.kd),
        });
        if let Some(setpoint) = params.setpoint {
            self.pid.set_setpoint(setpoint);
        }
        if let Some(sample_time) = params.sample_time {
            self.pid
                .set_sample_time((sample_time > 0.0).then_some(sample_time));
        }

        self.pid.set_windup_protection(params.windup_protection);
        self.pid
            .set_proportional_on_measurement(params.proportional_on_measurement);
        let min = params.output_min.unwrap_or(config.output_range_min);
        let max = params.output_max.unwrap_or(config.output_range_max);
        if let Err(e) = self.pid.set_output_limits(min, max) {
            warn!(instance = %config.name, error = %e, "keeping previous output limits");
        }

        match (params.auto_mode, self.pid.auto_mode()) {
            (true, false) => {
                let preset = match params.start_mode.as_deref() {
                    None => Preset::ZeroStart,
                    Some(name) => name.parse().unwrap_or_else(|_| {
                        warn!(instance = %config.name, start_mode = name, "unknown start mode; using zero_start");
                        Preset::ZeroStart
                    }),
                };
                let seed = preset_value(preset, self.last_known_output, params.starting_output);
                self.pid.set_auto_mode(true, Some(seed));
                info!(instance = %config.name, %preset, seed, "auto mode enabled");
            }
            (false, true) => {
                self.pid.set_auto_mode(false, None);
                info!(instance = %config.name, held = ?self.pid.last_output(), "manual mode enabled");
            }
            _ => {}
        }
    }

    /// Compute, time-stamp, and record one cycle.
    fn compute(&mut self, input: f64, now: Instant) -> CycleOutcome {
        let Some(output) = self.pid.update(input, now.into_std()) else {
            debug!("manual mode without a held output; cycle skipped");
            return CycleOutcome::Skipped;
        };

        if let Some(previous) = self.last_update_timestamp {
            self.last_measured_sample_time = Some((now - previous).as_secs_f64());
        }
        self.last_update_timestamp = Some(now);
        self.last_update_at = Some(Utc::now());

        let contributions = self.pid.contributions();
        self.last_contributions = Some(contributions);
        self.record_cycle(
            input,
            output,
            self.pid.tunings(),
            contributions,
            self.last_measured_sample_time,
        );
        CycleOutcome::Completed(output)
    }

    pub fn record_cycle(
        &mut self,
        input: f64,
        output: f64,
        tunings: Tunings,
        contributions: Contributions,
        sample_time: Option<f64>,
    ) {
        self.history
            .record(input, output, tunings, contributions, sample_time);
    }
}

/// Point-in-time copy of a handle's public fields.
#[derive(Debug, Clone, Serialize)]
pub struct HandleSnapshot {
    pub auto_mode: bool,
    pub tunings: Tunings,
    pub setpoint: f64,
    pub sample_time: Option<f64>,
    pub output_limits: (f64, f64),
    pub held_output: Option<f64>,
    pub last_known_output: Option<f64>,
    pub last_contributions: Option<Contributions>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_measured_sample_time: Option<f64>,
    pub history: CycleHistory,
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceHandle
// ─────────────────────────────────────────────────────────────────────────────

pub struct DeviceHandle {
    config: DeviceConfig,
    parameters: ParameterMap,
    source: Arc<dyn ParameterSource>,
    state: Mutex<HandleState>,
    closed: AtomicBool,
}

impl DeviceHandle {
    pub fn new(config: DeviceConfig, parameters: ParameterMap, source: Arc<dyn ParameterSource>) -> Self {
        let state = HandleState::new(&config);
        Self {
            config,
            parameters,
            source,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub(crate) fn source(&self) -> &Arc<dyn ParameterSource> {
        &self.source
    }

    // A panic inside the synchronous section leaves the state at a
    // cycle boundary, so a poisoned lock is still usable.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Parameter resolution ────────────────────────────────────────────────

    async fn known_state(&self, key: ParameterKey) -> Option<(EntityId, String)> {
        let entity_id = self.parameters.get(key)?;
        let state = self.source.state(entity_id).await;
        debug!(
            instance = %self.config.name,
            %key,
            %entity_id,
            state = state.as_ref().map(|s| s.value.to_string()),
            "parameter lookup"
        );
        let value = state?.value.as_known()?.to_string();
        Some((entity_id.clone(), value))
    }

    /// Current numeric value of `key`, or `None` when absent, unavailable,
    /// or unparsable.
    pub async fn resolve_numeric_parameter(&self, key: ParameterKey) -> Option<f64> {
        let (entity_id, raw) = self.known_state(key).await?;
        match raw.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                error!(%entity_id, state = %raw, "Could not parse state as float");
                None
            }
        }
    }

    /// Current option of selector `key`, or `None` when absent or unavailable.
    pub async fn resolve_enum_parameter(&self, key: ParameterKey) -> Option<String> {
        self.known_state(key).await.map(|(_, value)| value)
    }

    /// `true` when switch `key` is `"on"`, absent, or unavailable.
    pub async fn resolve_boolean_parameter(&self, key: ParameterKey) -> bool {
        match self.known_state(key).await {
            Some((_, value)) => value == "on",
            None => true,
        }
    }

    /// Current process variable, or `None` when the sensor is missing,
    /// unavailable, or reports a non-numeric value.
    pub async fn read_process_variable(&self) -> Option<f64> {
        let sensor = &self.config.sensor_entity_id;
        let state = self.source.state(sensor).await?;
        let raw = state.value.as_known()?;
        match raw.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(entity_id = %sensor, state = raw, "Sensor invalid value. PID-calculation skipped.");
                None
            }
        }
    }

    pub(crate) async fn gather_parameters(&self) -> CycleParameters {
        CycleParameters {
            kp: self.resolve_numeric_parameter(ParameterKey::Kp).await,
            ki: self.resolve_numeric_parameter(ParameterKey::Ki).await,
            kd: self.resolve_numeric_parameter(ParameterKey::Kd).await,
            setpoint: self.resolve_numeric_parameter(ParameterKey::Setpoint).await,
            sample_time: self.resolve_numeric_parameter(ParameterKey::SampleTime).await,
            output_min: self.resolve_numeric_parameter(ParameterKey::OutputMin).await,
            output_max: self.resolve_numeric_parameter(ParameterKey::OutputMax).await,
            starting_output: self
                .resolve_numeric_parameter(ParameterKey::StartingOutput)
                .await,
            auto_mode: self.resolve_boolean_parameter(ParameterKey::AutoMode).await,
            proportional_on_measurement: self
                .resolve_boolean_parameter(ParameterKey::ProportionalOnMeasurement)
                .await,
            windup_protection: self
                .resolve_boolean_parameter(ParameterKey::WindupProtection)
                .await,
            start_mode: self.resolve_enum_parameter(ParameterKey::StartMode).await,
        }
    }

    // ── Cycle ───────────────────────────────────────────────────────────────

    /// Run one control cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(input) = self.read_process_variable().await else {
            debug!(instance = %self.config.name, "no process variable; cycle skipped");
            return CycleOutcome::Skipped;
        };
        let params = self.gather_parameters().await;

        if self.is_closed() {
            debug!(instance = %self.config.name, "handle closed mid-cycle; result abandoned");
            return CycleOutcome::Abandoned;
        }

        let mut state = self.lock_state();
        state.apply(&self.config, &params);
        let outcome = state.compute(input, Instant::now());
        debug!(instance = %self.config.name, input, ?outcome, "cycle finished");
        outcome
    }

    /// Append one entry to each history buffer.
    pub fn record_cycle(
        &self,
        input: f64,
        output: f64,
        tunings: Tunings,
        contributions: Contributions,
        sample_time: Option<f64>,
    ) {
        self.lock_state()
            .record_cycle(input, output, tunings, contributions, sample_time);
    }

    // ── Read-only views ─────────────────────────────────────────────────────

    pub fn last_known_output(&self) -> Option<f64> {
        self.lock_state().last_known_output
    }

    pub fn auto_mode(&self) -> bool {
        self.lock_state().pid.auto_mode()
    }

    /// Output the controller currently returns or holds.
    pub fn held_output(&self) -> Option<f64> {
        self.lock_state().pid.last_output()
    }

    pub fn history(&self) -> CycleHistory {
        self.lock_state().history.clone()
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        let state = self.lock_state();
        let limits = state.pid.output_limits();
        HandleSnapshot {
            auto_mode: state.pid.auto_mode(),
            tunings: state.pid.tunings(),
            setpoint: state.pid.setpoint(),
            sample_time: state.pid.sample_time(),
            output_limits: (limits.min, limits.max),
            held_output: state.pid.last_output(),
            last_known_output: state.last_known_output,
            last_contributions: state.last_contributions,
            last_update: state.last_update_at,
            last_measured_sample_time: state.last_measured_sample_time,
            history: state.history.clone(),
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Mark the handle as discarded; in-flight cycles abandon their result.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
