use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entity platforms a controller instance exposes or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Read-only measurement, e.g. the process-variable sensor.
    Sensor,
    /// Numeric tunable (gains, setpoint, limits, sample time).
    Number,
    /// On/off enable switch.
    Switch,
    /// Named option selector.
    Select,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
            Platform::Number => "number",
            Platform::Switch => "switch",
            Platform::Select => "select",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified entity identifier, e.g. `"number.pid2_kp"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Build `<platform>.<object_id>`.
    pub fn new(platform: Platform, object_id: &str) -> Self {
        Self(format!("{platform}.{object_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The value half of an entity state.
///
/// The two sentinels mean "no value" and are treated identically by every
/// consumer in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Known(String),
    Unknown,
    Unavailable,
}

impl StateValue {
    /// Map a raw state string onto [`StateValue`], recognising the
    /// `"unknown"` and `"unavailable"` sentinels.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "unknown" => StateValue::Unknown,
            "unavailable" => StateValue::Unavailable,
            other => StateValue::Known(other.to_string()),
        }
    }

    /// The concrete value, or `None` for either sentinel.
    pub fn as_known(&self) -> Option<&str> {
        match self {
            StateValue::Known(v) => Some(v),
            StateValue::Unknown | StateValue::Unavailable => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Known(v) => f.write_str(v),
            StateValue::Unknown => f.write_str("unknown"),
            StateValue::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Entity state as held by a parameter source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub value: StateValue,
    /// Last time `value` changed.
    pub last_changed: DateTime<Utc>,
    /// Last time the state was written, changed or not.
    pub last_updated: DateTime<Utc>,
}

/// Logical parameter names of a controller instance.
///
/// Each key lives on a fixed [`Platform`] and is registered under the unique
/// id `<instance>_<key>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKey {
    Kp,
    Ki,
    Kd,
    Setpoint,
    SampleTime,
    OutputMin,
    OutputMax,
    StartingOutput,
    AutoMode,
    ProportionalOnMeasurement,
    WindupProtection,
    StartMode,
}

impl ParameterKey {
    pub const ALL: [ParameterKey; 12] = [
        ParameterKey::Kp,
        ParameterKey::Ki,
        ParameterKey::Kd,
        ParameterKey::Setpoint,
        ParameterKey::SampleTime,
        ParameterKey::OutputMin,
        ParameterKey::OutputMax,
        ParameterKey::StartingOutput,
        ParameterKey::AutoMode,
        ParameterKey::ProportionalOnMeasurement,
        ParameterKey::WindupProtection,
        ParameterKey::StartMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterKey::Kp => "kp",
            ParameterKey::Ki => "ki",
            ParameterKey::Kd => "kd",
            ParameterKey::Setpoint => "setpoint",
            ParameterKey::SampleTime => "sample_time",
            ParameterKey::OutputMin => "output_min",
            ParameterKey::OutputMax => "output_max",
            ParameterKey::StartingOutput => "starting_output",
            ParameterKey::AutoMode => "auto_mode",
            ParameterKey::ProportionalOnMeasurement => "proportional_on_measurement",
            ParameterKey::WindupProtection => "windup_protection",
            ParameterKey::StartMode => "start_mode",
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            ParameterKey::AutoMode
            | ParameterKey::ProportionalOnMeasurement
            | ParameterKey::WindupProtection => Platform::Switch,
            ParameterKey::StartMode => Platform::Select,
            _ => Platform::Number,
        }
    }

    /// Unique id under which the parameter entity of `instance` is registered.
    pub fn unique_id(&self, instance: &str) -> String {
        format!("{instance}_{}", self.as_str())
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named rules for deriving an output target without an explicit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Always `0.0`.
    ZeroStart,
    /// The last output accepted by an override, `0.0` if none.
    LastKnownValue,
    /// The `starting_output` parameter, `0.0` if unset.
    StartupValue,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::ZeroStart, Preset::LastKnownValue, Preset::StartupValue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::ZeroStart => "zero_start",
            Preset::LastKnownValue => "last_known_value",
            Preset::StartupValue => "startup_value",
        }
    }
}

impl FromStr for Preset {
    type Err = PidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PidError::InvalidPreset(s.to_string()))
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Tunings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Tunings {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

/// Term-wise breakdown of one controller output.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Contributions {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// One target or several; only a single target is accepted by the
/// override service, the list form exists so callers get a precise error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSelector {
    Single(String),
    Multiple(Vec<String>),
}

/// Payload of the `set_output` operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetOutputRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<TargetSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl SetOutputRequest {
    pub fn with_value(entity_id: &str, value: f64) -> Self {
        Self {
            entity_id: Some(TargetSelector::Single(entity_id.to_string())),
            value: Some(value),
            preset: None,
        }
    }

    pub fn with_preset(entity_id: &str, preset: &str) -> Self {
        Self {
            entity_id: Some(TargetSelector::Single(entity_id.to_string())),
            value: None,
            preset: Some(preset.to_string()),
        }
    }
}

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PidError {
    #[error("Sensor {0} not ready")]
    NotReady(String),

    #[error("entity_id is required")]
    MissingTarget,

    #[error("Exactly one entity_id is required, got {0}")]
    MultipleTargets(usize),

    #[error("Unknown entity {0}")]
    UnknownTarget(String),

    #[error("PID controller {0} not loaded")]
    NotLoaded(String),

    #[error("Either preset or value required")]
    PresetOrValue,

    #[error("Invalid preset '{0}'")]
    InvalidPreset(String),

    #[error("Value {value} out of range {min}-{max}")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Invalid output limits: min {min}, max {max}")]
    InvalidLimits { min: f64, max: f64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PidError {
    /// `true` when the host should retry the failed operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PidError::NotReady(_))
    }
}
