//! Positional PID controller with auto/manual modes.
//!
//! The controller computes a corrective output that drives a measured value
//! toward a set-point.  It is host-agnostic: the caller supplies the
//! measurement and the instant at which it was taken, and receives the
//! clamped output.
//!
//! # Modes
//!
//! In **auto** mode every call to [`PidController::update`] computes a new
//! output.  In **manual** mode the controller returns the held output and
//! ignores the measurement; the held value only changes through
//! [`PidController::hold_output`].
//!
//! Re-entering auto mode via [`PidController::set_auto_mode`] resets the
//! internal state and seeds the integral accumulator with the supplied
//! output, so the first automatic computation continues from that point
//! instead of jumping.
//!
//! # Example
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use simplepid_control::pid::PidController;
//! use simplepid_types::Tunings;
//!
//! let mut pid = PidController::new(Tunings::new(1.0, 0.1, 0.0), 30.0);
//! pid.set_output_limits(0.0, 100.0).unwrap();
//!
//! let t0 = Instant::now();
//! let output = pid.update(25.0, t0).unwrap();
//! assert!(output > 0.0); // drives the measurement toward the set-point
//!
//! pid.set_auto_mode(false, None);
//! assert_eq!(pid.update(10.0, t0 + Duration::from_secs(1)), Some(output));
//! ```

use std::time::Instant;

use serde::{Deserialize, Serialize};
use simplepid_types::{Contributions, PidError, Tunings};
use tracing::debug;

/// Floor applied to the elapsed time so the derivative term never divides
/// by zero.
const MIN_DT: f64 = 1e-16;

/// Closed output range of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputLimits {
    pub min: f64,
    pub max: f64,
}

impl OutputLimits {
    /// No clamping at all.
    pub const UNBOUNDED: OutputLimits = OutputLimits {
        min: f64::NEG_INFINITY,
        max: f64::INFINITY,
    };

    /// # Errors
    ///
    /// Returns [`PidError::InvalidLimits`] when `min > max` or either bound
    /// is NaN.
    pub fn new(min: f64, max: f64) -> Result<Self, PidError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(PidError::InvalidLimits { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// A tunable PID controller for closed-loop feedback control.
#[derive(Debug, Clone)]
pub struct PidController {
    tunings: Tunings,
    setpoint: f64,
    sample_time: Option<f64>,
    output_limits: OutputLimits,
    auto_mode: bool,
    proportional_on_measurement: bool,
    windup_protection: bool,

    proportional: f64,
    integral: f64,
    derivative: f64,
    last_input: Option<f64>,
    last_output: Option<f64>,
    last_time: Option<Instant>,
}

impl PidController {
    /// Create a controller in auto mode with unbounded output, no sample
    /// time, proportional-on-error, and windup protection enabled.
    pub fn new(tunings: Tunings, setpoint: f64) -> Self {
        Self {
            tunings,
            setpoint,
            sample_time: None,
            output_limits: OutputLimits::UNBOUNDED,
            auto_mode: true,
            proportional_on_measurement: false,
            windup_protection: true,
            proportional: 0.0,
            integral: 0.0,
            derivative: 0.0,
            last_input: None,
            last_output: None,
            last_time: None,
        }
    }

    pub fn tunings(&self) -> Tunings {
        self.tunings
    }

    pub fn set_tunings(&mut self, tunings: Tunings) {
        self.tunings = tunings;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    pub fn sample_time(&self) -> Option<f64> {
        self.sample_time
    }

    /// Minimum interval in seconds between two computations; `None`
    /// computes on every call.
    pub fn set_sample_time(&mut self, sample_time: Option<f64>) {
        self.sample_time = sample_time;
    }

    pub fn output_limits(&self) -> OutputLimits {
        self.output_limits
    }

    /// Clamp the output (and, with windup protection, the integral term) to
    /// `[min, max]`.  The held output is re-clamped immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PidError::InvalidLimits`] when `min > max`; the previous
    /// limits stay in force.
    pub fn set_output_limits(&mut self, min: f64, max: f64) -> Result<(), PidError> {
        self.output_limits = OutputLimits::new(min, max)?;
        if self.windup_protection {
            self.integral = self.output_limits.clamp(self.integral);
        }
        self.last_output = self.last_output.map(|v| self.output_limits.clamp(v));
        Ok(())
    }

    pub fn proportional_on_measurement(&self) -> bool {
        self.proportional_on_measurement
    }

    pub fn set_proportional_on_measurement(&mut self, enabled: bool) {
        self.proportional_on_measurement = enabled;
    }

    pub fn windup_protection(&self) -> bool {
        self.windup_protection
    }

    pub fn set_windup_protection(&mut self, enabled: bool) {
        self.windup_protection = enabled;
    }

    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    /// Switch between auto (`true`) and manual (`false`) mode.
    ///
    /// Entering auto mode from manual resets the internal state and seeds
    /// the integral with `last_output` (or `0.0`), clamped to the output
    /// limits.  Every other transition only flips the flag.
    pub fn set_auto_mode(&mut self, enabled: bool, last_output: Option<f64>) {
        if enabled && !self.auto_mode {
            self.reset();
            self.integral = self.output_limits.clamp(last_output.unwrap_or(0.0));
            debug!(seed = self.integral, "PID re-entered auto mode");
        }
        self.auto_mode = enabled;
    }

    /// Last output returned or held.
    pub fn last_output(&self) -> Option<f64> {
        self.last_output
    }

    /// Overwrite the held output.  Returns the value actually held after
    /// clamping.
    pub fn hold_output(&mut self, value: f64) -> f64 {
        let held = self.output_limits.clamp(value);
        self.last_output = Some(held);
        held
    }

    /// Breakdown of the most recent computation.
    pub fn contributions(&self) -> Contributions {
        Contributions {
            p: self.proportional,
            i: self.integral,
            d: self.derivative,
        }
    }

    /// Compute the output for `input` measured at `now`.
    ///
    /// Returns the held output in manual mode (`None` if nothing was ever
    /// held).  When a sample time is configured and has not yet elapsed
    /// since the last computation, the previous output is returned and no
    /// state advances.
    pub fn update(&mut self, input: f64, now: Instant) -> Option<f64> {
        if !self.auto_mode {
            return self.last_output;
        }

        let dt = self
            .last_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0)
            .max(MIN_DT);

        if let (Some(sample_time), Some(previous)) = (self.sample_time, self.last_output)
            && dt < sample_time
        {
            return Some(previous);
        }

        let Tunings { kp, ki, kd } = self.tunings;
        let error = self.setpoint - input;
        let d_input = self.last_input.map_or(0.0, |last| input - last);

        if self.proportional_on_measurement {
            self.proportional -= kp * d_input;
        } else {
            self.proportional = kp * error;
        }

        self.integral += ki * error * dt;
        if self.windup_protection {
            self.integral = self.output_limits.clamp(self.integral);
        }

        // Derivative on measurement avoids a kick on set-point changes.
        self.derivative = -kd * d_input / dt;

        let output = self
            .output_limits
            .clamp(self.proportional + self.integral + self.derivative);

        self.last_output = Some(output);
        self.last_input = Some(input);
        self.last_time = Some(now);
        Some(output)
    }

    /// Clear the accumulated terms, the input memory, and the held output.
    pub fn reset(&mut self) {
        self.proportional = 0.0;
        self.integral = 0.0;
        self.derivative = 0.0;
        self.last_input = None;
        self.last_output = None;
        self.last_time = None;
    }
}
