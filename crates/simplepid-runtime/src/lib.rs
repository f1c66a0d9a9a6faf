//! `simplepid-runtime` – controller instances and the output override
//!
//! Wires the Control State to live parameters and drives it.
//!
//! # Modules
//!
//! - [`device`] – [`DeviceHandle`]: resolves named parameters and the
//!   process variable, runs one control cycle, and records history.
//! - [`coordinator`] – [`RefreshCoordinator`]: the published output and
//!   coalesced refresh requests (`Idle → RefreshPending → Refreshing`).
//! - [`instance`] – [`ControllerInstance`]: setup with retry on a not-ready
//!   sensor, parameter subscriptions, periodic refresh, and teardown.
//! - [`registry`] – [`ControllerRegistry`]: loaded instances and the
//!   entity → instance dispatch table.
//! - [`set_output`] – [`OutputOverrideService`]: the "set output" operation
//!   with auto/manual semantics and preset resolution.
//! - [`platform`] – [`register_parameter_entities`]: in-process parameter
//!   entities for a configured instance.
//! - [`diagnostics`] – [`DiagnosticsSnapshot`]: read-only JSON export.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP export.
//!
//! # Concurrency
//!
//! Everything runs on a single-threaded Tokio runtime.  Handle state is
//! mutated only inside synchronous sections; no lock is held across an
//! `.await`, so an override interleaving with a refresh sees either the
//! state before or after a cycle, never a partial update.

pub mod coordinator;
pub mod device;
pub mod diagnostics;
pub mod instance;
pub mod platform;
pub mod registry;
pub mod set_output;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use coordinator::{RefreshCoordinator, RefreshDisposition, RefreshState, RefreshStats, RefreshTarget};
pub use device::{CycleOutcome, DeviceConfig, DeviceHandle, HandleSnapshot, ParameterMap};
pub use diagnostics::DiagnosticsSnapshot;
pub use instance::{ControllerInstance, RetryPolicy, RuntimeSettings, setup_with_retry};
pub use platform::{ParameterSeeds, register_parameter_entities};
pub use registry::ControllerRegistry;
pub use set_output::{OutputOverrideService, OverrideMode, OverrideOutcome, preset_value};
pub use telemetry::{TracerProviderGuard, init_tracing};
