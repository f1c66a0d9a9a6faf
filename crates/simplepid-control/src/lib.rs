//! `simplepid-control` – Control State and telemetry history
//!
//! Pure, host-agnostic building blocks of a single control loop.
//!
//! # Modules
//!
//! - [`pid`] – [`PidController`]: the positional PID algorithm together with
//!   the auto/manual mode machine and bumpless re-entry into auto mode.
//! - [`history`] – [`HistoryBuffer`]: fixed-capacity FIFO used for recent
//!   samples, and [`CycleHistory`]: the five buffers recorded once per
//!   completed control cycle.

pub mod history;
pub mod pid;

pub use history::{CycleHistory, HISTORY_CAPACITY, HistoryBuffer};
pub use pid::{OutputLimits, PidController};
