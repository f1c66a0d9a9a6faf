//! [`HistoryBuffer`] – fixed-capacity FIFO of recent samples.
//!
//! Pushing into a full buffer evicts the oldest entry, so after any number
//! of pushes the buffer holds at most `capacity` entries in arrival order.
//!
//! [`CycleHistory`] groups the five buffers a device handle fills once per
//! completed control cycle.
//!
//! # Example
//!
//! ```rust
//! use simplepid_control::history::HistoryBuffer;
//!
//! let mut buf = HistoryBuffer::new(3);
//! for v in 1..=5 {
//!     buf.push(v);
//! }
//! assert_eq!(buf.to_vec(), vec![3, 4, 5]);
//! ```

use std::collections::VecDeque;

use serde::Serialize;
use simplepid_types::{Contributions, Tunings};

/// Capacity of every buffer in [`CycleHistory`].
pub const HISTORY_CAPACITY: usize = 10;

/// Bounded FIFO; the oldest entry is dropped on overflow.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct HistoryBuffer<T> {
    #[serde(skip)]
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> HistoryBuffer<T> {
    /// Create an empty buffer.  A `capacity` of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append `value`, evicting the oldest entry when full.
    pub fn push(&mut self, value: T) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> HistoryBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T> Default for HistoryBuffer<T> {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

/// The five telemetry buffers of one controller instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleHistory {
    pub input: HistoryBuffer<f64>,
    pub output: HistoryBuffer<f64>,
    pub pid_parameters: HistoryBuffer<Tunings>,
    pub pid_contributions: HistoryBuffer<Contributions>,
    /// Measured seconds between cycles; `None` for the first cycle.
    pub sample_time: HistoryBuffer<Option<f64>>,
}

impl CycleHistory {
    /// Append one entry to each buffer.
    pub fn record(
        &mut self,
        input: f64,
        output: f64,
        tunings: Tunings,
        contributions: Contributions,
        sample_time: Option<f64>,
    ) {
        self.input.push(input);
        self.output.push(output);
        self.pid_parameters.push(tunings);
        self.pid_contributions.push(contributions);
        self.sample_time.push(sample_time);
    }

    /// Number of recorded cycles still retained.
    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}
