//! [`RefreshCoordinator`] – owns the published output and arbitrates refresh
//! requests for one controller instance.
//!
//! # State machine
//!
//! ```text
//!   Idle ──request──▶ RefreshPending ──▶ Refreshing ──▶ Idle
//!                          ▲                 ▲
//!                          └── requests absorbed ──┘
//! ```
//!
//! A request that arrives while a refresh is pending or running is absorbed
//! into it, so at most one recomputation is ever in flight per instance.
//! The pending phase yields once to the scheduler, which lets requests
//! issued in the same burst (e.g. several parameter changes) coalesce.
//!
//! The published value lives in a [`tokio::sync::watch`] channel: readers
//! always see the latest output and never block the publisher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::device::{CycleOutcome, DeviceHandle};

/// Something a coordinator can ask to recompute.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    async fn refresh(&self) -> CycleOutcome;
}

#[async_trait]
impl RefreshTarget for DeviceHandle {
    async fn refresh(&self) -> CycleOutcome {
        self.run_cycle().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    RefreshPending,
    Refreshing,
}

/// What happened to one [`RefreshCoordinator::request_refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshDisposition {
    /// This request ran the cycle.
    Ran(CycleOutcome),
    /// Absorbed into a refresh already pending or running.
    Coalesced,
    /// The coordinator was closed.
    Closed,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub requested: u64,
    pub completed: u64,
    pub coalesced: u64,
}

pub struct RefreshCoordinator {
    name: String,
    target: Arc<dyn RefreshTarget>,
    state: Mutex<RefreshState>,
    output: watch::Sender<Option<f64>>,
    closed: AtomicBool,
    requested: AtomicU64,
    completed: AtomicU64,
    coalesced: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(name: impl Into<String>, target: Arc<dyn RefreshTarget>) -> Self {
        let (output, _) = watch::channel(None);
        Self {
            name: name.into(),
            target,
            state: Mutex::new(RefreshState::Idle),
            output,
            closed: AtomicBool::new(false),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the published output.  Does not recompute.
    pub fn publish(&self, value: f64) {
        trace!(coordinator = %self.name, value, "publishing output");
        self.output.send_replace(Some(value));
    }

    /// Latest published output.
    pub fn data(&self) -> Option<f64> {
        *self.output.borrow()
    }

    /// Receiver that observes every later publication.
    pub fn subscribe(&self) -> watch::Receiver<Option<f64>> {
        self.output.subscribe()
    }

    pub fn state(&self) -> RefreshState {
        *lock(&self.state)
    }

    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            requested: self.requested.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            coalesced: self.coalesced.load(Ordering::SeqCst),
        }
    }

    /// Run one control cycle unless one is already pending or running.
    ///
    /// A completed cycle publishes its output.  Results of a cycle that
    /// finishes after [`close`](Self::close) are dropped.
    pub async fn request_refresh(&self) -> RefreshDisposition {
        self.requested.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return RefreshDisposition::Closed;
        }

        {
            let mut state = lock(&self.state);
            if *state != RefreshState::Idle {
                self.coalesced.fetch_add(1, Ordering::SeqCst);
                debug!(coordinator = %self.name, state = ?*state, "refresh coalesced");
                return RefreshDisposition::Coalesced;
            }
            *state = RefreshState::RefreshPending;
        }
        // Back to Idle however this future ends, including when dropped.
        let _idle = IdleOnDrop(&self.state);

        tokio::task::yield_now().await;
        if self.is_closed() {
            return RefreshDisposition::Closed;
        }

        *lock(&self.state) = RefreshState::Refreshing;
        let outcome = self.target.refresh().await;

        if self.is_closed() {
            debug!(coordinator = %self.name, "closed during refresh; result dropped");
            return RefreshDisposition::Closed;
        }
        if let CycleOutcome::Completed(value) = outcome {
            self.publish(value);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        RefreshDisposition::Ran(outcome)
    }

    /// Fire-and-forget variant of [`request_refresh`](Self::request_refresh).
    pub fn schedule_refresh(self: &Arc<Self>) -> JoinHandle<RefreshDisposition> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.request_refresh().await })
    }

    /// Request a refresh every `period`, starting one period from now.
    /// The task ends once the coordinator is closed.
    pub fn spawn_periodic(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if coordinator.is_closed() {
                    break;
                }
                coordinator.request_refresh().await;
            }
            debug!(coordinator = %coordinator.name, "periodic refresh stopped");
        })
    }

    /// Stop accepting refreshes and drop any in-flight result.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct IdleOnDrop<'a>(&'a Mutex<RefreshState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *lock(self.0) = RefreshState::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
