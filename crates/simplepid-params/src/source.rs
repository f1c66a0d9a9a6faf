//! The [`ParameterSource`] contract.
//!
//! The controller core never owns the parameter values it reads.  It asks a
//! source to resolve logical unique ids to entity ids once, reads entity
//! states at each cycle, and registers listeners that fire on change.
//!
//! # Contract
//!
//! * `resolve` – entity registry lookup by platform and unique id
//!   (`<instance>_<parameter>`).  `None` means the entity was never
//!   registered.
//! * `state` – current state of an entity, `None` when it has none.  The
//!   `"unknown"` and `"unavailable"` sentinels are returned as-is; callers
//!   treat them as "no value".
//! * `subscribe` – deliver every subsequent [`StateChange`] of `entity` to
//!   `listener` until the returned [`Subscription`] is cancelled.

use std::fmt;

use async_trait::async_trait;
use simplepid_types::{EntityId, ParameterState, Platform};
use tokio::sync::mpsc;

/// A single observed state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub entity_id: EntityId,
    pub old_state: Option<ParameterState>,
    pub new_state: ParameterState,
}

/// Channel end that receives [`StateChange`] notifications.
pub type Listener = mpsc::UnboundedSender<StateChange>;

#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Look up the entity registered for `unique_id` on `platform`.
    fn resolve(&self, platform: Platform, unique_id: &str) -> Option<EntityId>;

    /// Read the current state of `entity`.
    async fn state(&self, entity: &EntityId) -> Option<ParameterState>;

    /// Forward every change of `entity` to `listener`.
    fn subscribe(&self, entity: &EntityId, listener: Listener) -> Subscription;
}

/// Cancellation handle for a change listener.
///
/// [`Subscription::cancel`] runs the unsubscribe action at most once; later
/// calls and the implicit cancel on drop are no-ops.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Remove the listener.  Returns `true` only for the call that actually
    /// cancelled it.
    pub fn cancel(&mut self) -> bool {
        match self.unsubscribe.take() {
            Some(unsubscribe) => {
                unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        assert!(sub.cancel());
        assert!(!sub.cancel());
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_cancels_active_subscription() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
