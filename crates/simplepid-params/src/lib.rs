//! `simplepid-params` – The Parameter Source
//!
//! Keyed access to the live entity states a controller reads its tunings,
//! switches, selectors, and process variable from.
//!
//! # Modules
//!
//! - [`source`] – [`ParameterSource`]: the async contract the controller core
//!   depends on, plus the [`Subscription`] cancellation handle returned for
//!   change notifications.
//! - [`store`] – [`ParameterStore`]: an in-process implementation with an
//!   entity registry (`<platform>` + unique id → entity id) and per-entity
//!   change listeners.

pub mod source;
pub mod store;

pub use source::{Listener, ParameterSource, StateChange, Subscription};
pub use store::ParameterStore;
