//! The "set output" operation.
//!
//! One [`OutputOverrideService`] serves every loaded instance; requests are
//! dispatched by target entity through the [`ControllerRegistry`] it was
//! built with.
//!
//! # Protocol
//!
//! 1. Validate the request shape: exactly one target, exactly one of
//!    `value`/`preset`, a known preset name.
//! 2. Resolve the target to a loaded instance.
//! 3. Read what the target value depends on: the output bounds for an
//!    explicit value, `starting_output` for `startup_value`.  These reads are
//!    the only suspension points; an out-of-range value fails here.
//! 4. In one synchronous section: resolve the target value, record it as
//!    `last_known_output`, and either toggle auto mode off and on seeded with
//!    the target (auto) or hold the target directly (manual).
//! 5. Publish the target, or in manual mode the value actually held after
//!    clamping to the controller limits.  In auto mode schedule exactly one
//!    refresh.
//!
//! Every failure happens before step 4, so a rejected request never
//! mutates the instance.

use std::sync::Arc;

use serde::Serialize;
use simplepid_types::{EntityId, ParameterKey, PidError, Preset, SetOutputRequest, TargetSelector};
use tracing::{info, warn};

use crate::registry::ControllerRegistry;

/// Default for an unset output bound during range validation.
const UNSET_BOUND: f64 = 0.0;

/// Target value of `preset`.
///
/// `last_known` is the instance's `last_known_output` and `starting_output`
/// the current value of the `starting_output` parameter; either falls back
/// to `0.0` when absent.
pub fn preset_value(preset: Preset, last_known: Option<f64>, starting_output: Option<f64>) -> f64 {
    match preset {
        Preset::ZeroStart => 0.0,
        Preset::LastKnownValue => last_known.unwrap_or(0.0),
        Preset::StartupValue => starting_output.unwrap_or(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    Auto,
    Manual,
}

/// Result of an accepted override.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideOutcome {
    pub instance: String,
    pub target: EntityId,
    pub value: f64,
    pub mode: OverrideMode,
    pub refresh_requested: bool,
}

#[derive(Debug, Clone, Copy)]
enum Requested {
    Value(f64),
    Preset(Preset),
}

pub struct OutputOverrideService {
    registry: Arc<ControllerRegistry>,
}

impl OutputOverrideService {
    pub fn new(registry: Arc<ControllerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    /// Force the output of the instance owning the request's target.
    pub async fn set_output(&self, request: SetOutputRequest) -> Result<OverrideOutcome, PidError> {
        let result = self.apply(&request).await;
        if let Err(e) = &result {
            warn!(target_entity = ?request.entity_id, error = %e, "set_output rejected");
        }
        result
    }

    async fn apply(&self, request: &SetOutputRequest) -> Result<OverrideOutcome, PidError> {
        let target = single_target(request.entity_id.as_ref())?;
        let requested = match (request.value, request.preset.as_deref()) {
            (Some(value), None) => Requested::Value(value),
            (None, Some(name)) => Requested::Preset(name.parse()?),
            _ => return Err(PidError::PresetOrValue),
        };

        let instance = self.registry.resolve(&target)?;
        let handle = instance.handle();

        let mut starting_output = None;
        match requested {
            Requested::Value(value) => {
                let min = handle
                    .resolve_numeric_parameter(ParameterKey::OutputMin)
                    .await
                    .unwrap_or(UNSET_BOUND);
                let max = handle
                    .resolve_numeric_parameter(ParameterKey::OutputMax)
                    .await
                    .unwrap_or(UNSET_BOUND);
                if !(min..=max).contains(&value) {
                    return Err(PidError::OutOfRange { value, min, max });
                }
            }
            Requested::Preset(Preset::StartupValue) => {
                starting_output = handle
                    .resolve_numeric_parameter(ParameterKey::StartingOutput)
                    .await;
            }
            Requested::Preset(_) => {}
        }

        if instance.is_shut_down() {
            return Err(PidError::NotLoaded(instance.id().to_string()));
        }

        let (value, mode) = {
            let mut state = handle.lock_state();
            let value = match requested {
                Requested::Value(value) => value,
                Requested::Preset(preset) => {
                    preset_value(preset, state.last_known_output, starting_output)
                }
            };
            state.last_known_output = Some(value);
            if state.pid.auto_mode() {
                state.pid.set_auto_mode(false, None);
                state.pid.set_auto_mode(true, Some(value));
                (value, OverrideMode::Auto)
            } else {
                (state.pid.hold_output(value), OverrideMode::Manual)
            }
        };

        let coordinator = instance.coordinator();
        coordinator.publish(value);
        let refresh_requested = mode == OverrideMode::Auto;
        if refresh_requested {
            coordinator.schedule_refresh();
        }

        info!(instance = instance.id(), entity_id = %target, value, ?mode, "output overridden");
        Ok(OverrideOutcome {
            instance: instance.id().to_string(),
            target,
            value,
            mode,
            refresh_requested,
        })
    }
}

fn single_target(selector: Option<&TargetSelector>) -> Result<EntityId, PidError> {
    let id = match selector {
        None => return Err(PidError::MissingTarget),
        Some(TargetSelector::Single(id)) => id,
        Some(TargetSelector::Multiple(ids)) => match ids.as_slice() {
            [] => return Err(PidError::MissingTarget),
            [id] => id,
            many => return Err(PidError::MultipleTargets(many.len())),
        },
    };
    let id = id.trim();
    if id.is_empty() {
        return Err(PidError::MissingTarget);
    }
    Ok(EntityId::from(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{RefreshDisposition, RefreshState};
    use crate::testing::{
        GatedSource, INSTANCE, OUTPUT, entity, fixture_config, fixture_store, load_fixture, settle,
        settings,
    };

    fn request(value: Option<f64>, preset: Option<&str>) -> SetOutputRequest {
        SetOutputRequest {
            entity_id: Some(TargetSelector::Single(OUTPUT.into())),
            value,
            preset: preset.map(str::to_string),
        }
    }

    #[test]
    fn preset_table() {
        assert_eq!(preset_value(Preset::ZeroStart, Some(0.7), Some(0.4)), 0.0);
        assert_eq!(preset_value(Preset::LastKnownValue, Some(0.7), None), 0.7);
        assert_eq!(preset_value(Preset::LastKnownValue, None, None), 0.0);
        assert_eq!(preset_value(Preset::StartupValue, None, Some(0.4)), 0.4);
        assert_eq!(preset_value(Preset::StartupValue, Some(0.7), None), 0.0);
    }

    #[test]
    fn target_shapes() {
        assert_eq!(single_target(None), Err(PidError::MissingTarget));
        assert_eq!(
            single_target(Some(&TargetSelector::Multiple(vec![]))),
            Err(PidError::MissingTarget)
        );
        assert_eq!(
            single_target(Some(&TargetSelector::Single("  ".into()))),
            Err(PidError::MissingTarget)
        );
        assert_eq!(
            single_target(Some(&TargetSelector::Multiple(vec!["a.b".into(), "c.d".into()]))),
            Err(PidError::MultipleTargets(2))
        );
        assert_eq!(
            single_target(Some(&TargetSelector::Multiple(vec![OUTPUT.into()]))),
            Ok(EntityId::from(OUTPUT))
        );
    }

    #[tokio::test]
    async fn auto_mode_value_toggles_and_requests_one_refresh() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        settle().await;
        let before = instance.coordinator().stats();

        let outcome = service.set_output(request(Some(0.5), None)).await.unwrap();
        assert_eq!(outcome.mode, OverrideMode::Auto);
        assert!(outcome.refresh_requested);
        assert_eq!(outcome.instance, INSTANCE);
        assert_eq!(instance.handle().last_known_output(), Some(0.5));
        assert_eq!(instance.coordinator().data(), Some(0.5));
        {
            let state = instance.handle().lock_state();
            assert!(state.pid.auto_mode());
            assert_eq!(state.pid.contributions().i, 0.5);
        }

        settle().await;
        let after = instance.coordinator().stats();
        assert_eq!(after.requested - before.requested, 1);
        assert_eq!(after.completed - before.completed, 1);
    }

    #[tokio::test]
    async fn manual_mode_startup_preset_holds_without_refresh() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        store.set_state(&entity(ParameterKey::StartingOutput), "0.4");
        store.set_state(&entity(ParameterKey::AutoMode), "off");
        settle().await;
        assert!(!instance.handle().auto_mode());
        let before = instance.coordinator().stats();

        let outcome = service
            .set_output(request(None, Some("startup_value")))
            .await
            .unwrap();
        assert_eq!(outcome.mode, OverrideMode::Manual);
        assert!(!outcome.refresh_requested);
        assert_eq!(instance.handle().last_known_output(), Some(0.4));
        assert_eq!(instance.handle().held_output(), Some(0.4));
        assert_eq!(instance.coordinator().data(), Some(0.4));

        settle().await;
        assert_eq!(instance.coordinator().stats().requested, before.requested);
    }

    #[tokio::test]
    async fn manual_mode_publishes_the_clamped_held_value() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        store.set_state(&entity(ParameterKey::StartingOutput), "1.7");
        store.set_state(&entity(ParameterKey::AutoMode), "off");
        settle().await;
        assert!(!instance.handle().auto_mode());

        let outcome = service
            .set_output(request(None, Some("startup_value")))
            .await
            .unwrap();
        assert_eq!(outcome.value, 1.0);
        assert_eq!(instance.handle().held_output(), Some(1.0));
        assert_eq!(instance.coordinator().data(), instance.handle().held_output());
        assert_eq!(instance.handle().last_known_output(), Some(1.7));
    }

    #[tokio::test]
    async fn override_during_refresh_is_applied_whole_and_refresh_absorbed() {
        let store = fixture_store("25.0");
        let source = Arc::new(GatedSource::new(store.clone(), entity(ParameterKey::Kp)));
        let registry = Arc::new(ControllerRegistry::new(source.clone(), settings()));
        let instance = registry.load(fixture_config()).await.unwrap();
        let service = OutputOverrideService::new(Arc::clone(&registry));
        settle().await;
        let before = instance.coordinator().stats();
        let recorded = instance.handle().history().len();

        source.arm();
        let coordinator = Arc::clone(instance.coordinator());
        let cycle = tokio::spawn(async move { coordinator.request_refresh().await });
        source.wait_parked().await;
        assert_eq!(instance.coordinator().state(), RefreshState::Refreshing);

        let outcome = service.set_output(request(Some(0.5), None)).await.unwrap();
        assert!(outcome.refresh_requested);
        assert_eq!(instance.handle().last_known_output(), Some(0.5));
        assert_eq!(instance.coordinator().data(), Some(0.5));
        {
            let state = instance.handle().lock_state();
            assert!(state.pid.auto_mode());
            assert_eq!(state.pid.contributions().i, 0.5);
        }

        // The scheduled refresh runs while the cycle is still parked.
        settle().await;
        assert_eq!(instance.coordinator().stats().coalesced - before.coalesced, 1);

        source.release();
        assert!(matches!(cycle.await.unwrap(), RefreshDisposition::Ran(_)));
        settle().await;

        let after = instance.coordinator().stats();
        assert_eq!(after.requested - before.requested, 2);
        assert_eq!(after.completed - before.completed, 1);
        assert_eq!(after.coalesced - before.coalesced, 1);
        assert_eq!(instance.handle().history().len(), recorded + 1);
        assert_eq!(instance.handle().last_known_output(), Some(0.5));
        assert!((instance.handle().lock_state().pid.contributions().i - 0.5).abs() < 1e-9);
        assert_eq!(instance.coordinator().state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn last_known_value_preset_reuses_previous_override() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;

        let first = service.set_output(request(None, Some("last_known_value"))).await.unwrap();
        assert_eq!(first.value, 0.0);

        service.set_output(request(Some(0.8), None)).await.unwrap();
        settle().await;
        let again = service.set_output(request(None, Some("last_known_value"))).await.unwrap();
        assert_eq!(again.value, 0.8);
        assert_eq!(instance.handle().last_known_output(), Some(0.8));

        let zero = service.set_output(request(None, Some("zero_start"))).await.unwrap();
        assert_eq!(zero.value, 0.0);
    }

    #[tokio::test]
    async fn in_range_values_are_recorded() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        for v in [0.0, 0.25, 0.999, 1.0] {
            service.set_output(request(Some(v), None)).await.unwrap();
            assert_eq!(instance.handle().last_known_output(), Some(v));
        }
    }

    #[tokio::test]
    async fn out_of_range_value_fails_without_mutation() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        settle().await;
        let published = instance.coordinator().data();
        let before = instance.handle().snapshot();

        for v in [-0.1, 1.5, f64::NAN] {
            let err = service.set_output(request(Some(v), None)).await.unwrap_err();
            assert!(matches!(err, PidError::OutOfRange { min: 0.0, max: 1.0, .. }));
        }
        let err = service.set_output(request(Some(2.0), None)).await.unwrap_err();
        assert_eq!(err.to_string(), "Value 2 out of range 0-1");

        let after = instance.handle().snapshot();
        assert_eq!(after.last_known_output, None);
        assert_eq!(after.auto_mode, before.auto_mode);
        assert_eq!(after.held_output, before.held_output);
        assert_eq!(instance.coordinator().data(), published);
    }

    #[tokio::test]
    async fn unset_bounds_default_to_zero() {
        let store = fixture_store("25.0");
        store.remove_state(&entity(ParameterKey::OutputMax));
        let (_registry, service, _instance) = load_fixture(&store).await;

        let err = service.set_output(request(Some(0.5), None)).await.unwrap_err();
        assert_eq!(err, PidError::OutOfRange { value: 0.5, min: 0.0, max: 0.0 });
        assert!(service.set_output(request(Some(0.0), None)).await.is_ok());
    }

    #[tokio::test]
    async fn value_and_preset_must_be_exclusive() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;

        for (value, preset) in [(Some(0.5), Some("zero_start")), (None, None)] {
            let err = service.set_output(request(value, preset)).await.unwrap_err();
            assert_eq!(err, PidError::PresetOrValue);
        }
        assert_eq!(instance.handle().last_known_output(), None);
    }

    #[tokio::test]
    async fn invalid_preset_is_rejected() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;
        let err = service.set_output(request(None, Some("warm_start"))).await.unwrap_err();
        assert_eq!(err, PidError::InvalidPreset("warm_start".into()));
        assert_eq!(instance.handle().last_known_output(), None);
    }

    #[tokio::test]
    async fn unknown_and_unloaded_targets_are_rejected() {
        let store = fixture_store("25.0");
        let (registry, service, _instance) = load_fixture(&store).await;

        let mut req = request(Some(0.5), None);
        req.entity_id = Some(TargetSelector::Single("sensor.nothing_here".into()));
        assert_eq!(
            service.set_output(req).await.unwrap_err(),
            PidError::UnknownTarget("sensor.nothing_here".into())
        );

        registry.unload(INSTANCE);
        assert_eq!(
            service.set_output(request(Some(0.5), None)).await.unwrap_err(),
            PidError::NotLoaded(INSTANCE.into())
        );
    }

    #[tokio::test]
    async fn parameter_entities_address_their_instance() {
        let store = fixture_store("25.0");
        let (_registry, service, instance) = load_fixture(&store).await;

        let req = SetOutputRequest::with_value(entity(ParameterKey::Kp).as_str(), 0.3);
        let outcome = service.set_output(req).await.unwrap();
        assert_eq!(outcome.instance, INSTANCE);
        assert_eq!(instance.handle().last_known_output(), Some(0.3));
    }
}
