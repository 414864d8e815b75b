use std::sync::Arc;

use crate::{
    overrides::OverrideStore,
    snapshot::{JsonObject, LayerEntry, Snapshot},
    snapshot_store::SnapshotStore,
    sticky::{StickyAssignment, StickyEntry},
    timing::now_ms,
};

use super::{
    eval_details::{EvaluationDetails, EvaluationReason},
    evaluation::{DynamicConfig, Evaluation, FeatureGate, Layer, LayerValue},
};

pub struct EvaluatorConfig {
    pub snapshot_store: Arc<SnapshotStore>,
    pub override_store: Arc<OverrideStore>,
}

/// Evaluator resolves queries against overrides, sticky assignments and the active snapshot, in
/// that order.
///
/// Evaluation never waits: it answers from whatever snapshot is active at the time of the call.
pub struct Evaluator {
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Evaluator {
        Evaluator { config }
    }

    pub fn check_gate(&self, name: &str, ignore_overrides: bool) -> FeatureGate {
        if !ignore_overrides {
            if let Some(value) = self.config.override_store.gate(name) {
                return Evaluation::overridden(name, value, now_ms());
            }
        }

        let snapshot = self.config.snapshot_store.get_active();
        let result = match snapshot.gate(name) {
            Some(entry) => FeatureGate::from_entry(name, entry, snapshot.details()),
            None => Evaluation::missing(name, false, snapshot.missing_details()),
        };
        log_result(&result);
        result
    }

    pub fn get_config(&self, name: &str, ignore_overrides: bool) -> DynamicConfig {
        if !ignore_overrides {
            if let Some(value) = self.config.override_store.config(name) {
                return Evaluation::overridden(name, value, now_ms());
            }
        }

        let snapshot = self.config.snapshot_store.get_active();
        let result = config_from_snapshot(&snapshot, name);
        log_result(&result);
        result
    }

    /// Like [`Evaluator::get_config`], but with `keep_device_value` the user keeps the variant
    /// they were first allocated for as long as the experiment is active.
    pub fn get_experiment(
        &self,
        name: &str,
        keep_device_value: bool,
        ignore_overrides: bool,
    ) -> DynamicConfig {
        if !ignore_overrides {
            if let Some(value) = self.config.override_store.config(name) {
                return Evaluation::overridden(name, value, now_ms());
            }
        }

        let snapshot = self.config.snapshot_store.get_active();
        let latest = snapshot.config(name);
        let sticky = self.resolve_sticky(name, latest, keep_device_value, |_| {
            latest.map(|entry| entry.is_experiment_active)
        });

        let result = match sticky {
            Some(sticky) => DynamicConfig::from_entry(name, &sticky.value, sticky_details(&sticky)),
            None => config_from_snapshot(&snapshot, name),
        };
        log_result(&result);
        result
    }

    /// Layers are sticky through the experiment they allocated the user to: the stored layer
    /// value is kept while that experiment is still active.
    pub fn get_layer(&self, name: &str, keep_device_value: bool, ignore_overrides: bool) -> Layer {
        if !ignore_overrides {
            if let Some(value) = self.config.override_store.layer(name) {
                let value = LayerValue {
                    value,
                    ..LayerValue::default()
                };
                return Evaluation::overridden(name, value, now_ms());
            }
        }

        let snapshot = self.config.snapshot_store.get_active();
        let latest = snapshot.layer(name);
        let sticky = self.resolve_sticky(
            name,
            latest,
            keep_device_value,
            |sticky: &StickyAssignment<LayerEntry>| {
                // Allocated experiment names are stored as they appear in the payload (hashed).
                sticky
                    .value
                    .allocated_experiment_name
                    .as_ref()
                    .and_then(|experiment| snapshot.configs.get(experiment))
                    .map(|experiment| experiment.is_experiment_active)
            },
        );

        let result = match sticky {
            Some(sticky) => Layer::from_entry(name, &sticky.value, sticky_details(&sticky)),
            None => match latest {
                Some(entry) => Layer::from_entry(name, entry, snapshot.details()),
                None => Evaluation::missing(name, LayerValue::default(), snapshot.missing_details()),
            },
        };
        log_result(&result);
        result
    }

    /// Sticky bookkeeping for one query. Returns the stored assignment if it should be served
    /// instead of `latest`.
    ///
    /// - Without `keep_device_value` any stored assignment is dropped.
    /// - Without a stored assignment, `latest` is stored if the user is in an active experiment.
    /// - A stored assignment is served while `still_active` reports its experiment as active.
    ///   Otherwise it is replaced by `latest` (if that is in an active experiment) or dropped.
    fn resolve_sticky<T: StickyEntry>(
        &self,
        name: &str,
        latest: Option<&T>,
        keep_device_value: bool,
        still_active: impl FnOnce(&StickyAssignment<T>) -> Option<bool>,
    ) -> Option<StickyAssignment<T>> {
        let store = &self.config.snapshot_store;
        let sticky_store = store.sticky();
        let user_key = store.current_key().v3;

        if !keep_device_value {
            sticky_store.remove::<T>(&user_key, name);
            return None;
        }

        let Some(stored) = sticky_store.get::<T>(&user_key, name) else {
            if let Some(latest) = latest {
                sticky_store.save(&user_key, name, latest);
            }
            return None;
        };

        if still_active(&stored) == Some(true) {
            return Some(stored);
        }

        match latest {
            Some(latest) if latest.is_experiment_active() => {
                sticky_store.save(&user_key, name, latest);
            }
            _ => sticky_store.remove::<T>(&user_key, name),
        }
        None
    }
}

fn config_from_snapshot(snapshot: &Snapshot, name: &str) -> DynamicConfig {
    match snapshot.config(name) {
        Some(entry) => DynamicConfig::from_entry(name, entry, snapshot.details()),
        None => Evaluation::missing(name, JsonObject::new(), snapshot.missing_details()),
    }
}

fn sticky_details<T>(sticky: &StickyAssignment<T>) -> EvaluationDetails {
    EvaluationDetails {
        reason: EvaluationReason::Sticky,
        time: sticky.time,
    }
}

fn log_result<T>(result: &Evaluation<T>) {
    log::trace!(target: "statsig",
        name = result.name.as_str(),
        rule_id = result.rule_id.as_str(),
        reason:serde = result.evaluation_details.reason;
        "evaluated");
}
