use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    eval::eval_details::EvaluationDetails, snapshot::SecondaryExposure, timing::now_ms,
    user::StatsigUser,
};

/// What was exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExposureKind {
    Gate {
        value: bool,
    },
    Config,
    Experiment,
    #[serde(rename_all = "camelCase")]
    Layer {
        parameter_name: String,
        /// Experiment the user was allocated to, if it sets this parameter.
        allocated_experiment: Option<String>,
        is_explicit: bool,
    },
}

/// An exposure of the current user to a gate, config, experiment or layer parameter.
///
/// Carries the full provenance of the value that was served so the event can be logged
/// faithfully.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEvent {
    pub user: StatsigUser,
    #[serde(flatten)]
    pub kind: ExposureKind,
    pub name: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub evaluation_details: EvaluationDetails,
    /// Logged explicitly by the host rather than as a side effect of a query.
    pub is_manual_exposure: bool,
    pub timestamp: DateTime<Utc>,
}

/// Receives exposure events. Transmitting them is up to the implementation.
pub trait ExposureLogger {
    fn log_exposure(&self, event: ExposureEvent);
}

pub(crate) struct NoopExposureLogger;
impl ExposureLogger for NoopExposureLogger {
    fn log_exposure(&self, _event: ExposureEvent) {}
}

impl<T: Fn(ExposureEvent)> ExposureLogger for T {
    fn log_exposure(&self, event: ExposureEvent) {
        self(event);
    }
}

/// Repeated identical exposures within this window are logged once.
const DEDUPE_WINDOW_MS: i64 = 10 * 60 * 1000;
/// Upper bound on remembered exposures before the memory is reset.
const MAX_DEDUPE_KEYS: usize = 1000;

/// Suppresses identical automatic exposures for the same user.
#[derive(Default)]
pub(crate) struct ExposureDeduper {
    logged: Mutex<HashMap<String, i64>>,
}

impl ExposureDeduper {
    /// Returns `true` if `event` has not been logged recently for `user_key` and records it.
    pub(crate) fn should_log(&self, user_key: &str, event: &ExposureEvent) -> bool {
        let key = dedupe_key(user_key, event);
        let now = now_ms();

        let mut logged = self.logged.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = logged.get(&key) {
            if now - last < DEDUPE_WINDOW_MS {
                return false;
            }
        }
        if logged.len() >= MAX_DEDUPE_KEYS {
            logged.clear();
        }
        logged.insert(key, now);
        true
    }

    pub(crate) fn reset(&self) {
        self.logged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn dedupe_key(user_key: &str, event: &ExposureEvent) -> String {
    let kind = match &event.kind {
        ExposureKind::Gate { value } => format!("gate:{value}"),
        ExposureKind::Config => "config".to_owned(),
        ExposureKind::Experiment => "experiment".to_owned(),
        ExposureKind::Layer {
            parameter_name,
            allocated_experiment,
            is_explicit,
        } => format!(
            "layer:{parameter_name}:{}:{is_explicit}",
            allocated_experiment.as_deref().unwrap_or_default()
        ),
    };
    format!(
        "{user_key}|{kind}|{}|{}|{:?}",
        event.name, event.rule_id, event.evaluation_details.reason
    )
}
