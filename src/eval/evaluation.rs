use serde::{Deserialize, Serialize};

use crate::snapshot::{ConfigEntry, GateEntry, JsonObject, LayerEntry, SecondaryExposure};

use super::eval_details::{EvaluationDetails, EvaluationReason};

/// Rule id reported for values served from a local override.
pub const OVERRIDE_RULE_ID: &str = "override";

/// Result of a query together with its full provenance.
///
/// `T` is the kind-specific payload: `bool` for gates, a JSON object for configs and experiments,
/// and [`LayerValue`] for layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation<T> {
    pub name: String,
    pub value: T,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub group_name: Option<String>,
    pub id_type: Option<String>,
    pub secondary_exposures: Vec<SecondaryExposure>,
    pub evaluation_details: EvaluationDetails,
}

/// Result of a gate query.
pub type FeatureGate = Evaluation<bool>;
/// Result of a config or experiment query.
pub type DynamicConfig = Evaluation<JsonObject>;
/// Result of a layer query.
pub type Layer = Evaluation<LayerValue>;

/// Payload of a layer evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerValue {
    pub value: JsonObject,
    /// Parameters set by the experiment the user was allocated to.
    pub explicit_parameters: Vec<String>,
    pub allocated_experiment_name: Option<String>,
    /// Exposures to log for parameters the allocated experiment does not set.
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
}

impl<T> Evaluation<T> {
    pub fn reason(&self) -> EvaluationReason {
        self.evaluation_details.reason
    }

    /// Default value for a name that could not be resolved.
    pub(crate) fn missing(name: &str, value: T, details: EvaluationDetails) -> Evaluation<T> {
        Evaluation {
            name: name.to_owned(),
            value,
            rule_id: String::new(),
            group_name: None,
            id_type: None,
            secondary_exposures: Vec::new(),
            evaluation_details: details,
        }
    }

    /// Value set by a local override.
    pub(crate) fn overridden(name: &str, value: T, time: i64) -> Evaluation<T> {
        Evaluation {
            name: name.to_owned(),
            value,
            rule_id: OVERRIDE_RULE_ID.to_owned(),
            group_name: None,
            id_type: None,
            secondary_exposures: Vec::new(),
            evaluation_details: EvaluationDetails {
                reason: EvaluationReason::LocalOverride,
                time,
            },
        }
    }
}

impl FeatureGate {
    pub(crate) fn from_entry(name: &str, entry: &GateEntry, details: EvaluationDetails) -> Self {
        Evaluation {
            name: name.to_owned(),
            value: entry.value,
            rule_id: entry.rule_id.clone(),
            group_name: entry.group_name.clone(),
            id_type: entry.id_type.clone(),
            secondary_exposures: entry.secondary_exposures.clone(),
            evaluation_details: details,
        }
    }
}

impl DynamicConfig {
    pub(crate) fn from_entry(name: &str, entry: &ConfigEntry, details: EvaluationDetails) -> Self {
        Evaluation {
            name: name.to_owned(),
            value: entry.value.clone(),
            rule_id: entry.rule_id.clone(),
            group_name: entry.group_name.clone(),
            id_type: entry.id_type.clone(),
            secondary_exposures: entry.secondary_exposures.clone(),
            evaluation_details: details,
        }
    }

    /// Look up a single parameter.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.value.get(key)
    }
}

impl Layer {
    pub(crate) fn from_entry(name: &str, entry: &LayerEntry, details: EvaluationDetails) -> Self {
        Evaluation {
            name: name.to_owned(),
            value: LayerValue {
                value: entry.value.clone(),
                explicit_parameters: entry.explicit_parameters.clone(),
                allocated_experiment_name: entry.allocated_experiment_name.clone(),
                undelegated_secondary_exposures: entry.undelegated_secondary_exposures.clone(),
            },
            rule_id: entry.rule_id.clone(),
            group_name: entry.group_name.clone(),
            id_type: entry.id_type.clone(),
            secondary_exposures: entry.secondary_exposures.clone(),
            evaluation_details: details,
        }
    }

    /// Look up a single parameter.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.value.value.get(key)
    }
}
