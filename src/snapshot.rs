//! Evaluation snapshots and the server wire format they are built from.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    eval::eval_details::{EvaluationDetails, EvaluationReason},
    hashing::HashAlgorithm,
    timing::now_ms,
    Error, Result,
};

/// JSON object used for config and layer values.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// An exposure of a gate that was evaluated as part of evaluating another entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryExposure {
    pub gate: String,
    #[serde(rename = "gateValue")]
    pub gate_value: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: bool,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: JsonObject,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub is_device_based: bool,
    #[serde(default)]
    pub is_user_in_experiment: bool,
    #[serde(default)]
    pub is_experiment_active: bool,
    #[serde(default)]
    pub is_in_layer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_parameters: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: JsonObject,
    #[serde(default)]
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<String>,
    #[serde(default)]
    pub secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub undelegated_secondary_exposures: Vec<SecondaryExposure>,
    #[serde(default)]
    pub explicit_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_experiment_name: Option<String>,
    #[serde(default)]
    pub is_device_based: bool,
    #[serde(default)]
    pub is_user_in_experiment: bool,
    #[serde(default)]
    pub is_experiment_active: bool,
}

/// The identity the server claims it evaluated a payload against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatedKeys {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "stableID", default, skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    #[serde(rename = "customIDs", default, skip_serializing_if = "Option::is_none")]
    pub custom_ids: Option<HashMap<String, String>>,
}

fn default_hash_used() -> HashAlgorithm {
    // Payloads predating `hash_used` were keyed with sha256.
    HashAlgorithm::Sha256
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Initialize response as returned by the server, accepted as bootstrap values, and produced by
/// [`Snapshot::to_initialize_response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    #[serde(default)]
    pub feature_gates: HashMap<String, GateEntry>,
    #[serde(default)]
    pub dynamic_configs: HashMap<String, ConfigEntry>,
    #[serde(default)]
    pub layer_configs: HashMap<String, LayerEntry>,
    #[serde(default)]
    pub has_updates: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_no_content: bool,
    #[serde(default)]
    pub time: i64,
    #[serde(default = "default_hash_used")]
    pub hash_used: HashAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_keys: Option<EvaluatedKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_fields: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_delta: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_configs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_layers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_sdk_key_used: Option<String>,
    /// Values for prefetched users, keyed by their v3 cache key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub prefetched_user_values: HashMap<String, InitializeResponse>,
}

impl InitializeResponse {
    /// Parse a raw payload. Non-object payloads and payloads of the wrong shape are
    /// [`Error::ResponseFormat`].
    pub fn from_value(value: &serde_json::Value) -> Result<InitializeResponse> {
        if !value.is_object() {
            return Err(Error::ResponseFormat(format!(
                "expected a JSON object, got {}",
                json_type_name(value)
            )));
        }
        serde_json::from_value(value.clone()).map_err(|err| Error::ResponseFormat(err.to_string()))
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Evaluation snapshot for one user.
///
/// Snapshots are immutable once published: every change (including delta merges and reason
/// stamps) builds a new `Snapshot` that replaces the old one as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Gates keyed by hashed name.
    pub gates: HashMap<String, GateEntry>,
    /// Dynamic configs and experiments keyed by hashed name.
    pub configs: HashMap<String, ConfigEntry>,
    /// Layers keyed by hashed name.
    pub layers: HashMap<String, LayerEntry>,
    /// Opaque server state to send back with the next delta request.
    pub derived_fields: Option<JsonObject>,
    pub hash_used: HashAlgorithm,
    /// When this client received the values (ms since epoch).
    pub received_at: i64,
    /// Server evaluation time, sent back as `sinceTime`.
    pub time: i64,
    pub reason: EvaluationReason,
    pub evaluated_keys: Option<EvaluatedKeys>,
}

impl Snapshot {
    /// The synthetic snapshot served before anything is loaded.
    pub fn uninitialized() -> Snapshot {
        Snapshot {
            gates: HashMap::new(),
            configs: HashMap::new(),
            layers: HashMap::new(),
            derived_fields: None,
            hash_used: HashAlgorithm::default(),
            received_at: 0,
            time: 0,
            reason: EvaluationReason::Uninitialized,
            evaluated_keys: None,
        }
    }

    pub(crate) fn from_response(
        response: InitializeResponse,
        reason: EvaluationReason,
        received_at: i64,
    ) -> Snapshot {
        Snapshot {
            gates: response.feature_gates,
            configs: response.dynamic_configs,
            layers: response.layer_configs,
            derived_fields: response.derived_fields,
            hash_used: response.hash_used,
            received_at,
            time: response.time,
            reason,
            evaluated_keys: response.evaluated_keys,
        }
    }

    /// Whether any values were loaded (from any source).
    pub fn is_loaded(&self) -> bool {
        !matches!(
            self.reason,
            EvaluationReason::Uninitialized | EvaluationReason::Error
        )
    }

    pub fn gate(&self, name: &str) -> Option<&GateEntry> {
        self.gates.get(&self.hash_used.hash_name(name))
    }

    pub fn config(&self, name: &str) -> Option<&ConfigEntry> {
        self.configs.get(&self.hash_used.hash_name(name))
    }

    pub fn layer(&self, name: &str) -> Option<&LayerEntry> {
        self.layers.get(&self.hash_used.hash_name(name))
    }

    /// Details for a value found in this snapshot.
    pub fn details(&self) -> EvaluationDetails {
        EvaluationDetails {
            reason: self.reason,
            time: self.received_at,
        }
    }

    /// Details for a name this snapshot has no entry for.
    pub fn missing_details(&self) -> EvaluationDetails {
        let reason = match self.reason {
            EvaluationReason::Uninitialized | EvaluationReason::Error => self.reason,
            _ => EvaluationReason::Unrecognized,
        };
        EvaluationDetails {
            reason,
            time: now_ms(),
        }
    }

    /// Same values, different provenance.
    pub(crate) fn with_reason(&self, reason: EvaluationReason) -> Snapshot {
        Snapshot {
            reason,
            ..self.clone()
        }
    }

    /// Build the snapshot that results from applying `delta` on top of this one.
    ///
    /// Entries present in the delta replace the stored entry with the same name, names listed in
    /// `deleted_*` are removed, and everything else is carried over untouched. The receiver is
    /// never modified. Fails with [`Error::Merge`] if the delta was computed with a different
    /// hash algorithm.
    pub(crate) fn merge_delta(
        &self,
        delta: &InitializeResponse,
        received_at: i64,
    ) -> Result<Snapshot> {
        if delta.hash_used != self.hash_used {
            return Err(Error::Merge(format!(
                "delta hashed with {} but stored snapshot uses {}",
                delta.hash_used.as_str(),
                self.hash_used.as_str()
            )));
        }

        let mut gates = self.gates.clone();
        let mut configs = self.configs.clone();
        let mut layers = self.layers.clone();

        for name in &delta.deleted_gates {
            gates.remove(name);
        }
        for name in &delta.deleted_configs {
            configs.remove(name);
        }
        for name in &delta.deleted_layers {
            layers.remove(name);
        }

        gates.extend(delta.feature_gates.clone());
        configs.extend(delta.dynamic_configs.clone());
        layers.extend(delta.layer_configs.clone());

        Ok(Snapshot {
            gates,
            configs,
            layers,
            derived_fields: delta
                .derived_fields
                .clone()
                .or_else(|| self.derived_fields.clone()),
            hash_used: self.hash_used,
            received_at,
            time: delta.time.max(self.time),
            reason: EvaluationReason::Network,
            evaluated_keys: delta
                .evaluated_keys
                .clone()
                .or_else(|| self.evaluated_keys.clone()),
        })
    }

    /// Serialize back into an initialize response that can bootstrap another client.
    pub fn to_initialize_response(&self) -> InitializeResponse {
        InitializeResponse {
            feature_gates: self.gates.clone(),
            dynamic_configs: self.configs.clone(),
            layer_configs: self.layers.clone(),
            has_updates: true,
            is_no_content: false,
            time: self.time,
            hash_used: self.hash_used,
            evaluated_keys: self.evaluated_keys.clone(),
            derived_fields: self.derived_fields.clone(),
            is_delta: false,
            deleted_gates: Vec::new(),
            deleted_configs: Vec::new(),
            deleted_layers: Vec::new(),
            hashed_sdk_key_used: None,
            prefetched_user_values: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn base_response() -> InitializeResponse {
        InitializeResponse::from_value(&json!({
            "feature_gates": {
                "gate_a": {"name": "gate_a", "value": true, "rule_id": "r1"},
                "gate_b": {"name": "gate_b", "value": false, "rule_id": "r2"}
            },
            "dynamic_configs": {
                "config_a": {"name": "config_a", "value": {"n": 1}, "rule_id": "c1"}
            },
            "layer_configs": {},
            "has_updates": true,
            "time": 100,
            "hash_used": "none"
        }))
        .unwrap()
    }

    #[test]
    fn rejects_non_object_payloads() {
        for payload in [json!(null), json!([1, 2]), json!("values"), json!(12)] {
            assert!(matches!(
                InitializeResponse::from_value(&payload),
                Err(Error::ResponseFormat(_))
            ));
        }
    }

    #[test]
    fn rejects_wrong_shape() {
        let payload = json!({"feature_gates": ["not", "a", "map"]});
        assert!(matches!(
            InitializeResponse::from_value(&payload),
            Err(Error::ResponseFormat(_))
        ));
    }

    #[test]
    fn missing_hash_used_defaults_to_sha256() {
        let response = InitializeResponse::from_value(&json!({"has_updates": true})).unwrap();
        assert_eq!(response.hash_used, HashAlgorithm::Sha256);
    }

    #[test]
    fn looks_up_by_hashed_name() {
        let response = InitializeResponse::from_value(&json!({
            "feature_gates": {
                "97": {"name": "97", "value": true, "rule_id": "r"}
            },
            "hash_used": "djb2"
        }))
        .unwrap();
        let snapshot = Snapshot::from_response(response, EvaluationReason::Network, 1);

        assert!(snapshot.gate("a").unwrap().value);
        assert!(snapshot.gate("97").is_none());
    }

    #[test]
    fn missing_details_depend_on_loaded_state() {
        assert_eq!(
            Snapshot::uninitialized().missing_details().reason,
            EvaluationReason::Uninitialized
        );
        let loaded = Snapshot::from_response(base_response(), EvaluationReason::Cache, 1);
        assert_eq!(
            loaded.missing_details().reason,
            EvaluationReason::Unrecognized
        );
        let failed = Snapshot::uninitialized().with_reason(EvaluationReason::Error);
        assert!(!failed.is_loaded());
        assert_eq!(failed.missing_details().reason, EvaluationReason::Error);
    }

    #[test]
    fn delta_replaces_and_deletes_by_name() {
        let snapshot = Snapshot::from_response(base_response(), EvaluationReason::Cache, 1);
        let delta = InitializeResponse::from_value(&json!({
            "feature_gates": {
                "gate_b": {"name": "gate_b", "value": true, "rule_id": "r2-new"}
            },
            "deleted_configs": ["config_a"],
            "has_updates": true,
            "is_delta": true,
            "time": 200,
            "hash_used": "none"
        }))
        .unwrap();

        let merged = snapshot.merge_delta(&delta, 2).unwrap();

        assert_eq!(merged.gate("gate_a"), snapshot.gate("gate_a"));
        assert_eq!(merged.gate("gate_b").unwrap().rule_id, "r2-new");
        assert!(merged.config("config_a").is_none());
        assert_eq!(merged.time, 200);
        assert_eq!(merged.reason, EvaluationReason::Network);
        // The base is untouched.
        assert!(!snapshot.gate("gate_b").unwrap().value);
        assert!(snapshot.config("config_a").is_some());
    }

    #[test]
    fn delta_merge_is_idempotent() {
        let snapshot = Snapshot::from_response(base_response(), EvaluationReason::Network, 1);
        let delta = InitializeResponse::from_value(&json!({
            "feature_gates": {"gate_c": {"name": "gate_c", "value": true, "rule_id": "r3"}},
            "deleted_gates": ["gate_a"],
            "is_delta": true,
            "has_updates": true,
            "time": 300,
            "hash_used": "none"
        }))
        .unwrap();

        let once = snapshot.merge_delta(&delta, 5).unwrap();
        let twice = once.merge_delta(&delta, 5).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn delta_with_mismatched_hash_is_rejected() {
        let snapshot = Snapshot::from_response(base_response(), EvaluationReason::Network, 1);
        let delta = InitializeResponse::from_value(&json!({
            "feature_gates": {"97": {"name": "97", "value": true}},
            "is_delta": true,
            "has_updates": true,
            "hash_used": "djb2"
        }))
        .unwrap();

        assert!(matches!(
            snapshot.merge_delta(&delta, 2),
            Err(Error::Merge(_))
        ));
    }

    #[test]
    fn exported_response_round_trips() {
        let snapshot = Snapshot::from_response(base_response(), EvaluationReason::Network, 1);
        let exported = serde_json::to_value(snapshot.to_initialize_response()).unwrap();
        let parsed = InitializeResponse::from_value(&exported).unwrap();
        let restored = Snapshot::from_response(parsed, EvaluationReason::Network, 1);
        assert_eq!(restored, snapshot);
    }
}
