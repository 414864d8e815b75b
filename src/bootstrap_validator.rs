//! Trust classification of caller-supplied initialize values.
//!
//! A bootstrap payload may declare the identity the server evaluated it for (`evaluated_keys`).
//! Comparing that identity with the current user yields one of three outcomes: the payload is
//! trusted, it belongs to somebody else, or it only differs in the (rotating) stable id.
use std::collections::HashMap;

use serde_json::Value;

use crate::{eval::eval_details::EvaluationReason, user::StatsigUser};

const STABLE_ID_KEY: &str = "stableID";

/// Classify `values` for `user`.
///
/// Always returns one of [`EvaluationReason::Bootstrap`], [`EvaluationReason::InvalidBootstrap`]
/// or [`EvaluationReason::BootstrapStableIdMismatch`]. Any difference in `userID` or in a custom
/// id other than `stableID` makes the payload invalid, regardless of how many components differ.
/// A payload without `evaluated_keys` is trusted as is.
pub fn classify(user: &StatsigUser, values: &Value, stable_id: Option<&str>) -> EvaluationReason {
    let evaluated_keys = match values.get("evaluated_keys") {
        Some(Value::Object(keys)) => keys,
        _ => return EvaluationReason::Bootstrap,
    };

    let Some(server) = ServerIdentity::parse(evaluated_keys) else {
        log::debug!(target: "statsig", "malformed evaluated_keys in bootstrap values");
        return EvaluationReason::InvalidBootstrap;
    };

    let user_id = user.user_id.as_deref().filter(|id| !id.is_empty());
    if user_id != server.user_id {
        return EvaluationReason::InvalidBootstrap;
    }

    let user_custom_ids: HashMap<&str, &str> = user
        .custom_ids
        .iter()
        .filter(|(id_type, _)| id_type.as_str() != STABLE_ID_KEY)
        .map(|(id_type, id)| (id_type.as_str(), id.as_str()))
        .collect();
    if user_custom_ids != server.custom_ids {
        return EvaluationReason::InvalidBootstrap;
    }

    let client_stable_id =
        stable_id.or_else(|| user.custom_ids.get(STABLE_ID_KEY).map(String::as_str));
    if client_stable_id != server.stable_id {
        return EvaluationReason::BootstrapStableIdMismatch;
    }

    EvaluationReason::Bootstrap
}

/// Identity declared by the server, borrowed from the payload.
struct ServerIdentity<'a> {
    user_id: Option<&'a str>,
    stable_id: Option<&'a str>,
    /// Custom ids without `stableID`.
    custom_ids: HashMap<&'a str, &'a str>,
}

impl<'a> ServerIdentity<'a> {
    /// Returns `None` if any present field has the wrong type.
    fn parse(keys: &'a serde_json::Map<String, Value>) -> Option<ServerIdentity<'a>> {
        let user_id = optional_str(keys.get("userID"))?.filter(|id| !id.is_empty());

        let mut custom_ids = HashMap::new();
        let mut stable_id = None;
        match keys.get("customIDs") {
            None | Some(Value::Null) => {}
            Some(Value::Object(ids)) => {
                for (id_type, id) in ids {
                    let id = id.as_str()?;
                    if id_type == STABLE_ID_KEY {
                        stable_id = Some(id);
                    } else {
                        custom_ids.insert(id_type.as_str(), id);
                    }
                }
            }
            Some(_) => return None,
        }

        let top_level_stable_id = optional_str(keys.get(STABLE_ID_KEY))?;

        Some(ServerIdentity {
            user_id,
            stable_id: stable_id.or(top_level_stable_id),
            custom_ids,
        })
    }
}

/// `Some(None)` for absent or null, `Some(Some(_))` for a string, `None` for any other type.
fn optional_str(value: Option<&Value>) -> Option<Option<&str>> {
    match value {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(s.as_str())),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user(user_id: Option<&str>, custom_ids: &[(&str, &str)]) -> StatsigUser {
        let mut user = StatsigUser::default();
        user.user_id = user_id.map(str::to_owned);
        for (id_type, id) in custom_ids {
            user = user.with_custom_id(*id_type, *id);
        }
        user
    }

    #[test]
    fn no_evaluated_keys_is_trusted() {
        assert_eq!(
            classify(&StatsigUser::default(), &json!({}), None),
            EvaluationReason::Bootstrap
        );
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[]),
                &json!({"evaluated_keys": null}),
                None
            ),
            EvaluationReason::Bootstrap
        );
    }

    #[test]
    fn matching_stable_id_is_trusted() {
        let values = json!({
            "evaluated_keys": {
                "stableID": "a-stable-id",
                "customIDs": {"stableID": "a-stable-id"}
            }
        });
        assert_eq!(
            classify(&StatsigUser::default(), &values, Some("a-stable-id")),
            EvaluationReason::Bootstrap
        );
    }

    #[test]
    fn matching_user_is_trusted() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "customIDs": {"stableID": "a-stable-id", "workID": "a-work-id"}
            }
        });
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                Some("a-stable-id")
            ),
            EvaluationReason::Bootstrap
        );
    }

    #[test]
    fn user_id_against_empty_evaluated_keys_is_invalid() {
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[]),
                &json!({"evaluated_keys": {}}),
                None
            ),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn custom_id_against_empty_evaluated_keys_is_invalid() {
        assert_eq!(
            classify(
                &user(None, &[("workID", "a-work-id")]),
                &json!({"evaluated_keys": {}}),
                None
            ),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn declared_custom_id_against_empty_user_is_invalid() {
        let values = json!({"evaluated_keys": {"customIDs": {"workID": "a-work-id"}}});
        assert_eq!(
            classify(&StatsigUser::default(), &values, None),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn declared_user_id_against_empty_user_is_invalid() {
        let values = json!({"evaluated_keys": {"userID": "a-user-id"}});
        assert_eq!(
            classify(&StatsigUser::default(), &values, None),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn different_user_id_is_invalid() {
        let values = json!({
            "evaluated_keys": {
                "userID": "an-invalid-user-id",
                "customIDs": {"stableID": "a-stable-id", "workID": "a-work-id"}
            }
        });
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                Some("a-stable-id")
            ),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn only_stable_id_differs() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "customIDs": {"workID": "a-work-id", "stableID": "an-invalid-stable-id"}
            }
        });
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                None
            ),
            EvaluationReason::BootstrapStableIdMismatch
        );
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                Some("a-stable-id")
            ),
            EvaluationReason::BootstrapStableIdMismatch
        );
    }

    #[test]
    fn stable_id_only_on_the_user_side() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "customIDs": {"workID": "a-work-id"}
            }
        });
        let user = user(
            Some("a-user-id"),
            &[("workID", "a-work-id"), ("stableID", "a-stable-id")],
        );
        assert_eq!(
            classify(&user, &values, Some("a-stable-id")),
            EvaluationReason::BootstrapStableIdMismatch
        );
    }

    #[test]
    fn user_stable_id_is_used_without_an_explicit_one() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "stableID": "a-stable-id"
            }
        });
        let user = user(Some("a-user-id"), &[("stableID", "a-stable-id")]);
        assert_eq!(classify(&user, &values, None), EvaluationReason::Bootstrap);
    }

    #[test]
    fn different_custom_id_is_invalid() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "customIDs": {"stableID": "a-stable-id", "workID": "an-invalid-work-id"}
            }
        });
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                None
            ),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn extra_custom_id_is_invalid() {
        let values = json!({
            "evaluated_keys": {
                "userID": "a-user-id",
                "customIDs": {"stableID": "a-stable-id", "workID": "a-work-id"}
            }
        });
        let user = user(
            Some("a-user-id"),
            &[("workID", "a-work-id"), ("groupID", "a-group-id")],
        );
        assert_eq!(
            classify(&user, &values, None),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn identity_mismatch_wins_over_stable_id_mismatch() {
        let values = json!({
            "evaluated_keys": {
                "userID": "someone-else",
                "customIDs": {"stableID": "another-stable-id", "workID": "another-work-id"}
            }
        });
        assert_eq!(
            classify(
                &user(Some("a-user-id"), &[("workID", "a-work-id")]),
                &values,
                Some("a-stable-id")
            ),
            EvaluationReason::InvalidBootstrap
        );
    }

    #[test]
    fn empty_user_id_counts_as_absent() {
        let values = json!({"evaluated_keys": {"userID": ""}});
        assert_eq!(
            classify(&user(Some(""), &[]), &values, None),
            EvaluationReason::Bootstrap
        );
        assert_eq!(
            classify(&StatsigUser::default(), &values, None),
            EvaluationReason::Bootstrap
        );
    }

    #[test]
    fn malformed_evaluated_keys_are_invalid() {
        for keys in [
            json!({"userID": 42}),
            json!({"customIDs": ["workID"]}),
            json!({"customIDs": {"workID": 1}}),
            json!({"stableID": true}),
        ] {
            assert_eq!(
                classify(
                    &StatsigUser::default(),
                    &json!({"evaluated_keys": keys}),
                    None
                ),
                EvaluationReason::InvalidBootstrap
            );
        }
    }
}
