//! The user an evaluation is computed for.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::snapshot::JsonObject;

/// Maximum length of a user id (and other single values) sent to the server.
pub(crate) const MAX_VALUE_SIZE: usize = 64;
/// Maximum serialized size of a user object.
pub(crate) const MAX_OBJ_SIZE: usize = 2048;

/// A user as seen by the SDK.
///
/// Only `user_id` and `custom_ids` form the user's *identity* (they participate in cache keys
/// and bootstrap validation). Everything else is forwarded to the server for evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsigUser {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "customIDs", default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_ids: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_attributes: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statsig_environment: Option<StatsigEnvironment>,
}

/// Environment tier stamped into every user (e.g., "staging").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsigEnvironment {
    pub tier: String,
}

impl StatsigUser {
    /// Create a user with the given user id.
    pub fn with_user_id(user_id: impl Into<String>) -> StatsigUser {
        StatsigUser {
            user_id: Some(user_id.into()),
            ..StatsigUser::default()
        }
    }

    /// Add a custom id (e.g., `"workID"`).
    pub fn with_custom_id(mut self, id_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.custom_ids.insert(id_type.into(), id.into());
        self
    }

    fn serialized_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// Copy a user into the shape the SDK works with: oversized fields trimmed and the configured
/// environment attached.
pub(crate) fn normalize_user(
    user: Option<StatsigUser>,
    environment: Option<&StatsigEnvironment>,
) -> StatsigUser {
    let mut user = trim_user(user.unwrap_or_default());
    if let Some(environment) = environment {
        user.statsig_environment = Some(environment.clone());
    }
    user
}

fn trim_user(mut user: StatsigUser) -> StatsigUser {
    if let Some(user_id) = &user.user_id {
        if user_id.chars().count() > MAX_VALUE_SIZE {
            log::info!(target: "statsig", "user id is too large, trimming to {} characters", MAX_VALUE_SIZE);
            user.user_id = Some(user_id.chars().take(MAX_VALUE_SIZE).collect());
        }
    }

    if user.serialized_len() > MAX_OBJ_SIZE {
        user.custom = None;
        if user.serialized_len() > MAX_OBJ_SIZE {
            log::info!(target: "statsig", "user object is too large, only keeping the user id");
            user = StatsigUser {
                user_id: user.user_id,
                ..StatsigUser::default()
            };
        } else {
            log::info!(target: "statsig", "user object is too large, dropping the custom property");
        }
    }

    user
}
