//! Versioned cache keys addressing per-user evaluation snapshots.
use std::{collections::BTreeMap, fmt::Write};

use serde::{Deserialize, Serialize};

use crate::{hashing::djb2, user::StatsigUser};

/// Cache key of a user's snapshot under every supported scheme.
///
/// `v3` is canonical and used for all writes. `v1` and `v2` are only used to find snapshots
/// persisted by older SDK versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UserCacheKey {
    pub v1: String,
    pub v2: String,
    pub v3: String,
}

impl UserCacheKey {
    /// Addresses to try when reading, newest scheme first.
    pub fn lookup_order(&self) -> [&str; 3] {
        [&self.v3, &self.v2, &self.v1]
    }
}

/// Derive the cache key for `user` on this device.
///
/// Pure function of its inputs: custom ids are sorted by type, so two users that differ only in
/// map iteration order produce the same key. An absent user hashes as the empty identity.
pub fn derive_key(stable_id: &str, user: Option<&StatsigUser>, sdk_key: &str) -> UserCacheKey {
    let legacy = format!("stableID:{stable_id};{}", canonical_identity(user));
    let full = format!("{legacy};sdkKey:{sdk_key}");

    UserCacheKey {
        v1: djb2(&legacy),
        v2: djb2(&full),
        v3: format!("{:x}", md5::compute(full.as_bytes())),
    }
}

fn canonical_identity(user: Option<&StatsigUser>) -> String {
    let user_id = user.and_then(|u| u.user_id.as_deref()).unwrap_or_default();
    let mut identity = format!("userID:{user_id}");

    if let Some(user) = user {
        let custom_ids: BTreeMap<&str, &str> = user
            .custom_ids
            .iter()
            .map(|(id_type, id)| (id_type.as_str(), id.as_str()))
            .collect();
        for (id_type, id) in custom_ids {
            // Writing into a String never fails.
            let _ = write!(identity, ";{id_type}:{id}");
        }
    }

    identity
}
