//! Persistent key-value storage used to cache snapshots and sticky assignments across sessions.
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// Snapshots of recently seen users, keyed by their v3 cache key.
pub const INTERNAL_STORE_KEY: &str = "STATSIG_LOCAL_STORAGE_INTERNAL_STORE_V4";
/// Device-scoped sticky assignments.
pub const STICKY_DEVICE_EXPERIMENTS_KEY: &str = "STATSIG_LOCAL_STORAGE_STICKY_DEVICE_EXPERIMENTS";
/// User-scoped sticky assignments.
pub const STICKY_USER_EXPERIMENTS_KEY: &str = "STATSIG_LOCAL_STORAGE_STICKY_USER_EXPERIMENTS";
/// Generated stable id of this device.
pub const STABLE_ID_KEY: &str = "STATSIG_STABLE_ID";

/// Storage medium for values that should survive the process.
///
/// Persistence is an optimization: callers treat every error as a cache miss and never surface it
/// to the host.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// Storage that lives as long as the process does.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), value);
        Ok(())
    }
}

/// Read and deserialize `key`. A missing value is `Ok(None)`; unreadable and corrupt values are
/// errors for the caller to report and treat as a cache miss.
pub(crate) async fn read_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| Error::Persistence(format!("corrupt value under {key}: {err}")))
}

/// Serialize and write `value` under `key`.
pub(crate) async fn write_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    storage.set(key, raw).await
}

/// Storage whose every operation fails.
#[cfg(test)]
pub(crate) struct FailingStorage;

#[cfg(test)]
#[async_trait]
impl Storage for FailingStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Persistence("disk on fire".to_owned()))
    }

    async fn set(&self, _key: &str, _value: String) -> Result<()> {
        Err(Error::Persistence("disk on fire".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn in_memory_storage_keeps_values() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_owned()));
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let storage = InMemoryStorage::new();
        let value = HashMap::from([("a".to_owned(), 1)]);
        write_json(&storage, "k", &value).await.unwrap();
        let read: Option<HashMap<String, i32>> = read_json(&storage, "k").await.unwrap();
        assert_eq!(read, Some(value));

        let missing: Option<HashMap<String, i32>> = read_json(&storage, "other").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn corrupt_entries_are_persistence_errors() {
        let storage = InMemoryStorage::new();
        storage.set("k", "{not json".to_owned()).await.unwrap();
        let read: Result<Option<HashMap<String, i32>>> = read_json(&storage, "k").await;
        assert!(matches!(read, Err(Error::Persistence(_))));
    }

    #[tokio::test]
    async fn storage_failures_are_surfaced() {
        let read: Result<Option<String>> = read_json(&FailingStorage, "k").await;
        assert!(matches!(read, Err(Error::Persistence(_))));
        assert!(matches!(
            write_json(&FailingStorage, "k", "value").await,
            Err(Error::Persistence(_))
        ));
    }
}
