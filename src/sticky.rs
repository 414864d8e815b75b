//! Persisted experiment assignments served when a query asks to keep the device value.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error_boundary::ErrorReporter,
    snapshot::{ConfigEntry, LayerEntry},
    storage::{
        read_json, write_json, Storage, STICKY_DEVICE_EXPERIMENTS_KEY, STICKY_USER_EXPERIMENTS_KEY,
    },
    timing::now_ms,
};

/// A copy of an entry as it was when the user was first allocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickyAssignment<T> {
    pub value: T,
    /// When the assignment was made (ms since epoch).
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StickyValues {
    #[serde(default)]
    pub experiments: HashMap<String, StickyAssignment<ConfigEntry>>,
    #[serde(default)]
    pub layers: HashMap<String, StickyAssignment<LayerEntry>>,
}

/// Entries that can be made sticky.
pub(crate) trait StickyEntry: Clone {
    fn is_device_based(&self) -> bool;
    fn is_user_in_experiment(&self) -> bool;
    fn is_experiment_active(&self) -> bool;
    fn bucket(values: &StickyValues) -> &HashMap<String, StickyAssignment<Self>>;
    fn bucket_mut(values: &mut StickyValues) -> &mut HashMap<String, StickyAssignment<Self>>;
}

impl StickyEntry for ConfigEntry {
    fn is_device_based(&self) -> bool {
        self.is_device_based
    }

    fn is_user_in_experiment(&self) -> bool {
        self.is_user_in_experiment
    }

    fn is_experiment_active(&self) -> bool {
        self.is_experiment_active
    }

    fn bucket(values: &StickyValues) -> &HashMap<String, StickyAssignment<Self>> {
        &values.experiments
    }

    fn bucket_mut(values: &mut StickyValues) -> &mut HashMap<String, StickyAssignment<Self>> {
        &mut values.experiments
    }
}

impl StickyEntry for LayerEntry {
    fn is_device_based(&self) -> bool {
        self.is_device_based
    }

    fn is_user_in_experiment(&self) -> bool {
        self.is_user_in_experiment
    }

    fn is_experiment_active(&self) -> bool {
        self.is_experiment_active
    }

    fn bucket(values: &StickyValues) -> &HashMap<String, StickyAssignment<Self>> {
        &values.layers
    }

    fn bucket_mut(values: &mut StickyValues) -> &mut HashMap<String, StickyAssignment<Self>> {
        &mut values.layers
    }
}

#[derive(Default)]
struct StickyState {
    /// User-scoped assignments keyed by the user's v3 cache key.
    users: HashMap<String, StickyValues>,
    device: StickyValues,
}

/// Sticky assignments of all users seen on this device.
///
/// Reads are synchronous. Writes update memory immediately and are persisted in the background on
/// the current tokio runtime; without a runtime the write only lives in memory.
pub(crate) struct StickyStore {
    inner: Arc<StickyInner>,
}

struct StickyInner {
    storage: Arc<dyn Storage>,
    error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    state: RwLock<StickyState>,
    /// Serializes storage writes. Each write copies the state only after taking the lock, so the
    /// last write always carries the latest assignments.
    persist_lock: tokio::sync::Mutex<()>,
}

impl StickyStore {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    ) -> StickyStore {
        StickyStore {
            inner: Arc::new(StickyInner {
                storage,
                error_reporter,
                state: RwLock::new(StickyState::default()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Load persisted assignments, replacing what is in memory.
    pub(crate) async fn load(&self) {
        let users: Option<HashMap<String, StickyValues>> =
            self.inner.read(STICKY_USER_EXPERIMENTS_KEY).await;
        let device: Option<StickyValues> = self.inner.read(STICKY_DEVICE_EXPERIMENTS_KEY).await;

        let mut state = self.inner.write_state();
        state.users = users.unwrap_or_default();
        state.device = device.unwrap_or_default();
    }

    /// User-scoped assignment first, then device-scoped.
    pub(crate) fn get<T: StickyEntry>(
        &self,
        user_key: &str,
        name: &str,
    ) -> Option<StickyAssignment<T>> {
        let state = self.inner.read_state();
        state
            .users
            .get(user_key)
            .and_then(|values| T::bucket(values).get(name))
            .or_else(|| T::bucket(&state.device).get(name))
            .cloned()
    }

    /// Remember `entry` if the user is allocated to an active experiment. Returns whether the entry
    /// was saved.
    pub(crate) fn save<T: StickyEntry>(&self, user_key: &str, name: &str, entry: &T) -> bool {
        if !entry.is_user_in_experiment() || !entry.is_experiment_active() {
            return false;
        }

        let assignment = StickyAssignment {
            value: entry.clone(),
            time: now_ms(),
        };
        {
            let mut state = self.inner.write_state();
            let values = if entry.is_device_based() {
                &mut state.device
            } else {
                state.users.entry(user_key.to_owned()).or_default()
            };
            T::bucket_mut(values).insert(name.to_owned(), assignment);
        }
        self.persist();
        true
    }

    /// Forget the assignment for `name` in both scopes.
    pub(crate) fn remove<T: StickyEntry>(&self, user_key: &str, name: &str) {
        let removed = {
            let mut state = self.inner.write_state();
            let from_user = state
                .users
                .get_mut(user_key)
                .and_then(|values| T::bucket_mut(values).remove(name))
                .is_some();
            let from_device = T::bucket_mut(&mut state.device).remove(name).is_some();
            from_user || from_device
        };
        if removed {
            self.persist();
        }
    }

    fn persist(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!(target: "statsig", "no async runtime, sticky assignments are kept in memory only");
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.persist().await });
    }
}

impl StickyInner {
    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match read_json(self.storage.as_ref(), key).await {
            Ok(value) => value,
            Err(err) => {
                self.error_reporter.report("load_sticky_values", &err);
                None
            }
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let (users, device) = {
            let state = self.read_state();
            (state.users.clone(), state.device.clone())
        };

        for result in [
            write_json(self.storage.as_ref(), STICKY_USER_EXPERIMENTS_KEY, &users).await,
            write_json(self.storage.as_ref(), STICKY_DEVICE_EXPERIMENTS_KEY, &device).await,
        ] {
            if let Err(err) = result {
                self.error_reporter.report("persist_sticky_values", &err);
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StickyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StickyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
