//! Keyed store of immutable evaluation snapshots with an "active user" pointer.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use crate::{
    bootstrap_validator,
    cache_key::UserCacheKey,
    error_boundary::ErrorReporter,
    eval::eval_details::{EvaluationDetails, EvaluationReason},
    hashing::HashAlgorithm,
    snapshot::{InitializeResponse, JsonObject, Snapshot},
    sticky::StickyStore,
    storage::{read_json, write_json, Storage, INTERNAL_STORE_KEY},
    timing::now_ms,
    user::StatsigUser,
    Error, Result,
};

/// Number of user snapshots kept in memory and in storage.
pub const MAX_CACHED_USERS: usize = 10;

struct StoreState {
    current_key: UserCacheKey,
    /// Snapshot answering queries right now. Always the snapshot for `current_key`, or an empty
    /// placeholder.
    active: Arc<Snapshot>,
    /// Fetched and cached snapshots by cache key. Bootstrapped snapshots are never stored here.
    snapshots: HashMap<String, Arc<Snapshot>>,
    /// Keys whose snapshot came from a prefetch and has not been fetched directly since.
    prefetched: HashSet<String>,
    /// Highest fetch sequence number applied per key.
    applied_seq: HashMap<String, u64>,
}

impl StoreState {
    /// Find a snapshot by any of the key's addresses, newest scheme first.
    fn find(&self, key: &UserCacheKey) -> Option<&Arc<Snapshot>> {
        key.lookup_order()
            .into_iter()
            .find_map(|address| self.snapshots.get(address))
    }

    /// Returns `false` if a fetch newer than `seq` was already applied for `key`.
    fn accept_seq(&mut self, key: &str, seq: u64) -> bool {
        let applied = self.applied_seq.entry(key.to_owned()).or_insert(0);
        if seq < *applied {
            return false;
        }
        *applied = seq;
        true
    }

    fn evict(&mut self) {
        while self.snapshots.len() > MAX_CACHED_USERS {
            let oldest = self
                .snapshots
                .iter()
                .filter(|(key, _)| **key != self.current_key.v3)
                .min_by_key(|(_, snapshot)| snapshot.received_at)
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else {
                break;
            };
            log::debug!(target: "statsig", key = oldest.as_str(); "evicting cached snapshot");
            self.snapshots.remove(&oldest);
            self.prefetched.remove(&oldest);
            self.applied_seq.remove(&oldest);
        }
    }
}

/// `SnapshotStore` holds evaluation snapshots for recently seen users and tracks which one is
/// active.
///
/// Every write replaces a whole `Arc<Snapshot>`. Readers clone the `Arc` and never observe a
/// partially applied update.
pub struct SnapshotStore {
    storage: Arc<dyn Storage>,
    error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    state: RwLock<StoreState>,
    sticky: StickyStore,
    fetch_seq: AtomicU64,
    /// Serializes storage writes so the last write always carries the latest state.
    persist_lock: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    /// Storage failures are never returned to callers. They go to `error_reporter` and the store
    /// carries on from memory.
    pub fn new(
        storage: Arc<dyn Storage>,
        current_key: UserCacheKey,
        error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    ) -> SnapshotStore {
        SnapshotStore {
            sticky: StickyStore::new(Arc::clone(&storage), Arc::clone(&error_reporter)),
            storage,
            error_reporter,
            state: RwLock::new(StoreState {
                current_key,
                active: Arc::new(Snapshot::uninitialized()),
                snapshots: HashMap::new(),
                prefetched: HashSet::new(),
                applied_seq: HashMap::new(),
            }),
            fetch_seq: AtomicU64::new(0),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn sticky(&self) -> &StickyStore {
        &self.sticky
    }

    /// Install caller-supplied initialize values for the current user.
    ///
    /// The values are classified against `user` and served with the resulting reason. Values that
    /// cannot be parsed install an empty snapshot with [`EvaluationReason::InvalidBootstrap`].
    /// Bootstrapped values are not persisted.
    pub fn bootstrap(
        &self,
        values: &serde_json::Value,
        user: &StatsigUser,
        stable_id: Option<&str>,
    ) -> EvaluationReason {
        let reason = bootstrap_validator::classify(user, values, stable_id);
        let snapshot = match InitializeResponse::from_value(values) {
            Ok(response) => Snapshot::from_response(response, reason, now_ms()),
            Err(err) => {
                log::warn!(target: "statsig", "ignoring malformed initialize values: {err}");
                Snapshot {
                    received_at: now_ms(),
                    ..Snapshot::uninitialized().with_reason(EvaluationReason::InvalidBootstrap)
                }
            }
        };
        let reason = snapshot.reason;
        let snapshot = Arc::new(snapshot);

        let mut state = self.write_state();
        state.active = snapshot;
        log::debug!(target: "statsig", reason:serde = reason; "bootstrapped initialize values");
        reason
    }

    /// Read the persisted snapshot for `key`, trying the canonical address first and then the
    /// legacy ones.
    pub async fn load_from_persistence(&self, key: &UserCacheKey) -> Option<Snapshot> {
        let mut persisted = self.read_persisted().await?;
        key.lookup_order()
            .into_iter()
            .find_map(|address| persisted.remove(address))
            .map(|snapshot| snapshot.with_reason(EvaluationReason::Cache))
    }

    /// Load persisted snapshots and sticky assignments into memory.
    ///
    /// If storage has values for the current user and nothing better is active, they become active
    /// with reason [`EvaluationReason::Cache`]. Returns whether the current user had cached values.
    pub async fn load_async(&self) -> bool {
        self.sticky.load().await;

        let Some(persisted) = self.read_persisted().await else {
            return false;
        };

        let mut state = self.write_state();
        for (key, snapshot) in persisted {
            // Anything already in memory was received in this session.
            state
                .snapshots
                .entry(key)
                .or_insert_with(|| Arc::new(snapshot.with_reason(EvaluationReason::Cache)));
        }

        let current_key = state.current_key.clone();
        let Some(found) = state.find(&current_key).cloned() else {
            return false;
        };
        // Values written under a legacy key move to the canonical one.
        for legacy in [&current_key.v2, &current_key.v1] {
            state.snapshots.remove(legacy);
        }
        state
            .snapshots
            .insert(current_key.v3.clone(), Arc::clone(&found));
        state.evict();

        if !state.active.is_loaded() {
            state.active = found;
        }
        true
    }

    /// Store a full initialize response for `key` (and for every prefetched user it carries) with
    /// reason [`EvaluationReason::Network`].
    ///
    /// The active pointer only moves if `key` is still the current user. Fails with
    /// [`Error::ResponseFormat`] for payloads that are not initialize responses.
    pub async fn save(&self, key: &UserCacheKey, payload: &serde_json::Value) -> Result<()> {
        let seq = self.begin_fetch();
        self.save_at(key, payload, seq).await
    }

    pub(crate) async fn save_at(
        &self,
        key: &UserCacheKey,
        payload: &serde_json::Value,
        seq: u64,
    ) -> Result<()> {
        let mut response = InitializeResponse::from_value(payload)?;
        let received_at = now_ms();

        let prefetched: Vec<(String, Arc<Snapshot>)> =
            std::mem::take(&mut response.prefetched_user_values)
                .into_iter()
                .map(|(prefetch_key, values)| {
                    let snapshot =
                        Snapshot::from_response(values, EvaluationReason::Network, received_at);
                    (prefetch_key, Arc::new(snapshot))
                })
                .collect();
        let snapshot = Arc::new(Snapshot::from_response(
            response,
            EvaluationReason::Network,
            received_at,
        ));

        {
            let mut state = self.write_state();
            if !state.accept_seq(&key.v3, seq) {
                log::debug!(target: "statsig", seq = seq; "discarding stale response");
                return Ok(());
            }

            for (prefetch_key, prefetched_snapshot) in prefetched {
                if prefetch_key == state.current_key.v3 {
                    // The current user is fetched directly, which is better.
                    continue;
                }
                if !state.accept_seq(&prefetch_key, seq) {
                    log::debug!(
                        target: "statsig",
                        key = prefetch_key.as_str(), seq = seq;
                        "discarding stale prefetched values"
                    );
                    continue;
                }
                state.prefetched.insert(prefetch_key.clone());
                state.snapshots.insert(prefetch_key, prefetched_snapshot);
            }

            state.prefetched.remove(&key.v3);
            state.snapshots.insert(key.v3.clone(), Arc::clone(&snapshot));
            if state.current_key.v3 == key.v3 {
                state.active = snapshot;
            }
            state.evict();
        }

        self.persist().await;
        Ok(())
    }

    /// Merge a delta response into the stored snapshot for `key`.
    ///
    /// Fails with [`Error::Merge`] (leaving the stored snapshot untouched) if there is no stored
    /// snapshot or it was computed with a different hash algorithm.
    pub async fn save_delta(&self, key: &UserCacheKey, payload: &serde_json::Value) -> Result<()> {
        let seq = self.begin_fetch();
        self.save_delta_at(key, payload, seq).await
    }

    pub(crate) async fn save_delta_at(
        &self,
        key: &UserCacheKey,
        payload: &serde_json::Value,
        seq: u64,
    ) -> Result<()> {
        let delta = InitializeResponse::from_value(payload)?;

        let base = self
            .read_state()
            .find(key)
            .cloned()
            .ok_or_else(|| Error::Merge("no stored snapshot to apply the delta to".to_owned()))?;

        // Build the merged value before taking the write lock.
        let merged = Arc::new(base.merge_delta(&delta, now_ms())?);

        {
            let mut state = self.write_state();
            let still_base = state
                .find(key)
                .is_some_and(|current| Arc::ptr_eq(current, &base));
            if !still_base {
                return Err(Error::Merge(
                    "stored snapshot changed while merging".to_owned(),
                ));
            }
            if !state.accept_seq(&key.v3, seq) {
                log::debug!(target: "statsig", seq = seq; "discarding stale delta");
                return Ok(());
            }

            for legacy in [&key.v2, &key.v1] {
                state.snapshots.remove(legacy);
            }
            state.prefetched.remove(&key.v3);
            state.snapshots.insert(key.v3.clone(), Arc::clone(&merged));
            if state.current_key.v3 == key.v3 {
                state.active = merged;
            }
        }

        self.persist().await;
        Ok(())
    }

    /// Snapshot answering queries for the current user.
    pub fn get_active(&self) -> Arc<Snapshot> {
        Arc::clone(&self.read_state().active)
    }

    /// Stored snapshot for `key`, or an empty [`EvaluationReason::Uninitialized`] one.
    pub fn get(&self, key: &UserCacheKey) -> Arc<Snapshot> {
        let state = self.read_state();
        if state.current_key == *key {
            return Arc::clone(&state.active);
        }
        state
            .find(key)
            .cloned()
            .unwrap_or_else(|| Arc::new(Snapshot::uninitialized()))
    }

    /// Re-publish the active snapshot with a different reason and the same values.
    pub fn set_evaluation_reason(&self, reason: EvaluationReason) {
        let mut guard = self.write_state();
        let state = &mut *guard;
        let updated = Arc::new(state.active.with_reason(reason));
        let current = state.current_key.v3.clone();
        if let Some(stored) = state.snapshots.get_mut(&current) {
            if Arc::ptr_eq(stored, &state.active) {
                *stored = Arc::clone(&updated);
            }
        }
        state.active = updated;
    }

    /// Stamp [`EvaluationReason::NetworkNotModified`] on the snapshot for `key`, unless a newer
    /// fetch was applied already or `key` is no longer current.
    pub(crate) fn mark_not_modified(&self, key: &UserCacheKey, seq: u64) {
        {
            let mut state = self.write_state();
            if state.current_key.v3 != key.v3 || !state.active.is_loaded() {
                return;
            }
            if !state.accept_seq(&key.v3, seq) {
                return;
            }
        }
        self.set_evaluation_reason(EvaluationReason::NetworkNotModified);
    }

    /// Make `key` the current user. Returns when the snapshot now active was received, or `None`
    /// if there are no values for this user yet.
    pub fn switch_user(&self, key: UserCacheKey, is_prefetched: bool) -> Option<i64> {
        let reason = if is_prefetched {
            EvaluationReason::Prefetch
        } else {
            EvaluationReason::Cache
        };

        let mut state = self.write_state();
        let found = state.find(&key).cloned();
        state.current_key = key;
        match found {
            Some(snapshot) => {
                let received_at = snapshot.received_at;
                state.active = Arc::new(snapshot.with_reason(reason));
                Some(received_at)
            }
            None => {
                state.active = Arc::new(Snapshot::uninitialized());
                None
            }
        }
    }

    /// Whether the stored values for `key` came from a prefetch.
    pub fn is_prefetched(&self, key: &UserCacheKey) -> bool {
        self.read_state().prefetched.contains(&key.v3)
    }

    /// Server time of the stored values for `key`, used as `sinceTime` for delta requests.
    pub fn last_update_time(&self, key: &UserCacheKey) -> Option<i64> {
        self.read_state()
            .find(key)
            .map(|snapshot| snapshot.time)
            .filter(|time| *time > 0)
    }

    pub fn previous_hash_used(&self, key: &UserCacheKey) -> Option<HashAlgorithm> {
        self.read_state().find(key).map(|snapshot| snapshot.hash_used)
    }

    pub fn previous_derived_fields(&self, key: &UserCacheKey) -> Option<JsonObject> {
        self.read_state()
            .find(key)
            .and_then(|snapshot| snapshot.derived_fields.clone())
    }

    /// The active snapshot as initialize response JSON, suitable for bootstrapping another client.
    pub fn export_json(&self) -> Result<String> {
        let active = self.get_active();
        Ok(serde_json::to_string(&active.to_initialize_response())?)
    }

    pub fn is_loaded(&self) -> bool {
        self.read_state().active.is_loaded()
    }

    pub fn current_key(&self) -> UserCacheKey {
        self.read_state().current_key.clone()
    }

    /// Provenance of the active snapshot as a whole.
    pub fn global_evaluation_details(&self) -> EvaluationDetails {
        let active = self.get_active();
        EvaluationDetails {
            reason: active.reason,
            time: active.received_at,
        }
    }

    /// Allocate the sequence number for a new fetch. Later fetches always get larger numbers.
    pub(crate) fn begin_fetch(&self) -> u64 {
        self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn read_persisted(&self) -> Option<HashMap<String, Snapshot>> {
        match read_json(self.storage.as_ref(), INTERNAL_STORE_KEY).await {
            Ok(persisted) => persisted,
            Err(err) => {
                self.error_reporter.report("load_values", &err);
                None
            }
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshots = self.read_state().snapshots.clone();
        if let Err(err) = write_json(self.storage.as_ref(), INTERNAL_STORE_KEY, &snapshots).await {
            self.error_reporter.report("persist_values", &err);
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        // A writer never leaves the state half-updated, so a poisoned lock is still usable.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
