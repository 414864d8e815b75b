//! Fetches fresh values from the network and applies them to the snapshot store.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};

use crate::{
    cache_key::{derive_key, UserCacheKey},
    error_boundary::ErrorReporter,
    hashing::HashAlgorithm,
    network::{FetchRequest, FetchResponse, Network},
    snapshot_store::SnapshotStore,
    timing::now_ms,
    user::StatsigUser,
    Error,
};

/// Maximum number of users fetched ahead of time in one request.
pub const MAX_PREFETCH_USERS: usize = 5;

/// When switching users, whether cached values are good enough to skip the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Always fetch (unless the user was prefetched).
    #[default]
    NetworkOnly,
    /// Skip the fetch if the cached values were received during this session.
    CacheOrNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching,
    Applied,
    Skipped,
    Failed,
}

/// How a fetch ended, as observed by the caller.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The response was applied to the store.
    Applied,
    /// No request was made because the cached values are good enough.
    Skipped,
    /// The request failed, its response was rejected, or waiting for it timed out. A timed-out
    /// fetch still applies its response once it arrives.
    Failed(Error),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, FetchOutcome::Failed(_))
    }

    fn state(&self) -> FetchState {
        match self {
            FetchOutcome::Applied => FetchState::Applied,
            FetchOutcome::Skipped => FetchState::Skipped,
            FetchOutcome::Failed(_) => FetchState::Failed,
        }
    }
}

/// Configuration for [`FetchOrchestrator`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct FetchOrchestratorConfig {
    pub sdk_key: String,
    /// Stable id at construction. See [`FetchOrchestrator::set_stable_id`].
    pub stable_id: String,
    pub fetch_mode: FetchMode,
    /// Ask the server for unhashed entry names.
    pub disable_hashing: bool,
    /// How long callers wait for a fetch. The fetch itself is not cancelled.
    ///
    /// Defaults to [`FetchOrchestratorConfig::DEFAULT_INIT_TIMEOUT`].
    pub init_timeout: Duration,
    /// Hard bound on the request itself, passed to the [`Network`]. `None` lets a late response
    /// arrive and be applied however long it takes.
    pub request_timeout: Option<Duration>,
}

impl FetchOrchestratorConfig {
    /// Default value for [`FetchOrchestratorConfig::init_timeout`].
    pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(sdk_key: impl Into<String>, stable_id: impl Into<String>) -> Self {
        FetchOrchestratorConfig {
            sdk_key: sdk_key.into(),
            stable_id: stable_id.into(),
            fetch_mode: FetchMode::default(),
            disable_hashing: false,
            init_timeout: FetchOrchestratorConfig::DEFAULT_INIT_TIMEOUT,
            request_timeout: None,
        }
    }

    pub fn with_fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    pub fn with_disable_hashing(mut self, disable_hashing: bool) -> Self {
        self.disable_hashing = disable_hashing;
        self
    }

    pub fn with_init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = init_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Hash algorithm requested from the server. Deltas are only requested on top of values
    /// hashed the same way.
    fn hash(&self) -> HashAlgorithm {
        if self.disable_hashing {
            HashAlgorithm::None
        } else {
            HashAlgorithm::Djb2
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct Inner {
    config: FetchOrchestratorConfig,
    stable_id: RwLock<String>,
    store: Arc<SnapshotStore>,
    network: Arc<dyn Network>,
    error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    /// Fetches that have not completed yet, by operation.
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
    state: Mutex<FetchState>,
    /// Values received after this time were fetched by this process.
    session_start: i64,
}

impl Inner {
    fn stable_id(&self) -> String {
        self.stable_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One fetch to run.
struct FetchJob {
    user: StatsigUser,
    key: UserCacheKey,
    prefetch_users: HashMap<String, StatsigUser>,
    seq: u64,
}

/// Decides when to fetch, de-duplicates concurrent fetches and applies their results.
///
/// Every fetch runs as a detached tokio task, so it must be used from within a tokio runtime.
/// Callers only ever wait on a shared handle to that task: giving up on waiting (timeouts, dropped
/// futures) does not cancel the fetch, and the result is applied exactly once.
#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<Inner>,
}

impl FetchOrchestrator {
    pub fn new(
        config: FetchOrchestratorConfig,
        store: Arc<SnapshotStore>,
        network: Arc<dyn Network>,
        error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    ) -> FetchOrchestrator {
        FetchOrchestrator {
            inner: Arc::new(Inner {
                stable_id: RwLock::new(config.stable_id.clone()),
                config,
                store,
                network,
                error_reporter,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                state: Mutex::new(FetchState::Idle),
                session_start: now_ms(),
            }),
        }
    }

    /// Use a different stable id for subsequent requests (e.g., one restored from storage).
    pub fn set_stable_id(&self, stable_id: impl Into<String>) {
        *self
            .inner
            .stable_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = stable_id.into();
    }

    /// State of the most recent fetch.
    pub fn state(&self) -> FetchState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch values for the current user (and `prefetch_users`), waiting at most `init_timeout`.
    pub async fn initialize(
        &self,
        user: &StatsigUser,
        key: &UserCacheKey,
        prefetch_users: &[StatsigUser],
    ) -> FetchOutcome {
        let prefetch_users = self.key_prefetch_users(prefetch_users);
        self.fetch(key.v3.clone(), user, key, prefetch_users).await
    }

    /// Make `user` the current user and fetch values for them unless the cached ones can be used.
    pub async fn update_user(&self, user: &StatsigUser, key: &UserCacheKey) -> FetchOutcome {
        let store = &self.inner.store;
        let is_prefetched = store.is_prefetched(key);
        let cached_time = store.switch_user(key.clone(), is_prefetched);

        if let Some(cached_time) = cached_time {
            let fresh = self.inner.config.fetch_mode == FetchMode::CacheOrNetwork
                && cached_time > self.inner.session_start;
            if is_prefetched || fresh {
                log::debug!(target: "statsig", is_prefetched = is_prefetched; "using cached values for new user");
                self.set_state(FetchState::Skipped);
                return FetchOutcome::Skipped;
            }
        }

        self.fetch(key.v3.clone(), user, key, HashMap::new()).await
    }

    /// Fetch values for up to [`MAX_PREFETCH_USERS`] other users so switching to them later does
    /// not need the network.
    pub async fn prefetch_users(
        &self,
        user: &StatsigUser,
        key: &UserCacheKey,
        users: &[StatsigUser],
    ) -> FetchOutcome {
        let prefetch_users = self.key_prefetch_users(users);
        if prefetch_users.is_empty() {
            return FetchOutcome::Skipped;
        }

        let mut keys: Vec<&str> = prefetch_users.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let operation = format!("prefetch:{}", keys.join(","));
        self.fetch(operation, user, key, prefetch_users).await
    }

    fn key_prefetch_users(&self, users: &[StatsigUser]) -> HashMap<String, StatsigUser> {
        if users.len() > MAX_PREFETCH_USERS {
            log::info!(target: "statsig", "cannot prefetch more than {} users", MAX_PREFETCH_USERS);
        }
        let stable_id = self.inner.stable_id();
        users
            .iter()
            .take(MAX_PREFETCH_USERS)
            .map(|user| {
                let key = derive_key(&stable_id, Some(user), &self.inner.config.sdk_key);
                (key.v3, user.clone())
            })
            .collect()
    }

    /// Join the in-flight fetch for `operation`, or start one. Waits at most `init_timeout`.
    async fn fetch(
        &self,
        operation: String,
        user: &StatsigUser,
        key: &UserCacheKey,
        prefetch_users: HashMap<String, StatsigUser>,
    ) -> FetchOutcome {
        let fetch = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&operation) {
                Some(existing) => {
                    log::debug!(target: "statsig", operation = operation.as_str(); "joining in-flight fetch");
                    existing.fetch.clone()
                }
                None => {
                    let job = FetchJob {
                        user: user.clone(),
                        key: key.clone(),
                        prefetch_users,
                        seq: self.inner.store.begin_fetch(),
                    };
                    // The lock is held until the fetch is registered, so the task cannot try to
                    // deregister itself first.
                    let (id, fetch) = self.spawn(operation.clone(), job);
                    in_flight.insert(
                        operation,
                        InFlight {
                            id,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        let timeout = self.inner.config.init_timeout;
        match tokio::time::timeout(timeout, fetch).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!(target: "statsig", "fetch did not complete in time, it will be applied when it does");
                FetchOutcome::Failed(Error::Timeout(timeout))
            }
        }
    }

    /// Run `job` on a detached task that deregisters itself from `in_flight` when done.
    fn spawn(&self, operation: String, job: FetchJob) -> (u64, SharedFetch) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.set_state(FetchState::Fetching);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = run_fetch(&inner, job).await;
            *inner.state.lock().unwrap_or_else(PoisonError::into_inner) = outcome.state();

            let mut in_flight = inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight
                .get(&operation)
                .is_some_and(|entry| entry.id == id)
            {
                in_flight.remove(&operation);
            }
            outcome
        });

        let fetch = async move {
            handle
                .await
                .unwrap_or_else(|_| FetchOutcome::Failed(Error::FetchTaskPanicked))
        }
        .boxed()
        .shared();

        (id, fetch)
    }

    fn set_state(&self, state: FetchState) {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Request values and apply them. A delta that cannot be merged is retried once as a full fetch.
async fn run_fetch(inner: &Inner, job: FetchJob) -> FetchOutcome {
    let store = &inner.store;
    let config = &inner.config;
    let mut allow_delta = true;

    loop {
        // Values for prefetched users are always fetched in full.
        let since_time = if job.prefetch_users.is_empty() && allow_delta {
            store.last_update_time(&job.key)
        } else {
            None
        };
        let use_delta =
            since_time.is_some() && store.previous_hash_used(&job.key) == Some(config.hash());

        let request = FetchRequest {
            user: job.user.clone(),
            stable_id: inner.stable_id(),
            since_time,
            use_delta,
            timeout: config.request_timeout,
            prefetch_users: job.prefetch_users.clone(),
            previous_derived_fields: store.previous_derived_fields(&job.key),
            hash: config.hash(),
        };

        let response = match inner.network.fetch_values(request).await {
            Ok(response) => response,
            Err(err) => {
                inner.error_reporter.report("fetch_values", &err);
                return FetchOutcome::Failed(err);
            }
        };

        match apply(inner, &job, response).await {
            Err(Error::Merge(reason)) if allow_delta => {
                log::info!(target: "statsig", "delta could not be applied, fetching full values: {reason}");
                allow_delta = false;
            }
            Err(err) => {
                inner.error_reporter.report("apply_values", &err);
                return FetchOutcome::Failed(err);
            }
            Ok(()) => return FetchOutcome::Applied,
        }
    }
}

async fn apply(inner: &Inner, job: &FetchJob, response: FetchResponse) -> crate::Result<()> {
    let store = &inner.store;
    if response.has_updates {
        if response.is_delta {
            store
                .save_delta_at(&job.key, &response.payload, job.seq)
                .await
        } else {
            store.save_at(&job.key, &response.payload, job.seq).await
        }
    } else {
        if response.is_no_content {
            store.mark_not_modified(&job.key, job.seq);
        }
        Ok(())
    }
}
