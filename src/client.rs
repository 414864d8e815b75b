use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    cache_key::{derive_key, UserCacheKey},
    config::CompletionCallback,
    error_boundary::ErrorReporter,
    eval::{
        eval_details::{EvaluationDetails, EvaluationReason},
        DynamicConfig, Evaluation, Evaluator, EvaluatorConfig,
        FeatureGate, Layer,
    },
    exposure_logger::{ExposureDeduper, ExposureEvent, ExposureKind, ExposureLogger},
    fetch_orchestrator::{FetchOrchestrator, FetchOrchestratorConfig, FetchOutcome},
    network::{HttpNetwork, HttpNetworkConfig},
    overrides::{OverrideStore, Overrides},
    snapshot::{JsonObject, SecondaryExposure},
    snapshot_store::SnapshotStore,
    storage::{Storage, STABLE_ID_KEY},
    user::{normalize_user, StatsigEnvironment, StatsigUser},
    ClientConfig, Error, Result,
};

const SDK_KEY_PREFIX: &str = "client-";

/// Per-query options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Answer from fetched values even if a local override exists.
    pub ignore_overrides: bool,
    /// Keep serving the experiment variant (or layer allocation) the user got first, for as long
    /// as the experiment is active.
    pub keep_device_value: bool,
    /// Do not log an exposure for this query.
    pub disable_exposure_logging: bool,
}

impl QueryOptions {
    pub fn ignore_overrides(mut self) -> Self {
        self.ignore_overrides = true;
        self
    }

    pub fn keep_device_value(mut self) -> Self {
        self.keep_device_value = true;
        self
    }

    pub fn disable_exposure_logging(mut self) -> Self {
        self.disable_exposure_logging = true;
        self
    }
}

/// How `initialize()` went.
#[derive(Debug, Clone)]
pub struct InitializeDetails {
    pub duration: Duration,
    /// Fresh values were received (or none were needed).
    pub success: bool,
    pub error: Option<Error>,
}

/// Values for bootstrapping another client, as returned by
/// [`Client::get_initialize_response_json`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponseJson {
    /// Serialized initialize response.
    pub values: String,
    pub evaluation_details: EvaluationDetails,
}

/// A client answering feature gate, dynamic config, experiment and layer queries for the current
/// user from locally held values.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Initialization
///
/// Queries never wait for the network. Call [`Client::initialize()`] once (from within a tokio
/// runtime) to load cached values and fetch fresh ones; until values arrive, queries return
/// defaults with [`EvaluationReason::Uninitialized`].
///
/// # Examples
/// ```no_run
/// # async fn test() {
/// # use statsig_core::{ClientConfig, StatsigUser};
/// let client = ClientConfig::from_sdk_key("client-sdk-key")
///     .to_client(Some(StatsigUser::with_user_id("a-user")))
///     .unwrap();
/// client.initialize().await;
/// let enabled = client.check_gate("a_gate").unwrap_or(false);
/// # }
/// ```
pub struct Client {
    sdk_key: String,
    local_mode: bool,
    environment: Option<StatsigEnvironment>,
    prefetch_users: Vec<StatsigUser>,
    stable_id_overridden: bool,
    stable_id: RwLock<String>,
    user: RwLock<StatsigUser>,
    storage: Arc<dyn Storage>,
    store: Arc<SnapshotStore>,
    overrides: Arc<OverrideStore>,
    evaluator: Evaluator,
    orchestrator: FetchOrchestrator,
    exposure_logger: Box<dyn ExposureLogger + Send + Sync>,
    error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    deduper: ExposureDeduper,
    init_completion_callback: Option<CompletionCallback>,
    update_user_completion_callback: Option<CompletionCallback>,
    initialize_called: AtomicBool,
    ready: AtomicBool,
    created_at: Instant,
}

impl Client {
    /// Create a new `Client` for `user` using the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the SDK key is not a client SDK key (unless local mode
    /// is enabled).
    pub fn new(config: ClientConfig, user: Option<StatsigUser>) -> Result<Client> {
        if !config.local_mode && !config.sdk_key.starts_with(SDK_KEY_PREFIX) {
            return Err(Error::InvalidArgument(
                "invalid key provided, you must use a client SDK key".to_owned(),
            ));
        }

        let stable_id_overridden = config.override_stable_id.is_some();
        let stable_id = config
            .override_stable_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let user = normalize_user(user, config.environment.as_ref());
        let key = derive_key(&stable_id, Some(&user), &config.sdk_key);

        let store = Arc::new(SnapshotStore::new(
            Arc::clone(&config.storage),
            key,
            Arc::clone(&config.error_reporter),
        ));
        let overrides = Arc::new(OverrideStore::new());
        let evaluator = Evaluator::new(EvaluatorConfig {
            snapshot_store: Arc::clone(&store),
            override_store: Arc::clone(&overrides),
        });

        let network = config.network.unwrap_or_else(|| {
            Arc::new(HttpNetwork::new(HttpNetworkConfig {
                api: config.api.clone(),
                sdk_key: config.sdk_key.clone(),
            }))
        });
        let orchestrator = FetchOrchestrator::new(
            FetchOrchestratorConfig::new(config.sdk_key.clone(), stable_id.clone())
                .with_fetch_mode(config.fetch_mode)
                .with_disable_hashing(config.disable_hashing)
                .with_init_timeout(config.init_timeout)
                .with_request_timeout(config.request_timeout),
            Arc::clone(&store),
            network,
            Arc::clone(&config.error_reporter),
        );

        let client = Client {
            sdk_key: config.sdk_key,
            local_mode: config.local_mode,
            environment: config.environment,
            prefetch_users: config.prefetch_users,
            stable_id_overridden,
            stable_id: RwLock::new(stable_id),
            user: RwLock::new(user),
            storage: config.storage,
            store,
            overrides,
            evaluator,
            orchestrator,
            exposure_logger: config.exposure_logger,
            error_reporter: config.error_reporter,
            deduper: ExposureDeduper::default(),
            init_completion_callback: config.init_completion_callback,
            update_user_completion_callback: config.update_user_completion_callback,
            initialize_called: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            created_at: Instant::now(),
        };

        if let Some(values) = &config.initialize_values {
            client.set_initialize_values(values);
        }

        Ok(client)
    }

    /// Load cached values and fetch fresh ones for the current user, waiting at most the
    /// configured init timeout.
    ///
    /// Does nothing if the client was already initialized or given initialize values. A fetch
    /// that times out keeps running and its values are applied when they arrive.
    pub async fn initialize(&self) -> InitializeDetails {
        if self.ready.load(Ordering::Acquire) {
            return InitializeDetails {
                duration: Duration::ZERO,
                success: true,
                error: None,
            };
        }
        self.initialize_called.store(true, Ordering::Release);

        self.restore_stable_id().await;
        self.store.load_async().await;

        let error = if self.local_mode {
            None
        } else {
            let user = self.get_current_user();
            let key = self.get_current_user_cache_key();
            let prefetch_users: Vec<StatsigUser> = self
                .prefetch_users
                .iter()
                .map(|user| normalize_user(Some(user.clone()), self.environment.as_ref()))
                .collect();
            match self
                .orchestrator
                .initialize(&user, &key, &prefetch_users)
                .await
            {
                FetchOutcome::Failed(error) => {
                    if !matches!(error, Error::Timeout(_)) && !self.store.is_loaded() {
                        self.store.set_evaluation_reason(EvaluationReason::Error);
                    }
                    Some(error)
                }
                FetchOutcome::Applied | FetchOutcome::Skipped => None,
            }
        };

        self.ready.store(true, Ordering::Release);
        let details = InitializeDetails {
            duration: self.created_at.elapsed(),
            success: error.is_none(),
            error,
        };
        log::info!(target: "statsig",
            success = details.success,
            reason:serde = self.store.global_evaluation_details().reason;
            "initialized");
        fire_callback(
            self.init_completion_callback.as_ref(),
            details.duration,
            details.error.as_ref(),
        );
        details
    }

    /// Serve `values` for the current user. Marks the client initialized the first time.
    ///
    /// The values are checked against the current user: see [`EvaluationReason::InvalidBootstrap`]
    /// and [`EvaluationReason::BootstrapStableIdMismatch`].
    pub fn set_initialize_values(&self, values: &serde_json::Value) {
        let user = self.get_current_user();
        let stable_id = self.get_stable_id();
        self.store.bootstrap(values, &user, Some(&stable_id));

        self.initialize_called.store(true, Ordering::Release);
        if !self.ready.swap(true, Ordering::AcqRel) {
            fire_callback(
                self.init_completion_callback.as_ref(),
                self.created_at.elapsed(),
                None,
            );
        }
    }

    /// Switch to a different user and fetch values for them, unless cached values can be used.
    ///
    /// Queries answer for the new user immediately (from cache, or with defaults). Returns whether
    /// values were fetched or taken from cache successfully.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uninitialized`] if [`Client::initialize()`] was never called.
    pub async fn update_user(&self, user: Option<StatsigUser>) -> Result<bool> {
        self.ensure_initialize_called()?;
        let started = Instant::now();

        let (user, key) = self.set_current_user(user);
        let outcome = if self.local_mode {
            let is_prefetched = self.store.is_prefetched(&key);
            self.store.switch_user(key, is_prefetched);
            FetchOutcome::Skipped
        } else {
            self.orchestrator.update_user(&user, &key).await
        };

        let error = match &outcome {
            FetchOutcome::Failed(error) => Some(error),
            FetchOutcome::Applied | FetchOutcome::Skipped => None,
        };
        fire_callback(
            self.update_user_completion_callback.as_ref(),
            started.elapsed(),
            error,
        );
        Ok(outcome.is_success())
    }

    /// Switch to a different user and serve `values` for them without fetching.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uninitialized`] if [`Client::initialize()`] was never called.
    pub fn update_user_with_values(
        &self,
        user: Option<StatsigUser>,
        values: &serde_json::Value,
    ) -> Result<bool> {
        self.ensure_initialize_called()?;
        let started = Instant::now();

        let (user, key) = self.set_current_user(user);
        self.store.switch_user(key, false);
        self.store
            .bootstrap(values, &user, Some(&self.get_stable_id()));

        fire_callback(
            self.update_user_completion_callback.as_ref(),
            started.elapsed(),
            None,
        );
        Ok(true)
    }

    /// Fetch values for other users ahead of time so [`Client::update_user()`] to them does not
    /// need the network. At most five users are fetched per call.
    pub async fn prefetch_users(&self, users: Vec<StatsigUser>) -> bool {
        if users.is_empty() || self.local_mode {
            return true;
        }
        let users: Vec<StatsigUser> = users
            .into_iter()
            .map(|user| normalize_user(Some(user), self.environment.as_ref()))
            .collect();
        let user = self.get_current_user();
        let key = self.get_current_user_cache_key();
        self.orchestrator
            .prefetch_users(&user, &key, &users)
            .await
            .is_success()
    }

    /// Check the value of a gate for the current user. Gates are off by default.
    ///
    /// # Errors
    ///
    /// Returns an error in the following cases:
    /// - [`Error::Uninitialized`] if the client was never initialized.
    /// - [`Error::InvalidArgument`] if `gate_name` is empty.
    pub fn check_gate(&self, gate_name: &str) -> Result<bool> {
        Ok(self
            .get_feature_gate(gate_name, QueryOptions::default())?
            .value)
    }

    /// Evaluate a gate, with the rule and provenance of the value.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &statsig_core::Client) {
    /// # use statsig_core::QueryOptions;
    /// let gate = client
    ///     .get_feature_gate("a_gate", QueryOptions::default().disable_exposure_logging())
    ///     .unwrap();
    /// println!("{} ({:?})", gate.value, gate.reason());
    /// # }
    /// ```
    pub fn get_feature_gate(&self, gate_name: &str, options: QueryOptions) -> Result<FeatureGate> {
        self.ensure_ready(gate_name)?;
        let gate = self.evaluator.check_gate(gate_name, options.ignore_overrides);
        if !options.disable_exposure_logging {
            self.log_exposure(
                ExposureKind::Gate { value: gate.value },
                &gate,
                gate.secondary_exposures.clone(),
                false,
            );
        }
        Ok(gate)
    }

    /// Evaluate a dynamic config. Missing configs evaluate to an empty object.
    ///
    /// # Errors
    ///
    /// Same as [`Client::check_gate()`].
    pub fn get_config(&self, config_name: &str, options: QueryOptions) -> Result<DynamicConfig> {
        self.ensure_ready(config_name)?;
        let config = self
            .evaluator
            .get_config(config_name, options.ignore_overrides);
        if !options.disable_exposure_logging {
            self.log_exposure(
                ExposureKind::Config,
                &config,
                config.secondary_exposures.clone(),
                false,
            );
        }
        Ok(config)
    }

    /// Evaluate an experiment. With [`QueryOptions::keep_device_value`] the user keeps their first
    /// variant while the experiment is active.
    ///
    /// # Errors
    ///
    /// Same as [`Client::check_gate()`].
    pub fn get_experiment(
        &self,
        experiment_name: &str,
        options: QueryOptions,
    ) -> Result<DynamicConfig> {
        self.ensure_ready(experiment_name)?;
        let experiment = self.evaluator.get_experiment(
            experiment_name,
            options.keep_device_value,
            options.ignore_overrides,
        );
        if !options.disable_exposure_logging {
            self.log_exposure(
                ExposureKind::Experiment,
                &experiment,
                experiment.secondary_exposures.clone(),
                false,
            );
        }
        Ok(experiment)
    }

    /// Evaluate a layer. No exposure is logged until a parameter is read with
    /// [`Client::get_layer_parameter()`].
    ///
    /// # Errors
    ///
    /// Same as [`Client::check_gate()`].
    pub fn get_layer(&self, layer_name: &str, options: QueryOptions) -> Result<Layer> {
        self.ensure_ready(layer_name)?;
        Ok(self.evaluator.get_layer(
            layer_name,
            options.keep_device_value,
            options.ignore_overrides,
        ))
    }

    /// Read one parameter of a layer, logging a parameter exposure if it is set.
    ///
    /// # Errors
    ///
    /// Same as [`Client::check_gate()`].
    pub fn get_layer_parameter(
        &self,
        layer_name: &str,
        parameter_name: &str,
        options: QueryOptions,
    ) -> Result<Option<serde_json::Value>> {
        let layer = self.get_layer(layer_name, options)?;
        let value = layer.get(parameter_name).cloned();
        if value.is_some() && !options.disable_exposure_logging {
            self.log_layer_parameter_exposure_for(&layer, parameter_name, false);
        }
        Ok(value)
    }

    /// Log an exposure for a gate that was checked with exposure logging disabled.
    pub fn log_gate_exposure(&self, gate_name: &str) -> Result<()> {
        self.ensure_ready(gate_name)?;
        let gate = self.evaluator.check_gate(gate_name, false);
        self.log_exposure(
            ExposureKind::Gate { value: gate.value },
            &gate,
            gate.secondary_exposures.clone(),
            true,
        );
        Ok(())
    }

    /// Log an exposure for a config that was read with exposure logging disabled.
    pub fn log_config_exposure(&self, config_name: &str) -> Result<()> {
        self.ensure_ready(config_name)?;
        let config = self.evaluator.get_config(config_name, false);
        self.log_exposure(
            ExposureKind::Config,
            &config,
            config.secondary_exposures.clone(),
            true,
        );
        Ok(())
    }

    /// Log an exposure for an experiment that was read with exposure logging disabled.
    pub fn log_experiment_exposure(
        &self,
        experiment_name: &str,
        keep_device_value: bool,
    ) -> Result<()> {
        self.ensure_ready(experiment_name)?;
        let experiment = self
            .evaluator
            .get_experiment(experiment_name, keep_device_value, false);
        self.log_exposure(
            ExposureKind::Experiment,
            &experiment,
            experiment.secondary_exposures.clone(),
            true,
        );
        Ok(())
    }

    /// Log an exposure for a layer parameter that was read with exposure logging disabled.
    pub fn log_layer_parameter_exposure(
        &self,
        layer_name: &str,
        parameter_name: &str,
        keep_device_value: bool,
    ) -> Result<()> {
        self.ensure_ready(layer_name)?;
        let layer = self
            .evaluator
            .get_layer(layer_name, keep_device_value, false);
        self.log_layer_parameter_exposure_for(&layer, parameter_name, true);
        Ok(())
    }

    pub fn override_gate(&self, gate_name: impl Into<String>, value: bool) {
        self.overrides.override_gate(gate_name, value);
    }

    pub fn override_config(&self, config_name: impl Into<String>, value: JsonObject) {
        self.overrides.override_config(config_name, value);
    }

    pub fn override_layer(&self, layer_name: impl Into<String>, value: JsonObject) {
        self.overrides.override_layer(layer_name, value);
    }

    /// Remove the override for `gate_name`, or all gate overrides if `None`.
    pub fn remove_gate_override(&self, gate_name: Option<&str>) {
        self.overrides.remove_gate_override(gate_name);
    }

    /// Remove the override for `config_name`, or all config overrides if `None`.
    pub fn remove_config_override(&self, config_name: Option<&str>) {
        self.overrides.remove_config_override(config_name);
    }

    /// Remove the override for `layer_name`, or all layer overrides if `None`.
    pub fn remove_layer_override(&self, layer_name: Option<&str>) {
        self.overrides.remove_layer_override(layer_name);
    }

    pub fn get_all_overrides(&self) -> Overrides {
        self.overrides.get_all()
    }

    /// The current user's values as initialize response JSON, for bootstrapping another client.
    pub fn get_initialize_response_json(&self) -> InitializeResponseJson {
        let values = self.store.export_json().unwrap_or_else(|err| {
            self.error_reporter.report("get_initialize_response_json", &err);
            String::new()
        });
        InitializeResponseJson {
            values,
            evaluation_details: self.get_evaluation_details(),
        }
    }

    /// Where the current values came from and when they were received.
    pub fn get_evaluation_details(&self) -> EvaluationDetails {
        self.store.global_evaluation_details()
    }

    pub fn get_stable_id(&self) -> String {
        self.stable_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_current_user(&self) -> StatsigUser {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_current_user_cache_key(&self) -> UserCacheKey {
        self.store.current_key()
    }

    /// Whether `initialize()` was called or initialize values were set.
    pub fn initialize_called(&self) -> bool {
        self.initialize_called.load(Ordering::Acquire)
    }

    fn ensure_initialize_called(&self) -> Result<()> {
        if !self.initialize_called() {
            return Err(Error::Uninitialized(
                "call initialize() first".to_owned(),
            ));
        }
        Ok(())
    }

    fn ensure_ready(&self, name: &str) -> Result<()> {
        self.ensure_initialize_called()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("name must not be empty".to_owned()));
        }
        Ok(())
    }

    fn set_current_user(&self, user: Option<StatsigUser>) -> (StatsigUser, UserCacheKey) {
        let user = normalize_user(user, self.environment.as_ref());
        let key = derive_key(&self.get_stable_id(), Some(&user), &self.sdk_key);
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user.clone();
        self.deduper.reset();
        (user, key)
    }

    /// Adopt the stable id persisted by a previous session, or persist ours.
    async fn restore_stable_id(&self) {
        if !self.stable_id_overridden {
            match self.storage.get(STABLE_ID_KEY).await {
                Ok(Some(persisted)) if !persisted.is_empty() => {
                    if persisted != self.get_stable_id() {
                        log::debug!(target: "statsig", "restored stable id from storage");
                        *self
                            .stable_id
                            .write()
                            .unwrap_or_else(PoisonError::into_inner) = persisted.clone();
                        self.orchestrator.set_stable_id(persisted.clone());
                        let key = derive_key(&persisted, Some(&self.get_current_user()), &self.sdk_key);
                        self.store.switch_user(key, false);
                    }
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    self.error_reporter.report("restore_stable_id", &err);
                    return;
                }
            }
        }

        if let Err(err) = self.storage.set(STABLE_ID_KEY, self.get_stable_id()).await {
            self.error_reporter.report("persist_stable_id", &err);
        }
    }

    fn log_exposure<T>(
        &self,
        kind: ExposureKind,
        evaluation: &Evaluation<T>,
        secondary_exposures: Vec<SecondaryExposure>,
        is_manual_exposure: bool,
    ) {
        let event = ExposureEvent {
            user: self.get_current_user(),
            kind,
            name: evaluation.name.clone(),
            rule_id: evaluation.rule_id.clone(),
            secondary_exposures,
            evaluation_details: evaluation.evaluation_details,
            is_manual_exposure,
            timestamp: Utc::now(),
        };
        let user_key = self.get_current_user_cache_key().v3;
        if is_manual_exposure || self.deduper.should_log(&user_key, &event) {
            self.exposure_logger.log_exposure(event);
        }
    }

    /// Parameters set by the allocated experiment are attributed to it; all others are attributed
    /// to the layer with its undelegated exposures.
    fn log_layer_parameter_exposure_for(
        &self,
        layer: &Layer,
        parameter_name: &str,
        is_manual_exposure: bool,
    ) {
        let is_explicit = layer
            .value
            .explicit_parameters
            .iter()
            .any(|parameter| parameter == parameter_name);
        let (allocated_experiment, exposures) = if is_explicit {
            (
                layer.value.allocated_experiment_name.clone(),
                layer.secondary_exposures.clone(),
            )
        } else {
            (None, layer.value.undelegated_secondary_exposures.clone())
        };

        self.log_exposure(
            ExposureKind::Layer {
                parameter_name: parameter_name.to_owned(),
                allocated_experiment,
                is_explicit,
            },
            layer,
            exposures,
            is_manual_exposure,
        );
    }
}

fn fire_callback(callback: Option<&CompletionCallback>, duration: Duration, error: Option<&Error>) {
    if let Some(callback) = callback {
        callback(duration, error.is_none(), error.map(ToString::to_string));
    }
}
