use std::{sync::Arc, time::Duration};

use crate::{
    error_boundary::{ErrorReporter, LogErrorReporter},
    exposure_logger::{ExposureLogger, NoopExposureLogger},
    fetch_orchestrator::{FetchMode, FetchOrchestratorConfig},
    network::Network,
    storage::{InMemoryStorage, Storage},
    user::{StatsigEnvironment, StatsigUser},
    Client, Result,
};

/// Called when initialization or a user update completes, with how long it took, whether it
/// succeeded, and an error message otherwise.
pub type CompletionCallback = Box<dyn Fn(Duration, bool, Option<String>) + Send + Sync>;

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use statsig_core::{ClientConfig, ExposureEvent, StatsigUser};
/// let client = ClientConfig::from_sdk_key("client-sdk-key")
///     .exposure_logger(|event: ExposureEvent| {
///         println!("{:?}", event);
///     })
///     .to_client(Some(StatsigUser::with_user_id("a-user")));
/// ```
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) api: String,
    pub(crate) init_timeout: Duration,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) fetch_mode: FetchMode,
    pub(crate) disable_hashing: bool,
    pub(crate) local_mode: bool,
    pub(crate) override_stable_id: Option<String>,
    pub(crate) environment: Option<StatsigEnvironment>,
    pub(crate) initialize_values: Option<serde_json::Value>,
    pub(crate) prefetch_users: Vec<StatsigUser>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) network: Option<Arc<dyn Network>>,
    pub(crate) exposure_logger: Box<dyn ExposureLogger + Send + Sync>,
    pub(crate) error_reporter: Arc<dyn ErrorReporter + Send + Sync>,
    pub(crate) init_completion_callback: Option<CompletionCallback>,
    pub(crate) update_user_completion_callback: Option<CompletionCallback>,
}

impl ClientConfig {
    /// Create a default configuration using the specified client SDK key.
    ///
    /// ```
    /// # use statsig_core::ClientConfig;
    /// ClientConfig::from_sdk_key("client-sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            api: ClientConfig::DEFAULT_API.to_owned(),
            init_timeout: ClientConfig::DEFAULT_INIT_TIMEOUT,
            request_timeout: None,
            fetch_mode: FetchMode::default(),
            disable_hashing: false,
            local_mode: false,
            override_stable_id: None,
            environment: None,
            initialize_values: None,
            prefetch_users: Vec::new(),
            storage: Arc::new(InMemoryStorage::new()),
            network: None,
            exposure_logger: Box::new(NoopExposureLogger),
            error_reporter: Arc::new(LogErrorReporter),
            init_completion_callback: None,
            update_user_completion_callback: None,
        }
    }

    /// Default base URL for API calls.
    pub const DEFAULT_API: &'static str = "https://featuregates.org/v1";

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn api(mut self, api: impl Into<String>) -> Self {
        self.api = api.into();
        self
    }

    /// Default value for [`ClientConfig::init_timeout`].
    pub const DEFAULT_INIT_TIMEOUT: Duration = FetchOrchestratorConfig::DEFAULT_INIT_TIMEOUT;

    /// How long `initialize()` and `update_user()` wait for the network. Values that arrive later
    /// are still applied.
    pub fn init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = init_timeout;
        self
    }

    /// Hard bound on a single request. By default requests are not bounded.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    /// Ask the server for plain entry names instead of hashed ones.
    pub fn disable_hashing(mut self, disable_hashing: bool) -> Self {
        self.disable_hashing = disable_hashing;
        self
    }

    /// Never talk to the network. Values come from initialize values, overrides and storage only.
    pub fn local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    /// Use the given stable id instead of a generated (or previously persisted) one.
    pub fn override_stable_id(mut self, stable_id: impl Into<String>) -> Self {
        self.override_stable_id = Some(stable_id.into());
        self
    }

    /// Environment tier (e.g., `"staging"`) attached to every user.
    pub fn environment(mut self, tier: impl Into<String>) -> Self {
        self.environment = Some(StatsigEnvironment { tier: tier.into() });
        self
    }

    /// Start with these initialize values. The client is usable right away and `initialize()`
    /// does not fetch.
    pub fn initialize_values(mut self, values: serde_json::Value) -> Self {
        self.initialize_values = Some(values);
        self
    }

    /// Users to fetch values for during `initialize()`, so switching to them is instant.
    pub fn prefetch_users(mut self, users: Vec<StatsigUser>) -> Self {
        self.prefetch_users = users;
        self
    }

    /// Where evaluation snapshots, sticky assignments and the stable id are persisted. Defaults
    /// to memory only.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the HTTP transport.
    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set exposure logger to pass exposures to your analytics pipeline.
    ///
    /// ```
    /// # use statsig_core::{ClientConfig, ExposureEvent};
    /// let config = ClientConfig::from_sdk_key("client-sdk-key").exposure_logger(|event: ExposureEvent| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn exposure_logger(
        mut self,
        exposure_logger: impl ExposureLogger + Send + Sync + 'static,
    ) -> Self {
        self.exposure_logger = Box::new(exposure_logger);
        self
    }

    /// Receive errors that the client recovers from. Defaults to logging them.
    pub fn error_reporter(
        mut self,
        error_reporter: impl ErrorReporter + Send + Sync + 'static,
    ) -> Self {
        self.error_reporter = Arc::new(error_reporter);
        self
    }

    pub fn init_completion_callback(
        mut self,
        callback: impl Fn(Duration, bool, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        self.init_completion_callback = Some(Box::new(callback));
        self
    }

    pub fn update_user_completion_callback(
        mut self,
        callback: impl Fn(Duration, bool, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        self.update_user_completion_callback = Some(Box::new(callback));
        self
    }

    /// Create a new [`Client`] for `user` using the specified configuration.
    ///
    /// ```
    /// # use statsig_core::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_sdk_key("client-sdk-key").to_client(None).unwrap();
    /// ```
    pub fn to_client(self, user: Option<StatsigUser>) -> Result<Client> {
        Client::new(self, user)
    }
}
