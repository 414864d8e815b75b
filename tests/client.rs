use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use statsig_core::{
    Client, ClientConfig, Error, EvaluationReason, ExposureEvent, ExposureKind, FetchRequest,
    FetchResponse, InMemoryStorage, Network, QueryOptions, Result, StatsigUser, Storage,
};

const SDK_KEY: &str = "client-test-key";
const STABLE_ID: &str = "a-stable-id";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn initialize_response() -> Value {
    serde_json::from_str(include_str!("data/initialize_response.json")).unwrap()
}

fn user() -> StatsigUser {
    StatsigUser::with_user_id("a-user")
}

/// Serves a fixed payload after an optional delay and counts requests.
struct MockNetwork {
    payload: Value,
    delay: Duration,
    fail: bool,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockNetwork {
    fn new(payload: Value) -> MockNetwork {
        MockNetwork {
            payload,
            delay: Duration::ZERO,
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> MockNetwork {
        MockNetwork {
            fail: true,
            ..MockNetwork::new(Value::Null)
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch_values(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.requests.lock().unwrap().push(request);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::Unauthorized);
        }
        Ok(FetchResponse::from_payload(self.payload.clone()))
    }
}

fn config(network: &Arc<MockNetwork>) -> ClientConfig {
    ClientConfig::from_sdk_key(SDK_KEY)
        .override_stable_id(STABLE_ID)
        .network(Arc::clone(network) as Arc<dyn Network>)
}

async fn initialized_client(network: &Arc<MockNetwork>) -> Client {
    let client = config(network).to_client(Some(user())).unwrap();
    let details = client.initialize().await;
    assert!(details.success, "{:?}", details.error);
    client
}

fn recording_logger() -> (
    Arc<Mutex<Vec<ExposureEvent>>>,
    impl Fn(ExposureEvent) + Send + Sync + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: ExposureEvent| {
        sink.lock().unwrap().push(event)
    })
}

#[test]
fn rejects_server_sdk_keys() {
    let result = ClientConfig::from_sdk_key("secret-key").to_client(None);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let result = ClientConfig::from_sdk_key("secret-key")
        .local_mode(true)
        .to_client(None);
    assert!(result.is_ok());
}

#[tokio::test]
async fn queries_require_initialize() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = config(&network).to_client(Some(user())).unwrap();

    assert!(matches!(
        client.check_gate("a_gate"),
        Err(Error::Uninitialized(_))
    ));
    assert!(matches!(
        client.update_user(None).await,
        Err(Error::Uninitialized(_))
    ));

    client.initialize().await;
    assert!(matches!(
        client.check_gate(""),
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn initialize_serves_network_values() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;

    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.rule_id, "6N6Z8ODekNYZ7F8gFdoLP5");
    assert_eq!(gate.reason(), EvaluationReason::Network);
    assert_eq!(gate.secondary_exposures.len(), 1);

    let config = client
        .get_config("a_config", QueryOptions::default())
        .unwrap();
    assert_eq!(config.get("color"), Some(&json!("red")));

    let missing = client.check_gate("no_such_gate");
    assert_eq!(missing.ok(), Some(false));
    let missing = client
        .get_feature_gate("no_such_gate", QueryOptions::default())
        .unwrap();
    assert_eq!(missing.reason(), EvaluationReason::Unrecognized);

    assert_eq!(network.request_count(), 1);
    assert_eq!(
        client.get_evaluation_details().reason,
        EvaluationReason::Network
    );
}

#[tokio::test]
async fn initialize_is_idempotent() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;

    let details = client.initialize().await;

    assert!(details.success);
    assert_eq!(network.request_count(), 1);
}

#[tokio::test]
async fn failed_initialize_serves_defaults_with_error_reason() {
    init();
    let network = Arc::new(MockNetwork::failing());
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);
    let client = config(&network)
        .error_reporter(move |_operation: &'static str, _error: &Error| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .to_client(Some(user()))
        .unwrap();

    let details = client.initialize().await;

    assert!(!details.success);
    assert!(matches!(details.error, Some(Error::Unauthorized)));
    assert_eq!(reported.load(Ordering::SeqCst), 1);
    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(!gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Error);
}

#[tokio::test]
async fn timed_out_initialize_applies_values_later() {
    init();
    let network = Arc::new(
        MockNetwork::new(initialize_response()).with_delay(Duration::from_millis(200)),
    );
    let client = config(&network)
        .init_timeout(Duration::from_millis(20))
        .to_client(Some(user()))
        .unwrap();

    let details = client.initialize().await;

    assert!(!details.success);
    assert!(matches!(details.error, Some(Error::Timeout(_))));
    assert_eq!(
        client
            .get_feature_gate("a_gate", QueryOptions::default())
            .unwrap()
            .reason(),
        EvaluationReason::Uninitialized
    );

    tokio::time::sleep(Duration::from_millis(400)).await;

    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Network);
    assert_eq!(network.request_count(), 1);
}

#[tokio::test]
async fn concurrent_user_updates_share_one_request() {
    init();
    let network = Arc::new(
        MockNetwork::new(initialize_response()).with_delay(Duration::from_millis(50)),
    );
    let client = initialized_client(&network).await;
    let other = StatsigUser::with_user_id("other-user");

    let (first, second) = tokio::join!(
        client.update_user(Some(other.clone())),
        client.update_user(Some(other.clone())),
    );

    assert!(first.unwrap());
    assert!(second.unwrap());
    assert_eq!(network.request_count(), 2);
    assert_eq!(client.get_current_user(), other);
}

#[tokio::test]
async fn overrides_take_precedence() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;

    client.override_gate("a_gate", false);
    client.override_config("a_config", json!({"color": "blue"}).as_object().unwrap().clone());

    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(!gate.value);
    assert_eq!(gate.reason(), EvaluationReason::LocalOverride);
    assert_eq!(gate.rule_id, "override");

    let ignored = client
        .get_feature_gate("a_gate", QueryOptions::default().ignore_overrides())
        .unwrap();
    assert!(ignored.value);
    assert_eq!(ignored.reason(), EvaluationReason::Network);

    let config = client
        .get_config("a_config", QueryOptions::default())
        .unwrap();
    assert_eq!(config.get("color"), Some(&json!("blue")));

    assert_eq!(client.get_all_overrides().gates.len(), 1);
    client.remove_gate_override(None);
    client.remove_config_override(Some("a_config"));
    assert!(client.check_gate("a_gate").unwrap());
    assert_eq!(
        client
            .get_config("a_config", QueryOptions::default())
            .unwrap()
            .get("color"),
        Some(&json!("red"))
    );
}

#[tokio::test]
async fn exported_values_bootstrap_another_client() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;
    let exported = client.get_initialize_response_json();
    assert_eq!(
        exported.evaluation_details.reason,
        EvaluationReason::Network
    );
    let values: Value = serde_json::from_str(&exported.values).unwrap();

    let bootstrapped = ClientConfig::from_sdk_key(SDK_KEY)
        .override_stable_id(STABLE_ID)
        .network(Arc::new(MockNetwork::failing()) as Arc<dyn Network>)
        .initialize_values(values.clone())
        .to_client(Some(user()))
        .unwrap();
    let gate = bootstrapped
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Bootstrap);
    assert!(bootstrapped.initialize().await.success);

    let other_device = ClientConfig::from_sdk_key(SDK_KEY)
        .override_stable_id("another-stable-id")
        .initialize_values(values.clone())
        .to_client(Some(user()))
        .unwrap();
    assert_eq!(
        other_device.get_evaluation_details().reason,
        EvaluationReason::BootstrapStableIdMismatch
    );

    let other_user = ClientConfig::from_sdk_key(SDK_KEY)
        .override_stable_id(STABLE_ID)
        .initialize_values(values)
        .to_client(Some(StatsigUser::with_user_id("other-user")))
        .unwrap();
    let gate = other_user
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.reason(), EvaluationReason::InvalidBootstrap);
}

#[tokio::test]
async fn update_user_with_values_switches_without_fetching() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;

    let mut values = initialize_response();
    values["evaluated_keys"]["userID"] = json!("other-user");
    values["feature_gates"]["a_gate"]["value"] = json!(false);
    let other = StatsigUser::with_user_id("other-user");

    assert!(client
        .update_user_with_values(Some(other.clone()), &values)
        .unwrap());

    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(!gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Bootstrap);
    assert_eq!(client.get_current_user(), other);
    assert_eq!(network.request_count(), 1);
}

#[tokio::test]
async fn cached_values_survive_restart() {
    init();
    let storage = Arc::new(InMemoryStorage::new());
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let first = config(&network)
        .storage(Arc::clone(&storage) as Arc<dyn Storage>)
        .to_client(Some(user()))
        .unwrap();
    assert!(first.initialize().await.success);

    let second = ClientConfig::from_sdk_key(SDK_KEY)
        .override_stable_id(STABLE_ID)
        .storage(storage as Arc<dyn Storage>)
        .network(Arc::new(MockNetwork::failing()) as Arc<dyn Network>)
        .to_client(Some(user()))
        .unwrap();
    let details = second.initialize().await;

    assert!(!details.success);
    let gate = second
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Cache);
}

/// Storage whose every call fails.
struct BrokenStorage;

#[async_trait]
impl Storage for BrokenStorage {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Persistence("read-only file system".to_owned()))
    }

    async fn set(&self, _key: &str, _value: String) -> Result<()> {
        Err(Error::Persistence("read-only file system".to_owned()))
    }
}

#[tokio::test]
async fn storage_failures_are_reported_and_values_still_served() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let client = config(&network)
        .storage(Arc::new(BrokenStorage) as Arc<dyn Storage>)
        .error_reporter(move |operation: &'static str, _error: &Error| {
            sink.lock().unwrap().push(operation);
        })
        .to_client(Some(user()))
        .unwrap();

    let details = client.initialize().await;

    assert!(details.success, "{:?}", details.error);
    let reported = reported.lock().unwrap().clone();
    assert!(reported.contains(&"load_values"), "{reported:?}");
    assert!(reported.contains(&"persist_values"), "{reported:?}");
    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Network);
}

#[tokio::test]
async fn generated_stable_id_is_persisted() {
    init();
    let storage = Arc::new(InMemoryStorage::new());
    let network = Arc::new(MockNetwork::new(Value::Null));
    let first = ClientConfig::from_sdk_key(SDK_KEY)
        .storage(Arc::clone(&storage) as Arc<dyn Storage>)
        .network(Arc::clone(&network) as Arc<dyn Network>)
        .to_client(None)
        .unwrap();
    first.initialize().await;

    let second = ClientConfig::from_sdk_key(SDK_KEY)
        .storage(storage as Arc<dyn Storage>)
        .network(Arc::clone(&network) as Arc<dyn Network>)
        .to_client(None)
        .unwrap();
    assert_ne!(first.get_stable_id(), second.get_stable_id());
    second.initialize().await;

    assert_eq!(first.get_stable_id(), second.get_stable_id());
    assert_eq!(
        first.get_current_user_cache_key(),
        second.get_current_user_cache_key()
    );
}

#[tokio::test]
async fn local_mode_never_fetches() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = ClientConfig::from_sdk_key("any-key")
        .local_mode(true)
        .network(Arc::clone(&network) as Arc<dyn Network>)
        .to_client(Some(user()))
        .unwrap();

    assert!(client.initialize().await.success);
    assert!(client.update_user(Some(StatsigUser::with_user_id("b"))).await.unwrap());

    let gate = client
        .get_feature_gate("a_gate", QueryOptions::default())
        .unwrap();
    assert!(!gate.value);
    assert_eq!(gate.reason(), EvaluationReason::Uninitialized);
    assert_eq!(network.request_count(), 0);

    client.override_gate("a_gate", true);
    assert!(client.check_gate("a_gate").unwrap());
}

#[tokio::test]
async fn exposures_are_deduplicated() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let (events, logger) = recording_logger();
    let client = config(&network)
        .exposure_logger(logger)
        .to_client(Some(user()))
        .unwrap();
    client.initialize().await;

    client.check_gate("a_gate").unwrap();
    client.check_gate("a_gate").unwrap();
    client
        .get_feature_gate("a_gate", QueryOptions::default().disable_exposure_logging())
        .unwrap();
    assert_eq!(events.lock().unwrap().len(), 1);

    client.log_gate_exposure("a_gate").unwrap();
    client.log_gate_exposure("a_gate").unwrap();
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(!events[0].is_manual_exposure);
    assert!(events[2].is_manual_exposure);
    assert_eq!(events[0].kind, ExposureKind::Gate { value: true });
    assert_eq!(events[0].user.user_id.as_deref(), Some("a-user"));
}

#[tokio::test]
async fn layer_parameter_exposures() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let (events, logger) = recording_logger();
    let client = config(&network)
        .exposure_logger(logger)
        .to_client(Some(user()))
        .unwrap();
    client.initialize().await;

    let layer = client
        .get_layer("a_layer", QueryOptions::default())
        .unwrap();
    assert_eq!(layer.get("title"), Some(&json!("hello")));
    assert!(events.lock().unwrap().is_empty());

    assert_eq!(
        client
            .get_layer_parameter("a_layer", "variant", QueryOptions::default())
            .unwrap(),
        Some(json!("control"))
    );
    client
        .get_layer_parameter("a_layer", "title", QueryOptions::default())
        .unwrap();
    assert_eq!(
        client
            .get_layer_parameter("a_layer", "missing", QueryOptions::default())
            .unwrap(),
        None
    );

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0].kind,
        ExposureKind::Layer {
            parameter_name: "variant".to_owned(),
            allocated_experiment: Some("an_experiment".to_owned()),
            is_explicit: true,
        }
    );
    assert_eq!(events[0].secondary_exposures[0].gate, "layer_holdout");
    assert_eq!(
        events[1].kind,
        ExposureKind::Layer {
            parameter_name: "title".to_owned(),
            allocated_experiment: None,
            is_explicit: false,
        }
    );
    assert_eq!(events[1].secondary_exposures[0].gate, "undelegated_gate");
}

#[tokio::test]
async fn sticky_experiment_keeps_first_variant() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let client = initialized_client(&network).await;
    let sticky = QueryOptions::default().keep_device_value();

    let first = client.get_experiment("an_experiment", sticky).unwrap();
    assert_eq!(first.get("variant"), Some(&json!("control")));
    assert_eq!(first.reason(), EvaluationReason::Network);

    let mut reallocated = initialize_response();
    reallocated["dynamic_configs"]["an_experiment"]["value"] = json!({"variant": "test"});
    client.set_initialize_values(&reallocated);

    let kept = client.get_experiment("an_experiment", sticky).unwrap();
    assert_eq!(kept.get("variant"), Some(&json!("control")));
    assert_eq!(kept.reason(), EvaluationReason::Sticky);

    let latest = client
        .get_experiment("an_experiment", QueryOptions::default())
        .unwrap();
    assert_eq!(latest.get("variant"), Some(&json!("test")));
    assert_eq!(latest.reason(), EvaluationReason::Bootstrap);
}

#[tokio::test]
async fn completion_callbacks_fire() {
    init();
    let network = Arc::new(MockNetwork::new(initialize_response()));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let init_calls = Arc::clone(&calls);
    let update_calls = Arc::clone(&calls);
    let client = config(&network)
        .init_completion_callback(move |_, success, message| {
            init_calls.lock().unwrap().push(("init", success, message));
        })
        .update_user_completion_callback(move |_, success, message| {
            update_calls
                .lock()
                .unwrap()
                .push(("update", success, message));
        })
        .to_client(Some(user()))
        .unwrap();

    client.initialize().await;
    client
        .update_user(Some(StatsigUser::with_user_id("other-user")))
        .await
        .unwrap();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![("init", true, None), ("update", true, None)]
    );
}
