//! Transport for initialize requests.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;

use crate::{
    hashing::{djb2, HashAlgorithm},
    snapshot::JsonObject,
    timing::now_ms,
    user::StatsigUser,
    Error, Result,
};

const INITIALIZE_ENDPOINT: &str = "/initialize";
const SDK_TYPE: &str = "rust-client-core";

/// Everything needed to request values for one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub user: StatsigUser,
    #[serde(skip)]
    pub stable_id: String,
    /// Server time of the values we already have.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_time: Option<i64>,
    /// Ask for only what changed since `since_time`.
    #[serde(rename = "deltasResponseRequested")]
    pub use_delta: bool,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Additional users to fetch values for, keyed by their v3 cache key.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub prefetch_users: HashMap<String, StatsigUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_derived_fields: Option<JsonObject>,
    /// How entry names should be hashed in the response.
    pub hash: HashAlgorithm,
}

/// A response to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub has_updates: bool,
    /// The server has nothing newer than `since_time`.
    pub is_no_content: bool,
    pub is_delta: bool,
    /// Raw initialize response.
    pub payload: serde_json::Value,
}

impl FetchResponse {
    /// Read the response flags from a raw payload. Missing flags are `false`.
    pub fn from_payload(payload: serde_json::Value) -> FetchResponse {
        let flag = |name: &str| {
            payload
                .get(name)
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        };
        FetchResponse {
            has_updates: flag("has_updates"),
            is_no_content: flag("is_no_content"),
            is_delta: flag("is_delta"),
            payload,
        }
    }

    pub fn no_content() -> FetchResponse {
        FetchResponse {
            has_updates: false,
            is_no_content: true,
            is_delta: false,
            payload: serde_json::Value::Null,
        }
    }
}

/// Fetches initialize responses from the evaluation service.
///
/// Implementations must not retry on their own behalf beyond what they consider a single
/// request. A request that exceeds `timeout` fails with [`Error::Timeout`] or a network error.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch_values(&self, request: FetchRequest) -> Result<FetchResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpNetworkConfig {
    pub api: String,
    pub sdk_key: String,
}

/// [`Network`] over HTTP.
pub struct HttpNetwork {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: HttpNetworkConfig,
    /// A 401/403 means the SDK key is not valid. We remember it so we don't issue additional
    /// requests to the server.
    unauthorized: AtomicBool,
}

impl HttpNetwork {
    pub fn new(config: HttpNetworkConfig) -> HttpNetwork {
        HttpNetwork {
            client: reqwest::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    #[serde(flatten)]
    request: &'a FetchRequest,
    statsig_metadata: StatsigMetadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsigMetadata<'a> {
    sdk_type: &'static str,
    sdk_version: &'static str,
    #[serde(rename = "stableID")]
    stable_id: &'a str,
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch_values(&self, request: FetchRequest) -> Result<FetchResponse> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = Url::parse(&format!("{}{}", self.config.api, INITIALIZE_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;

        let body = RequestBody {
            request: &request,
            statsig_metadata: StatsigMetadata {
                sdk_type: SDK_TYPE,
                sdk_version: env!("CARGO_PKG_VERSION"),
                stable_id: &request.stable_id,
            },
        };

        let mut builder = self
            .client
            .post(url)
            .header("STATSIG-API-KEY", &self.config.sdk_key)
            .header("STATSIG-CLIENT-TIME", now_ms().to_string())
            .header("STATSIG-SDK-TYPE", SDK_TYPE)
            .header("STATSIG-SDK-VERSION", env!("CARGO_PKG_VERSION"))
            .json(&body);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        log::debug!(target: "statsig", use_delta = request.use_delta; "fetching initialize values");
        let response = builder.send().await.map_err(|err| match request.timeout {
            Some(timeout) if err.is_timeout() => Error::Timeout(timeout),
            _ => Error::from(err),
        })?;

        if response.status() == StatusCode::NO_CONTENT {
            log::debug!(target: "statsig", "initialize values are not modified");
            return Ok(FetchResponse::no_content());
        }

        let response = response.error_for_status().map_err(|err| {
            let status = err.status();
            if status == Some(StatusCode::UNAUTHORIZED) || status == Some(StatusCode::FORBIDDEN) {
                log::warn!(target: "statsig", "client is not authorized. Check your SDK key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "statsig", "received non-200 response while fetching initialize values: {err:?}");
                Error::from(err)
            }
        })?;

        let payload: serde_json::Value = response.json().await?;
        if !verify_sdk_key_used(&payload, &self.config.sdk_key) {
            return Err(Error::ResponseFormat(
                "response was generated for a different SDK key".to_owned(),
            ));
        }

        log::debug!(target: "statsig", "successfully fetched initialize values");
        Ok(FetchResponse::from_payload(payload))
    }
}

/// Check that a payload was generated for `sdk_key`, if the payload says which key it was
/// generated for.
pub fn verify_sdk_key_used(payload: &serde_json::Value, sdk_key: &str) -> bool {
    match payload
        .get("hashed_sdk_key_used")
        .and_then(serde_json::Value::as_str)
    {
        Some(hashed) => hashed == djb2(sdk_key),
        None => true,
    }
}
