//! Local evaluation cache and consistency core for the Statsig client SDK.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that answers feature gate, dynamic config, experiment
//! and layer queries for the *current user* from a locally held evaluation snapshot. Snapshots
//! come from the network, from storage left by a previous session, or from initialize values
//! supplied by the host (bootstrapping), and every answer carries [`EvaluationDetails`] saying
//! which of these it came from.
//!
//! Values are never evaluated locally: the evaluation service computes them and the client only
//! decides which snapshot to trust, merges incremental (delta) updates, and keeps snapshots for
//! recently seen users so switching users is instant.
//!
//! An [`ExposureLogger`] should be provided to receive exposure events for the values that were
//! served.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Queries only fail on caller mistakes (empty names, querying before initialization). Failures
//! to refresh values (network errors, malformed or unmergeable responses, storage errors) never
//! reach the query path: the previous values stay in place and the error goes to the configured
//! [`ErrorReporter`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target `statsig` for
//! logging messages. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod error;
mod timing;

pub mod bootstrap_validator;
pub mod cache_key;
pub mod error_boundary;
pub mod eval;
pub mod exposure_logger;
pub mod fetch_orchestrator;
pub mod hashing;
pub mod network;
pub mod overrides;
pub mod snapshot;
pub mod snapshot_store;
pub mod sticky;
pub mod storage;
pub mod user;

pub use cache_key::UserCacheKey;
pub use client::{Client, InitializeDetails, InitializeResponseJson, QueryOptions};
pub use config::{ClientConfig, CompletionCallback};
pub use error::{Error, Result};
pub use error_boundary::ErrorReporter;
pub use eval::{
    eval_details::{EvaluationDetails, EvaluationReason},
    DynamicConfig, Evaluation, FeatureGate, Layer, LayerValue,
};
pub use exposure_logger::{ExposureEvent, ExposureKind, ExposureLogger};
pub use fetch_orchestrator::FetchMode;
pub use network::{FetchRequest, FetchResponse, Network};
pub use storage::{InMemoryStorage, Storage};
pub use user::{StatsigEnvironment, StatsigUser};
