use serde::{Deserialize, Serialize};

/// Why a value was served.
///
/// Variants are declared in order of decreasing trust, so `Ord` can be used to compare the
/// provenance of two answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvaluationReason {
    /// Fetched from the server in this session.
    Network,
    /// The server confirmed the cached values are still current.
    NetworkNotModified,
    /// Loaded from storage, written by a previous session.
    Cache,
    /// Fetched ahead of time while another user was active.
    Prefetch,
    /// Persisted experiment assignment served because the caller asked to keep the device value.
    Sticky,
    /// Set by the host through an override.
    LocalOverride,
    /// Initialize values passed in by the host.
    Bootstrap,
    /// Initialize values that were evaluated for a different user.
    InvalidBootstrap,
    /// Initialize values that only differ from the current user in the stable id.
    #[serde(rename = "BootstrapStableIDMismatch")]
    BootstrapStableIdMismatch,
    /// Values are loaded, but they have no entry with the requested name.
    Unrecognized,
    /// No values are loaded yet.
    Uninitialized,
    /// Loading values failed.
    Error,
}

/// Provenance attached to every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails {
    pub reason: EvaluationReason,
    /// When the served value was produced (ms since epoch): the time the snapshot was received,
    /// the time a sticky value was allocated, or the time of evaluation for defaults and
    /// overrides.
    pub time: i64,
}
