//! Error types for stac-order-adaptor
//!
//! This module provides the error taxonomy for the order pipeline:
//! - Stage-specific error variants (submission, polling, fetch, transfer, ...)
//! - A machine-readable [`ErrorKind`] classification used in result records
//! - [`FailureRecord`], the structured failure object written to the result
//!   output so callers never see a bare process crash

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stac-order-adaptor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stac-order-adaptor
///
/// Each variant carries the provider- or storage-supplied detail needed to
/// diagnose the failure. Retryability is classified separately via
/// [`crate::retry::IsRetryable`].
#[derive(Debug, Error)]
pub enum Error {
    /// Order request rejected by the provider before acceptance.
    /// Never retried; the run ends and the rejection is reported.
    #[error("order submission rejected: {0}")]
    Submission(String),

    /// Order failed on the provider side after acceptance
    #[error("order rejected by provider after acceptance: {0}")]
    ProviderRejected(String),

    /// The order never reached a terminal provider status within the deadline
    #[error("order timed out after {waited:?} (deadline {deadline:?})")]
    TimedOut {
        /// How long the adaptor waited before giving up
        waited: Duration,
        /// The configured wall-clock deadline
        deadline: Duration,
    },

    /// Transient failure while retrieving delivered assets
    #[error("asset fetch failed: {0}")]
    Fetch(String),

    /// Provider delivered a malformed or unsafe archive
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// Failed to stage an asset into the workspace
    #[error("workspace transfer failed: {0}")]
    Transfer(String),

    /// Failed to patch the STAC item after assets already landed
    #[error("catalogue update failed: {0}")]
    CatalogueUpdate(String),

    /// Failed to publish the catalogue change notification (best-effort)
    #[error("notification failed: {0}")]
    Notification(String),

    /// The order was aborted by operator-initiated cancellation
    #[error("order cancelled")]
    Cancelled,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "polling.deadline")
        key: Option<String>,
    },

    /// Object store operation failed
    #[error("object store error: {0}")]
    Store(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Submission(_) => ErrorKind::Submission,
            Error::ProviderRejected(_) => ErrorKind::ProviderRejected,
            Error::TimedOut { .. } => ErrorKind::TimedOut,
            Error::Fetch(_) => ErrorKind::Fetch,
            Error::CorruptArchive(_) => ErrorKind::CorruptArchive,
            Error::Transfer(_) => ErrorKind::Transfer,
            Error::CatalogueUpdate(_) => ErrorKind::CatalogueUpdate,
            Error::Notification(_) => ErrorKind::Notification,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config { .. } => ErrorKind::Config,
            Error::Store(_) => ErrorKind::Store,
            Error::Io(_) => ErrorKind::Io,
            Error::Network(_) => ErrorKind::Network,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

/// Machine-readable error classification carried in result records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request rejected by the provider at submission
    Submission,
    /// Order failed on the provider side after acceptance
    ProviderRejected,
    /// Deadline elapsed while polling
    TimedOut,
    /// Transient fetch failure
    Fetch,
    /// Provider delivered malformed data
    CorruptArchive,
    /// Workspace transfer failure
    Transfer,
    /// Catalogue patch failure (assets already landed)
    CatalogueUpdate,
    /// Notification publish failure
    Notification,
    /// Operator-initiated abort
    Cancelled,
    /// Invalid configuration
    Config,
    /// Object store failure
    Store,
    /// Local I/O failure
    Io,
    /// Network failure
    Network,
    /// JSON (de)serialization failure
    Serialization,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Submission => "submission",
            ErrorKind::ProviderRejected => "provider_rejected",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Fetch => "fetch",
            ErrorKind::CorruptArchive => "corrupt_archive",
            ErrorKind::Transfer => "transfer",
            ErrorKind::CatalogueUpdate => "catalogue_update",
            ErrorKind::Notification => "notification",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
            ErrorKind::Io => "io",
            ErrorKind::Network => "network",
            ErrorKind::Serialization => "serialization",
        };
        write!(f, "{s}")
    }
}

/// Pipeline stage at which a failure occurred
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Request validation before submission
    Validate,
    /// Order submission
    Submit,
    /// Waiting for the provider to fulfil the order
    Poll,
    /// Retrieving delivered assets
    Fetch,
    /// Staging assets into the workspace
    Transfer,
    /// Patching the STAC item
    Update,
    /// Publishing the change notification
    Notify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Submit => "submit",
            Stage::Poll => "poll",
            Stage::Fetch => "fetch",
            Stage::Transfer => "transfer",
            Stage::Update => "update",
            Stage::Notify => "notify",
        };
        write!(f, "{s}")
    }
}

/// Structured failure object written to the result output
///
/// Identifies the failing stage and error kind, with provider-supplied
/// detail where available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage at which the failure occurred
    pub stage: Stage,
    /// Machine-readable error classification
    pub kind: ErrorKind,
    /// Human-readable detail (provider message, I/O error text, ...)
    pub detail: String,
}

impl FailureRecord {
    /// Build a record from an error, attaching stage context
    pub fn new(stage: Stage, error: &Error) -> Self {
        Self {
            stage,
            kind: error.kind(),
            detail: error.to_string(),
        }
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.stage, self.kind, self.detail)
    }
}
