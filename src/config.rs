//! Configuration types
//!
//! The whole adaptor is driven by one immutable [`Config`] constructed at
//! process start and passed explicitly into each component. There is no
//! ambient or global mutable state.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::types::ProviderCredentials;

/// Serialize/deserialize `Duration` as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Which vendor binding drives the order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Airbus SAR product line (single `.tar.gz` delivery)
    AirbusSar,
    /// Airbus optical product line (single `.zip` delivery)
    AirbusOptical,
    /// Airbus optical multi-acquisition variant (one order covering
    /// several source items)
    AirbusOpticalMulti,
    /// Planet product line (directory-tree delivery)
    Planet,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::AirbusSar => "airbus-sar",
            ProviderKind::AirbusOptical => "airbus-optical",
            ProviderKind::AirbusOpticalMulti => "airbus-optical-multi",
            ProviderKind::Planet => "planet",
        };
        write!(f, "{s}")
    }
}

/// Destination workspace: a user-scoped storage and catalogue namespace
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace identifier
    pub name: String,
    /// Object-store bucket backing the workspace
    pub bucket: String,
    /// Domain under which workspace files are served, used when building
    /// asset hrefs (e.g. `workspaces.example.org`)
    #[serde(default = "default_workspace_domain")]
    pub domain: String,
}

fn default_workspace_domain() -> String {
    "workspaces.example.org".to_string()
}

/// Provider API endpoints and per-call timeout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderApiConfig {
    /// Base URL of the vendor order API. Defaults are per-vendor; tests
    /// point this at a local mock server.
    pub base_url: Option<Url>,
    /// Token endpoint for vendors that exchange an API key for a bearer
    /// token (Airbus)
    pub token_url: Option<Url>,
    /// Per-call timeout applied to every provider request, independent of
    /// the overall order deadline
    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ProviderApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_url: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// Fulfillment polling schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay before the first status poll (default: 30 seconds)
    #[serde(default = "default_initial_interval", with = "duration_secs")]
    pub initial_interval: Duration,

    /// Multiplier applied to the interval after each poll (default: 2.0)
    #[serde(default = "default_poll_multiplier")]
    pub multiplier: f64,

    /// Cap on the interval between polls (default: 10 minutes)
    #[serde(default = "default_max_interval", with = "duration_secs")]
    pub max_interval: Duration,

    /// Maximum wall-clock time to wait for fulfillment (default: 24 hours)
    #[serde(default = "default_deadline", with = "duration_secs")]
    pub deadline: Duration,
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_multiplier() -> f64 {
    2.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_deadline() -> Duration {
    Duration::from_secs(86_400)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            multiplier: default_poll_multiplier(),
            max_interval: default_max_interval(),
            deadline: default_deadline(),
        }
    }
}

/// Retry behaviour for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_secs")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Asset transfer behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// How many assets of one order may transfer concurrently (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry policy for individual asset transfers
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_concurrency() -> usize {
    4
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

/// Catalogue change-bus target
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Broker endpoint to POST change notifications to. `None` disables
    /// publishing.
    pub endpoint: Option<Url>,

    /// Per-publish timeout (default: 10 seconds)
    #[serde(default = "default_notify_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Deployment-environment disambiguators, passed through unused by the
/// pipeline itself
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Cluster prefix of the hosting deployment
    #[serde(default)]
    pub cluster_prefix: Option<String>,
    /// Environment name (dev/prod)
    #[serde(default)]
    pub env: Option<String>,
}

/// Top-level adaptor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Vendor binding to use
    pub provider: ProviderKind,

    /// Provider credentials, injected at startup
    pub credentials: ProviderCredentials,

    /// Destination workspace
    pub workspace: WorkspaceConfig,

    /// Bucket/namespace the provider delivers into (Airbus variants)
    #[serde(default)]
    pub commercial_data_bucket: Option<String>,

    /// Provider API endpoints and timeouts
    #[serde(default)]
    pub api: ProviderApiConfig,

    /// Fulfillment polling schedule
    #[serde(default)]
    pub polling: PollingConfig,

    /// Asset transfer behaviour
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Catalogue change-bus target
    #[serde(default)]
    pub notification: NotificationConfig,

    /// Deployment-environment passthrough
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.workspace.name.is_empty() {
            return Err(Error::Config {
                message: "workspace name must not be empty".to_string(),
                key: Some("workspace.name".to_string()),
            });
        }
        if self.workspace.bucket.is_empty() {
            return Err(Error::Config {
                message: "workspace bucket must not be empty".to_string(),
                key: Some("workspace.bucket".to_string()),
            });
        }
        if matches!(
            self.provider,
            ProviderKind::AirbusSar | ProviderKind::AirbusOptical | ProviderKind::AirbusOpticalMulti
        ) && self.commercial_data_bucket.is_none()
        {
            return Err(Error::Config {
                message: format!(
                    "provider {} delivers into a commercial data bucket, none configured",
                    self.provider
                ),
                key: Some("commercial_data_bucket".to_string()),
            });
        }
        if self.polling.multiplier < 1.0 {
            return Err(Error::Config {
                message: "polling multiplier must be >= 1.0".to_string(),
                key: Some("polling.multiplier".to_string()),
            });
        }
        if self.polling.deadline < self.polling.initial_interval {
            return Err(Error::Config {
                message: "polling deadline shorter than the initial interval".to_string(),
                key: Some("polling.deadline".to_string()),
            });
        }
        Ok(())
    }
}
