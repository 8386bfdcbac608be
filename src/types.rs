//! Core types for stac-order-adaptor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{Error, FailureRecord, Result};

/// Provider-assigned identifier for a submitted order
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    /// Create a new OrderId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Order status as reported by the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted but production has not started
    Pending,
    /// In production
    Processing,
    /// Terminal success, assets available for retrieval
    Delivered,
    /// Terminal failure on the provider side
    Failed {
        /// Provider-supplied failure reason
        reason: String,
    },
}

impl OrderStatus {
    /// True for `Delivered` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Failed { .. })
    }
}

/// Lifecycle state of a single order
///
/// States only ever move forward; [`Order::advance`] enforces this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Constructed, not yet submitted
    Created,
    /// Accepted by the provider
    Submitted,
    /// Waiting for the provider to fulfil the order
    Polling,
    /// Provider reported terminal success
    Fulfilled,
    /// Assets being fetched and staged into the workspace
    Transferring,
    /// STAC items being patched
    Updating,
    /// Pipeline finished; catalogue reflects the delivered assets
    Completed,
    /// Deadline elapsed while polling; safe to resubmit
    TimedOut,
    /// Terminal failure
    Failed(FailureRecord),
}

impl OrderState {
    /// Ordinal used to enforce forward-only transitions
    fn ordinal(&self) -> u8 {
        match self {
            OrderState::Created => 0,
            OrderState::Submitted => 1,
            OrderState::Polling => 2,
            OrderState::Fulfilled => 3,
            OrderState::Transferring => 4,
            OrderState::Updating => 5,
            OrderState::Completed => 6,
            // Terminal failure states are reachable from anywhere
            OrderState::TimedOut | OrderState::Failed(_) => 7,
        }
    }

    /// True once no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Completed | OrderState::TimedOut | OrderState::Failed(_)
        )
    }
}

/// Location of a raw deliverable reported by the provider manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetLocator {
    /// A single object (archive or loose file) in a delivery bucket
    Object {
        /// Bucket the provider delivered into
        bucket: String,
        /// Object key
        key: String,
    },
    /// A listable directory tree of already-split files
    Prefix {
        /// Bucket the provider delivered into
        bucket: String,
        /// Key prefix of the delivery folder
        prefix: String,
    },
    /// A pre-signed download URL
    SignedUrl {
        /// The signed URL
        url: Url,
    },
}

impl AssetLocator {
    /// Best-effort name of the locator, used to match deliverables to items
    pub fn describe(&self) -> String {
        match self {
            AssetLocator::Object { bucket, key } => format!("s3://{bucket}/{key}"),
            AssetLocator::Prefix { bucket, prefix } => format!("s3://{bucket}/{prefix}"),
            AssetLocator::SignedUrl { url } => url.to_string(),
        }
    }
}

/// A raw file produced by fetching and normalizing a deliverable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFile {
    /// Absolute path within the scratch directory
    pub path: std::path::PathBuf,
    /// Path relative to the delivery root, preserved in the workspace key
    pub relative: std::path::PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
}

/// A single delivered file staged into the workspace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// File name, used as the asset key in the STAC item
    pub name: String,
    /// Media type guessed from the file extension
    pub media_type: String,
    /// Asset role (`data` or `metadata`)
    pub role: String,
    /// Size of the written object in bytes
    pub size_bytes: u64,
    /// SHA-256 checksum of the written object, `sha256:<hex>`
    pub checksum: String,
    /// Final object key within the workspace bucket
    pub key: String,
}

/// Reference to a STAC item document in the workspace bucket
///
/// The document is borrowed, patched and written back; no adaptor
/// component owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StacItemRef {
    /// Object key of the item document within the workspace bucket
    pub key: String,
    /// Collection the item belongs to
    pub collection: String,
    /// Item identifier (provider-specific catalogue key)
    pub item_id: String,
}

impl StacItemRef {
    /// Derive a reference from a workspace object key.
    ///
    /// Keys follow `<workspace>/.../<collection>/<item-id>.json`; the file
    /// stem is the item id and the containing folder the collection.
    pub fn from_key(key: &str) -> Result<Self> {
        let path = std::path::Path::new(key);
        let item_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config {
                message: format!("cannot derive item id from STAC key '{key}'"),
                key: Some("stac_key".to_string()),
            })?
            .to_string();
        let collection = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or("default")
            .to_string();
        Ok(Self {
            key: key.to_string(),
            collection,
            item_id,
        })
    }

    /// File name of the item document (last key segment)
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Named end user declaration required by export-controlled product lines
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndUser {
    /// End user name
    pub name: String,
    /// End user country
    pub country: String,
}

/// A GeoJSON polygon ring (lon/lat positions, first == last)
pub type PolygonRing = Vec<[f64; 2]>;

/// Validate a polygon ring: at least four positions, closed, coordinates
/// within lon/lat range.
pub fn validate_polygon_ring(ring: &PolygonRing) -> Result<()> {
    if ring.len() < 4 {
        return Err(Error::Config {
            message: format!("polygon ring has {} positions, need at least 4", ring.len()),
            key: Some("coordinates".to_string()),
        });
    }
    if ring.first() != ring.last() {
        return Err(Error::Config {
            message: "polygon ring is not closed".to_string(),
            key: Some("coordinates".to_string()),
        });
    }
    for &[lon, lat] in ring {
        if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
            return Err(Error::Config {
                message: format!("position ({lon}, {lat}) outside lon/lat range"),
                key: Some("coordinates".to_string()),
            });
        }
    }
    Ok(())
}

/// Immutable input describing one order, constructed once per invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Provider product-tier identifier
    pub product_bundle: String,
    /// Optional area-of-interest polygon ring. Required for area-clipped
    /// products; when absent the item's own geometry bounds the order.
    pub aoi: Option<PolygonRing>,
    /// STAC items to order (1..N; more than one forms a batch)
    pub items: Vec<StacItemRef>,
    /// Licence tier, where the provider enforces one
    pub licence: Option<String>,
    /// End user declarations for export-controlled product lines
    pub end_users: Option<Vec<EndUser>>,
}

impl OrderRequest {
    /// Validate the request shape before submission
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(Error::Config {
                message: "order request contains no STAC items".to_string(),
                key: Some("stac_keys".to_string()),
            });
        }
        if let Some(ring) = &self.aoi {
            validate_polygon_ring(ring)?;
        }
        Ok(())
    }
}

/// Mutable state of one order, owned exclusively by the controller
#[derive(Clone, Debug)]
pub struct Order {
    /// Provider-assigned id, set once on submission
    pub id: Option<OrderId>,
    state: OrderState,
    /// When the order was submitted
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the provider status was last read
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Number of status polls performed
    pub poll_attempts: u32,
    /// Current backoff interval between polls, carried so the wait is
    /// resumable rather than an opaque sleep
    pub poll_interval: Duration,
    manifest: Option<Vec<AssetLocator>>,
    /// Recoverable failures encountered along the way, in order
    pub errors: Vec<FailureRecord>,
}

impl Order {
    /// Create an order in the `Created` state
    pub fn new(initial_poll_interval: Duration) -> Self {
        Self {
            id: None,
            state: OrderState::Created,
            submitted_at: None,
            last_polled_at: None,
            poll_attempts: 0,
            poll_interval: initial_poll_interval,
            manifest: None,
            errors: Vec::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> &OrderState {
        &self.state
    }

    /// Move to a later state. Backward transitions are a programming error
    /// and are rejected.
    pub fn advance(&mut self, next: OrderState) -> Result<()> {
        if self.state.is_terminal() || next.ordinal() < self.state.ordinal() {
            return Err(Error::Config {
                message: format!(
                    "illegal order transition {:?} -> {:?}",
                    self.state, next
                ),
                key: None,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the provider asset manifest. Populated at most once;
    /// a second call is rejected.
    pub fn set_manifest(&mut self, manifest: Vec<AssetLocator>) -> Result<()> {
        if self.manifest.is_some() {
            return Err(Error::Config {
                message: "order manifest already populated".to_string(),
                key: None,
            });
        }
        self.manifest = Some(manifest);
        Ok(())
    }

    /// The provider asset manifest, if fulfilled
    pub fn manifest(&self) -> Option<&[AssetLocator]> {
        self.manifest.as_deref()
    }
}

/// Opaque credentials handle injected at startup.
///
/// Never logged or persisted; `Debug` redacts all secret material.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    /// Provider API key
    pub api_key: String,
    /// Access key id for provider-side delivery into an object store
    /// (Planet S3 delivery block)
    pub delivery_access_key_id: Option<String>,
    /// Secret access key paired with `delivery_access_key_id`
    pub delivery_secret_access_key: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"<redacted>")
            .field(
                "delivery_access_key_id",
                &self.delivery_access_key_id.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "delivery_secret_access_key",
                &self
                    .delivery_secret_access_key
                    .as_ref()
                    .map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Catalogue change-bus payload emitted when an item document is rewritten
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Message id, `<workspace>/order_item/<file>`
    pub id: String,
    /// Workspace the item belongs to
    pub workspace: String,
    /// Bucket holding the item document
    pub bucket_name: String,
    /// Object keys added by this change
    pub added_keys: Vec<String>,
    /// Object keys updated by this change
    pub updated_keys: Vec<String>,
    /// Object keys deleted by this change
    pub deleted_keys: Vec<String>,
    /// Originating workspace
    pub source: String,
    /// Downstream indexing target
    pub target: String,
}

impl ChangeNotification {
    /// Build the standard payload for an updated item document
    pub fn for_updated_item(workspace: &str, bucket: &str, key: &str) -> Self {
        let file_id = key.rsplit('/').next().unwrap_or(key);
        Self {
            id: format!("{workspace}/order_item/{file_id}"),
            workspace: workspace.to_string(),
            bucket_name: bucket.to_string(),
            added_keys: Vec::new(),
            updated_keys: vec![key.to_string()],
            deleted_keys: Vec::new(),
            source: workspace.to_string(),
            target: format!("user-datasets/{workspace}"),
        }
    }
}

/// Per-item outcome record written to the result output directory
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Item identifier
    pub item_id: String,
    /// Object key of the item document
    pub stac_key: String,
    /// Whether the item's catalogue entry now reflects delivered assets
    pub updated: bool,
    /// Workspace keys of the staged assets
    pub asset_keys: Vec<String>,
    /// Failure detail when the item did not succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
}

/// Final result of driving one order through the pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderOutcome {
    /// Provider order id, when submission succeeded
    pub order_id: Option<OrderId>,
    /// Terminal state the order reached
    pub state: OrderState,
    /// Per-item outcome records
    pub items: Vec<ItemOutcome>,
    /// Recoverable failures the order survived, in the order encountered
    #[serde(default)]
    pub errors: Vec<FailureRecord>,
}

impl OrderOutcome {
    /// True when at least one item succeeded and the order completed
    pub fn succeeded(&self) -> bool {
        matches!(self.state, OrderState::Completed) && self.items.iter().any(|i| i.updated)
    }

    /// True when the order completed but some items failed
    pub fn partial(&self) -> bool {
        self.succeeded() && self.items.iter().any(|i| !i.updated)
    }
}
