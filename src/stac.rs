//! STAC item patching
//!
//! The target STAC item lives in the workspace bucket as a JSON document.
//! [`StacItemUpdater`] reads it, merges the `assets` map with entries for
//! the newly staged objects, maintains the STAC Order extension fields and
//! writes the document back. Every field the adaptor does not own
//! (geometry, unrelated assets, provider extension fields) is preserved,
//! and re-applying an identical patch is a byte-for-byte no-op.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{Asset, OrderId, StacItemRef};

/// STAC Order extension schema URL
pub const ORDER_EXTENSION: &str = "https://stac-extensions.github.io/order/v1.1.0/schema.json";

/// Order status recorded on the item via the STAC Order extension
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemOrderStatus {
    /// Available to order
    Orderable,
    /// An order is in flight
    Ordered,
    /// Order fulfilled, assets staged
    Succeeded,
    /// Order failed
    Failed,
    /// Order cancelled
    Canceled,
}

impl ItemOrderStatus {
    /// Extension string value
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOrderStatus::Orderable => "orderable",
            ItemOrderStatus::Ordered => "ordered",
            ItemOrderStatus::Succeeded => "succeeded",
            ItemOrderStatus::Failed => "failed",
            ItemOrderStatus::Canceled => "canceled",
        }
    }
}

/// Reads, patches and writes back STAC item documents
pub struct StacItemUpdater {
    store: Arc<dyn ObjectStore>,
    workspace: WorkspaceConfig,
}

impl StacItemUpdater {
    /// Create an updater over the workspace bucket
    pub fn new(store: Arc<dyn ObjectStore>, workspace: WorkspaceConfig) -> Self {
        Self { store, workspace }
    }

    /// Read the item document
    pub async fn load(&self, item: &StacItemRef) -> Result<Value> {
        let bytes = self
            .store
            .get(&self.workspace.bucket, &item.key)
            .await
            .map_err(|e| Error::CatalogueUpdate(format!("read {}: {e}", item.key)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::CatalogueUpdate(format!("parse {}: {e}", item.key)))
    }

    /// Order status currently recorded on a document, if any
    pub fn order_status(document: &Value) -> Option<&str> {
        document
            .get("properties")
            .and_then(|p| p.get("order:status"))
            .and_then(|s| s.as_str())
    }

    /// Public href under which a workspace object is served
    fn asset_href(&self, key: &str) -> String {
        // Keys are prefixed with the workspace name; the serving URL is
        // workspace-scoped, so strip it from the path
        let subpath = key
            .strip_prefix(&format!("{}/", self.workspace.name))
            .unwrap_or(key);
        format!(
            "https://{}.{}/files/{}/{}",
            self.workspace.name, self.workspace.domain, self.workspace.bucket, subpath
        )
    }

    /// Set the Order extension fields on a document
    fn set_order_fields(&self, document: &mut Value, order_id: Option<&OrderId>, status: ItemOrderStatus) {
        if document.get("properties").is_none() {
            document["properties"] = json!({});
        }
        if let Some(id) = order_id {
            document["properties"]["order:id"] = json!(id.as_str());
        }
        document["properties"]["order:status"] = json!(status.as_str());

        let extensions = document
            .get_mut("stac_extensions")
            .and_then(|e| e.as_array_mut());
        match extensions {
            Some(list) => {
                if !list.iter().any(|v| v.as_str() == Some(ORDER_EXTENSION)) {
                    list.push(json!(ORDER_EXTENSION));
                }
            }
            None => {
                document["stac_extensions"] = json!([ORDER_EXTENSION]);
            }
        }
    }

    /// Merge staged assets into the document's `assets` map, keyed by file
    /// name. Existing entries for other assets are untouched.
    fn merge_assets(&self, document: &mut Value, assets: &[Asset]) {
        if document.get("assets").is_none() {
            document["assets"] = json!({});
        }
        for asset in assets {
            document["assets"][&asset.name] = json!({
                "href": self.asset_href(&asset.key),
                "type": asset.media_type,
                "roles": [asset.role],
                "file:checksum": asset.checksum,
                "file:size": asset.size_bytes,
            });
        }
    }

    /// Serialize a document the way every write path does
    pub fn serialize(document: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(document)?)
    }

    async fn save_if_changed(
        &self,
        item: &StacItemRef,
        original: &Value,
        mut patched: Value,
    ) -> Result<(Value, bool)> {
        if &patched == original {
            debug!(key = %item.key, "item document unchanged, skipping write");
            return Ok((patched, false));
        }
        // Only stamp `updated` when the patch changed something, so a
        // re-apply with identical assets stays byte-identical
        patched["properties"]["updated"] =
            json!(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        let bytes = Self::serialize(&patched)?;
        self.store
            .put(&self.workspace.bucket, &item.key, bytes)
            .await
            .map_err(|e| Error::CatalogueUpdate(format!("write {}: {e}", item.key)))?;
        info!(key = %item.key, "item document updated");
        Ok((patched, true))
    }

    /// Record that an order is in flight for this item
    pub async fn mark_ordered(&self, item: &StacItemRef, order_id: &OrderId) -> Result<Value> {
        let original = self.load(item).await?;
        let mut patched = original.clone();
        self.set_order_fields(&mut patched, Some(order_id), ItemOrderStatus::Ordered);
        let (document, _) = self.save_if_changed(item, &original, patched).await?;
        Ok(document)
    }

    /// Record a terminal failure for this item
    pub async fn mark_failed(&self, item: &StacItemRef, order_id: Option<&OrderId>) -> Result<Value> {
        let original = self.load(item).await?;
        let mut patched = original.clone();
        self.set_order_fields(&mut patched, order_id, ItemOrderStatus::Failed);
        let (document, _) = self.save_if_changed(item, &original, patched).await?;
        Ok(document)
    }

    /// Merge the staged assets and mark the order succeeded.
    ///
    /// Returns the final document and whether a write occurred; applying
    /// the same assets twice writes exactly once.
    pub async fn apply(
        &self,
        item: &StacItemRef,
        assets: &[Asset],
        order_id: &OrderId,
    ) -> Result<(Value, bool)> {
        let original = self.load(item).await?;
        let mut patched = original.clone();
        self.merge_assets(&mut patched, assets);
        self.set_order_fields(&mut patched, Some(order_id), ItemOrderStatus::Succeeded);
        self.save_if_changed(item, &original, patched).await
    }
}
