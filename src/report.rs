//! Result output
//!
//! Each invocation can write its results into a local output directory:
//! the patched item documents, an `order.json` outcome record and a
//! `catalog.json` root linking them together. Downstream steps of the
//! hosting workflow pick these files up.

use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{OrderOutcome, StacItemRef};

/// Writes invocation results into a local directory
pub struct ResultWriter {
    root: PathBuf,
}

impl ResultWriter {
    /// Create a writer rooted at `root`; the directory is created on first
    /// write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(Error::Io)
    }

    /// Write one patched item document next to the catalog
    pub async fn write_item(&self, item: &StacItemRef, document: &Value) -> Result<()> {
        self.ensure_root().await?;
        let path = self.root.join(item.file_name());
        tokio::fs::write(&path, serde_json::to_vec_pretty(document)?)
            .await
            .map_err(Error::Io)?;
        Ok(())
    }

    /// Write the outcome record and the catalog root linking every item
    pub async fn write_outcome(&self, outcome: &OrderOutcome) -> Result<()> {
        self.ensure_root().await?;

        let order_path = self.root.join("order.json");
        tokio::fs::write(&order_path, serde_json::to_vec_pretty(outcome)?)
            .await
            .map_err(Error::Io)?;

        let links: Vec<Value> = std::iter::once(json!({"rel": "root", "href": "./catalog.json"}))
            .chain(outcome.items.iter().map(|item| {
                let file = item.stac_key.rsplit('/').next().unwrap_or(&item.stac_key);
                json!({"rel": "item", "href": format!("./{file}")})
            }))
            .collect();
        let catalog = json!({
            "type": "Catalog",
            "stac_version": "1.0.0",
            "id": match &outcome.order_id {
                Some(id) => format!("order-{id}"),
                None => "order".to_string(),
            },
            "description": "Items touched by this order",
            "links": links,
        });
        let catalog_path = self.root.join("catalog.json");
        tokio::fs::write(&catalog_path, serde_json::to_vec_pretty(&catalog)?)
            .await
            .map_err(Error::Io)?;

        info!(root = %self.root.display(), items = outcome.items.len(), "result output written");
        Ok(())
    }
}
