//! Workspace transfer
//!
//! Stages normalized files into the user's persistent object-storage
//! workspace under a deterministic key layout, with checksum verification
//! and idempotent overwrite semantics.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::WorkspaceConfig;
use crate::error::{Error, Result};
use crate::store::{ObjectStore, sha256_hex};
use crate::types::{Asset, RawFile, StacItemRef};

/// Media type guessed from a file extension, mirroring the catalogue's
/// expectations; unknown extensions fall back to `application/octet-stream`
pub fn media_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "tif" | "tiff" => "image/tiff; application=geotiff",
        "jp2" => "image/jp2",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "json" => "application/json",
        "geojson" => "application/geo+json",
        "xml" | "dim" => "application/xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Role assigned to an asset in the STAC item
fn role_for(media_type: &str) -> &'static str {
    match media_type {
        "application/json" | "application/geo+json" | "application/xml" | "text/plain" => {
            "metadata"
        }
        _ => "data",
    }
}

/// Copies normalized files into the workspace bucket
pub struct WorkspaceTransferer {
    store: Arc<dyn ObjectStore>,
    workspace: WorkspaceConfig,
}

impl WorkspaceTransferer {
    /// Create a transferer writing into the given workspace
    pub fn new(store: Arc<dyn ObjectStore>, workspace: WorkspaceConfig) -> Self {
        Self { store, workspace }
    }

    /// Deterministic destination key for one file of one item
    pub fn destination_key(&self, item: &StacItemRef, raw: &RawFile) -> String {
        let relative = raw
            .relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{}/{}/{}",
            self.workspace.name, item.collection, item.item_id, relative
        )
    }

    /// Stage one file into the workspace.
    ///
    /// The transfer is considered successful only once the checksum of the
    /// written object matches the source. A pre-existing object with a
    /// matching checksum short-circuits to a read-only comparison; a
    /// mismatching one is overwritten rather than erroring on conflict.
    pub async fn store_file(&self, item: &StacItemRef, raw: &RawFile) -> Result<Asset> {
        let key = self.destination_key(item, raw);
        let data = tokio::fs::read(&raw.path)
            .await
            .map_err(|e| Error::Transfer(format!("read {}: {e}", raw.path.display())))?;
        let checksum = sha256_hex(&data);
        let size_bytes = data.len() as u64;

        let existing = self
            .store
            .head(&self.workspace.bucket, &key)
            .await
            .map_err(|e| Error::Transfer(e.to_string()))?;

        let already_present = match existing {
            Some(info) if info.size_bytes == size_bytes => {
                let remote = self
                    .store
                    .get(&self.workspace.bucket, &key)
                    .await
                    .map_err(|e| Error::Transfer(e.to_string()))?;
                sha256_hex(&remote) == checksum
            }
            _ => false,
        };

        if already_present {
            debug!(%key, "object already present with matching checksum, skipping write");
        } else {
            self.store
                .put(&self.workspace.bucket, &key, data)
                .await
                .map_err(|e| Error::Transfer(e.to_string()))?;

            // Verify the written copy before reporting success
            let written = self
                .store
                .get(&self.workspace.bucket, &key)
                .await
                .map_err(|e| Error::Transfer(e.to_string()))?;
            let written_checksum = sha256_hex(&written);
            if written_checksum != checksum {
                return Err(Error::Transfer(format!(
                    "checksum mismatch after writing {key}: source {checksum}, written {written_checksum}"
                )));
            }
            info!(%key, size_bytes, "asset staged into workspace");
        }

        let name = raw
            .relative
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(&key).to_string());
        let media_type = media_type_for(&name).to_string();
        let role = role_for(&media_type).to_string();

        Ok(Asset {
            name,
            media_type,
            role,
            size_bytes,
            checksum,
            key,
        })
    }
}
