//! Shared fixtures for the pipeline tests

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use stac_order_adaptor::config::{
    Config, EnvironmentConfig, NotificationConfig, PollingConfig, ProviderApiConfig, ProviderKind,
    RetryConfig, TransferConfig, WorkspaceConfig,
};
use stac_order_adaptor::error::{Error, Result};
use stac_order_adaptor::provider::{ItemContext, ProviderClient, Submission};
use stac_order_adaptor::store::{LocalObjectStore, ObjectStore};
use stac_order_adaptor::types::{
    AssetLocator, OrderId, OrderRequest, OrderStatus, ProviderCredentials, StacItemRef,
};

pub const WORKSPACE_BUCKET: &str = "workspace-data";
pub const DELIVERY_BUCKET: &str = "deliveries";

/// Scripted provider: plays back a queue of statuses and a fixed manifest
pub struct MockProvider {
    statuses: tokio::sync::Mutex<VecDeque<OrderStatus>>,
    manifest: Vec<AssetLocator>,
    pub submits: AtomicU32,
    pub status_calls: AtomicU32,
    reject_submission: Option<String>,
    /// Number of leading status polls that fail with a transient error
    outage_polls: AtomicU32,
}

impl MockProvider {
    pub fn delivering(statuses: Vec<OrderStatus>, manifest: Vec<AssetLocator>) -> Self {
        Self {
            statuses: tokio::sync::Mutex::new(statuses.into()),
            manifest,
            submits: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            reject_submission: None,
            outage_polls: AtomicU32::new(0),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            statuses: tokio::sync::Mutex::new(VecDeque::new()),
            manifest: Vec::new(),
            submits: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            reject_submission: Some(reason.to_string()),
            outage_polls: AtomicU32::new(0),
        }
    }

    pub fn delivering_after_outage(
        outage_polls: u32,
        statuses: Vec<OrderStatus>,
        manifest: Vec<AssetLocator>,
    ) -> Self {
        let provider = Self::delivering(statuses, manifest);
        provider.outage_polls.store(outage_polls, Ordering::SeqCst);
        provider
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AirbusSar
    }

    async fn submit(&self, _request: &OrderRequest, _items: &[ItemContext]) -> Result<Submission> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.reject_submission {
            return Err(Error::Submission(reason.clone()));
        }
        Ok(Submission {
            order_id: OrderId::new("mock-1"),
            reference: "mock-1".into(),
        })
    }

    async fn status(&self, _submission: &Submission) -> Result<OrderStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.outage_polls.load(Ordering::SeqCst) > 0 {
            self.outage_polls.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Fetch("status endpoint unavailable".into()));
        }
        let mut statuses = self.statuses.lock().await;
        // The last scripted status repeats once the queue drains
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap_or(OrderStatus::Processing))
        } else {
            Ok(statuses.front().cloned().unwrap_or(OrderStatus::Processing))
        }
    }

    async fn fetch_manifest(&self, _submission: &Submission) -> Result<Vec<AssetLocator>> {
        Ok(self.manifest.clone())
    }
}

/// Fast-polling configuration over a local store pair
pub fn test_config() -> Config {
    Config {
        provider: ProviderKind::AirbusSar,
        credentials: ProviderCredentials::default(),
        workspace: WorkspaceConfig {
            name: "ws-alice".into(),
            bucket: WORKSPACE_BUCKET.into(),
            domain: "workspaces.example.org".into(),
        },
        commercial_data_bucket: Some(DELIVERY_BUCKET.into()),
        api: ProviderApiConfig::default(),
        polling: PollingConfig {
            initial_interval: Duration::from_millis(5),
            multiplier: 1.5,
            max_interval: Duration::from_millis(20),
            deadline: Duration::from_secs(5),
        },
        transfer: TransferConfig {
            concurrency: 2,
            retry: RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                backoff_multiplier: 2.0,
                jitter: false,
            },
        },
        notification: NotificationConfig::default(),
        environment: EnvironmentConfig::default(),
    }
}

pub fn item_ref(item_id: &str) -> StacItemRef {
    StacItemRef {
        key: format!("ws-alice/airbus_sar_data/{item_id}.json"),
        collection: "airbus_sar_data".into(),
        item_id: item_id.into(),
    }
}

pub fn item_document(item_id: &str, acquisition: &str) -> Value {
    json!({
        "type": "Feature",
        "stac_version": "1.0.0",
        "id": item_id,
        "collection": "airbus_sar_data",
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        },
        "properties": {
            "datetime": "2026-01-15T10:00:00Z",
            "acquisition_identifier": acquisition
        },
        "assets": {}
    })
}

pub fn order_request(items: Vec<StacItemRef>) -> OrderRequest {
    OrderRequest {
        product_bundle: "SSC".into(),
        aoi: None,
        items,
        licence: None,
        end_users: None,
    }
}

/// A `.tar.gz` archive holding the given entries.
///
/// Entry names are written as raw header bytes, so hostile names a
/// provider could craft (`..` components) survive into the archive;
/// `set_path` would refuse them.
pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *body).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Local store seeded with catalogue items and scripted deliveries
pub struct Harness {
    pub _dir: TempDir,
    pub store: Arc<LocalObjectStore>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        Self { _dir: dir, store }
    }

    pub async fn seed_item(&self, item_id: &str, acquisition: &str) {
        self.store
            .put(
                WORKSPACE_BUCKET,
                &item_ref(item_id).key,
                serde_json::to_vec_pretty(&item_document(item_id, acquisition)).unwrap(),
            )
            .await
            .unwrap();
    }

    pub async fn seed_delivery(&self, key: &str, body: Vec<u8>) {
        self.store.put(DELIVERY_BUCKET, key, body).await.unwrap();
    }

    pub async fn item_doc(&self, item_id: &str) -> Value {
        serde_json::from_slice(&self.item_bytes(item_id).await).unwrap()
    }

    pub async fn item_bytes(&self, item_id: &str) -> Vec<u8> {
        self.store
            .get(WORKSPACE_BUCKET, &item_ref(item_id).key)
            .await
            .unwrap()
    }
}
