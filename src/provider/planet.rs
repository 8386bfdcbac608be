//! Planet order binding
//!
//! Planet's Orders API authenticates with the API key over basic auth and
//! ships results either into a customer bucket (when delivery credentials
//! are configured) or through pre-signed result URLs on the order itself.
//! Bucket delivery is complete once the order's `manifest.json` lands.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{ProviderApiConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{AssetLocator, OrderId, OrderRequest, OrderStatus, ProviderCredentials};

use super::{ItemContext, ProviderClient, Submission};

const DEFAULT_BASE_URL: &str = "https://api.planet.com";
const DELIVERY_ROOT: &str = "planet/commercial-data";

fn delivery_prefix(order_id: &OrderId) -> String {
    format!("{DELIVERY_ROOT}/{order_id}/")
}

/// Map a Planet order state onto the provider-neutral status
fn map_planet_state(state: &str, reason: Option<&str>) -> OrderStatus {
    match state {
        "queued" => OrderStatus::Pending,
        "running" | "processing" => OrderStatus::Processing,
        "success" | "partial" => OrderStatus::Delivered,
        "failed" | "cancelled" => OrderStatus::Failed {
            reason: reason.unwrap_or(state).to_string(),
        },
        other => {
            warn!(state = other, "unrecognized order state, treating as running");
            OrderStatus::Processing
        }
    }
}

/// Order client for the Planet product line
pub struct PlanetClient {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: std::time::Duration,
    credentials: ProviderCredentials,
    store: Arc<dyn ObjectStore>,
    /// Bucket for provider-side delivery; signed result URLs when absent
    delivery_bucket: Option<String>,
}

impl PlanetClient {
    /// Create a client against the configured (or default) API endpoint
    pub fn new(
        http: reqwest::Client,
        api: ProviderApiConfig,
        credentials: ProviderCredentials,
        store: Arc<dyn ObjectStore>,
        delivery_bucket: Option<String>,
    ) -> Result<Self> {
        let base_url = match api.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL).map_err(|e| Error::Config {
                message: format!("default Planet endpoint invalid: {e}"),
                key: Some("api.base_url".to_string()),
            })?,
        };
        if delivery_bucket.is_some()
            && (credentials.delivery_access_key_id.is_none()
                || credentials.delivery_secret_access_key.is_none())
        {
            return Err(Error::Config {
                message: "bucket delivery needs delivery access keys".to_string(),
                key: Some("credentials.delivery_access_key_id".to_string()),
            });
        }
        Ok(Self {
            http,
            base_url,
            request_timeout: api.request_timeout,
            credentials,
            store,
            delivery_bucket,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::Config {
            message: format!("cannot build Planet endpoint {path}: {e}"),
            key: Some("api.base_url".to_string()),
        })
    }

    fn delivery_block(&self) -> Option<Value> {
        let bucket = self.delivery_bucket.as_ref()?;
        Some(json!({
            "amazon_s3": {
                "bucket": bucket,
                "aws_region": "eu-central-1",
                "aws_access_key_id": self.credentials.delivery_access_key_id,
                "aws_secret_access_key": self.credentials.delivery_secret_access_key,
                "path_prefix": format!("{DELIVERY_ROOT}/"),
            }
        }))
    }

    async fn read_order(&self, order_id: &OrderId) -> Result<Value> {
        let response = self
            .http
            .get(self.endpoint(&format!("compute/ops/orders/v2/{order_id}"))?)
            .basic_auth(&self.credentials.api_key, Some(""))
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fetch(format!("order read failed {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("malformed order body: {e}")))
    }

    async fn manifest_landed(&self, order_id: &OrderId) -> Result<bool> {
        let Some(bucket) = &self.delivery_bucket else {
            return Ok(true);
        };
        let key = format!("{}manifest.json", delivery_prefix(order_id));
        Ok(self.store.head(bucket, &key).await?.is_some())
    }
}

#[async_trait]
impl ProviderClient for PlanetClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Planet
    }

    async fn submit(&self, request: &OrderRequest, items: &[ItemContext]) -> Result<Submission> {
        let item_ids: Vec<&str> = items.iter().map(|i| i.acquisition_id()).collect();
        // Batches share one item type; mixed batches are split upstream
        let item_type = items
            .first()
            .and_then(|i| {
                i.document
                    .get("properties")
                    .and_then(|p| p.get("planet:item_type"))
                    .and_then(|v| v.as_str())
            })
            .unwrap_or("PSScene");

        let reference = format!("order-{}", item_ids.join("-"));
        let mut payload = json!({
            "name": reference,
            "products": [{
                "item_ids": item_ids,
                "item_type": item_type,
                "product_bundle": request.product_bundle,
            }],
        });
        if let Some(ring) = &request.aoi {
            payload["tools"] = json!([{
                "clip": {"aoi": {"type": "Polygon", "coordinates": [ring]}}
            }]);
        }
        if let Some(delivery) = self.delivery_block() {
            payload["delivery"] = delivery;
        }

        debug!(items = items.len(), bundle = %request.product_bundle, "submitting Planet order");
        let response = self
            .http
            .post(self.endpoint("compute/ops/orders/v2")?)
            .basic_auth(&self.credentials.api_key, Some(""))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Submission(format!("{status}: {body}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Submission(format!("malformed order response: {e}")))?;
        let order_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Submission("order response carries no order id".to_string()))?;

        let order_id = OrderId::new(order_id);
        info!(%order_id, "Planet order accepted");
        Ok(Submission { order_id, reference })
    }

    async fn status(&self, submission: &Submission) -> Result<OrderStatus> {
        let body = self.read_order(&submission.order_id).await?;
        let state = body.get("state").and_then(|v| v.as_str()).unwrap_or("");
        let reason = body
            .get("last_message")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty());
        let status = map_planet_state(state, reason);

        // Bucket delivery lags the success state; the manifest is written
        // last, so its presence means the tree is complete
        if matches!(status, OrderStatus::Delivered)
            && !self.manifest_landed(&submission.order_id).await?
        {
            debug!(order_id = %submission.order_id, "order succeeded, delivery manifest not yet landed");
            return Ok(OrderStatus::Processing);
        }
        Ok(status)
    }

    async fn fetch_manifest(&self, submission: &Submission) -> Result<Vec<AssetLocator>> {
        if let Some(bucket) = &self.delivery_bucket {
            if !self.manifest_landed(&submission.order_id).await? {
                return Err(Error::Fetch(format!(
                    "delivery manifest missing under s3://{bucket}/{}",
                    delivery_prefix(&submission.order_id)
                )));
            }
            return Ok(vec![AssetLocator::Prefix {
                bucket: bucket.clone(),
                prefix: delivery_prefix(&submission.order_id),
            }]);
        }

        // Default delivery: the order body links every result as a
        // pre-signed URL
        let body = self.read_order(&submission.order_id).await?;
        let results = body
            .get("_links")
            .and_then(|l| l.get("results"))
            .and_then(|r| r.as_array())
            .ok_or_else(|| Error::Fetch("order body carries no results".to_string()))?;

        let mut locators = Vec::with_capacity(results.len());
        for result in results {
            let location = result
                .get("location")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Fetch("order result without location".to_string()))?;
            let url = Url::parse(location)
                .map_err(|e| Error::Fetch(format!("unparseable result URL: {e}")))?;
            locators.push(AssetLocator::SignedUrl { url });
        }
        if locators.is_empty() {
            return Err(Error::Fetch("order delivered zero results".to_string()));
        }
        Ok(locators)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalObjectStore;
    use crate::types::StacItemRef;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(with_delivery: bool) -> ProviderCredentials {
        ProviderCredentials {
            api_key: "pl-key".into(),
            delivery_access_key_id: with_delivery.then(|| "AKIA1".into()),
            delivery_secret_access_key: with_delivery.then(|| "secret".into()),
        }
    }

    fn client(
        server: &MockServer,
        store: Arc<dyn ObjectStore>,
        delivery_bucket: Option<&str>,
    ) -> PlanetClient {
        let api = ProviderApiConfig {
            base_url: Some(Url::parse(&server.uri()).unwrap()),
            token_url: None,
            request_timeout: std::time::Duration::from_secs(5),
        };
        PlanetClient::new(
            reqwest::Client::new(),
            api,
            credentials(delivery_bucket.is_some()),
            store,
            delivery_bucket.map(String::from),
        )
        .unwrap()
    }

    fn item(id: &str) -> ItemContext {
        ItemContext {
            reference: StacItemRef {
                key: format!("ws/planet_data/{id}.json"),
                collection: "planet_data".into(),
                item_id: id.into(),
            },
            document: json!({"properties": {"planet:item_type": "PSScene"}}),
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            product_bundle: "analytic_udm2".into(),
            aoi: None,
            items: vec![],
            licence: None,
            end_users: None,
        }
    }

    #[tokio::test]
    async fn submit_includes_the_s3_delivery_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/compute/ops/orders/v2"))
            .and(body_partial_json(json!({
                "products": [{
                    "item_ids": ["scene-1"],
                    "item_type": "PSScene",
                    "product_bundle": "analytic_udm2"
                }],
                "delivery": {"amazon_s3": {"bucket": "deliveries"}}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"id": "pl-9"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), Some("deliveries"));
        let submission = client.submit(&request(), &[item("scene-1")]).await.unwrap();
        assert_eq!(submission.order_id, OrderId::new("pl-9"));
    }

    #[tokio::test]
    async fn bucket_delivery_requires_delivery_keys() {
        let dir = TempDir::new().unwrap();
        let err = PlanetClient::new(
            reqwest::Client::new(),
            ProviderApiConfig::default(),
            credentials(false),
            Arc::new(LocalObjectStore::new(dir.path())),
            Some("deliveries".into()),
        )
        .err()
        .expect("construction must fail without delivery keys");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn success_state_waits_for_the_delivery_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/compute/ops/orders/v2/pl-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "success"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let client = client(&server, store.clone(), Some("deliveries"));
        let submission = Submission {
            order_id: OrderId::new("pl-9"),
            reference: "order-scene-1".into(),
        };

        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Processing);

        store
            .put(
                "deliveries",
                "planet/commercial-data/pl-9/manifest.json",
                b"{}".to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Delivered);

        let manifest = client.fetch_manifest(&submission).await.unwrap();
        assert_eq!(
            manifest,
            vec![AssetLocator::Prefix {
                bucket: "deliveries".into(),
                prefix: "planet/commercial-data/pl-9/".into(),
            }]
        );
    }

    #[tokio::test]
    async fn failed_state_carries_the_provider_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/compute/ops/orders/v2/pl-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "failed",
                "last_message": "no download permission"
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), None);
        let submission = Submission {
            order_id: OrderId::new("pl-9"),
            reference: "order-scene-1".into(),
        };
        assert_eq!(
            client.status(&submission).await.unwrap(),
            OrderStatus::Failed { reason: "no download permission".into() }
        );
    }

    #[tokio::test]
    async fn default_delivery_surfaces_signed_result_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/compute/ops/orders/v2/pl-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "success",
                "_links": {
                    "results": [
                        {"name": "scene-1/scene.tif", "location": "https://signed.example.org/scene.tif?sig=abc"},
                        {"name": "scene-1/meta.json", "location": "https://signed.example.org/meta.json?sig=def"}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), None);
        let submission = Submission {
            order_id: OrderId::new("pl-9"),
            reference: "order-scene-1".into(),
        };

        let manifest = client.fetch_manifest(&submission).await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.iter().all(|l| matches!(l, AssetLocator::SignedUrl { .. })));
    }

    #[test]
    fn state_mapping_covers_the_vendor_vocabulary() {
        assert_eq!(map_planet_state("queued", None), OrderStatus::Pending);
        assert_eq!(map_planet_state("running", None), OrderStatus::Processing);
        assert_eq!(map_planet_state("success", None), OrderStatus::Delivered);
        assert_eq!(
            map_planet_state("cancelled", None),
            OrderStatus::Failed { reason: "cancelled".into() }
        );
    }
}
