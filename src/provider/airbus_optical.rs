//! Airbus optical order binding
//!
//! The optical product line takes a product bundle name and expands it
//! into the API's product options. Deliveries arrive as one `.zip` per
//! acquisition in the commercial-data bucket. The multi-acquisition
//! variant places a single order covering every item of the batch.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::auth::TokenProvider;
use crate::config::{ProviderApiConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{AssetLocator, OrderId, OrderRequest, OrderStatus};

use super::airbus_sar::{delivery_prefix, map_airbus_status};
use super::{ItemContext, ProviderClient, Submission};

const DEFAULT_BASE_URL: &str = "https://order.api.oneatlas.airbus.com";

/// API options a product bundle expands into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleOptions {
    /// Product type sent to the API
    pub product_type: &'static str,
    /// Image format
    pub image_format: &'static str,
    /// Radiometric processing level
    pub radiometric_processing: &'static str,
}

/// Expand a product bundle name into concrete order options.
///
/// Unknown bundles are rejected before anything reaches the provider.
pub fn bundle_options(bundle: &str) -> Result<BundleOptions> {
    let options = match bundle {
        "general_use" | "visual" => BundleOptions {
            product_type: "pansharpened",
            image_format: "image/jp2",
            radiometric_processing: "DISPLAY",
        },
        "analytic" => BundleOptions {
            product_type: "pansharpened",
            image_format: "image/jp2",
            radiometric_processing: "REFLECTANCE",
        },
        "basic" => BundleOptions {
            product_type: "bundle",
            image_format: "image/jp2",
            radiometric_processing: "BASIC",
        },
        other => {
            return Err(Error::Submission(format!(
                "unknown product bundle '{other}'"
            )));
        }
    };
    Ok(options)
}

/// Order client for the Airbus optical product lines
pub struct AirbusOpticalClient {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: std::time::Duration,
    tokens: Arc<TokenProvider>,
    store: Arc<dyn ObjectStore>,
    delivery_bucket: String,
    /// One order covering all acquisitions instead of one per item
    multi: bool,
}

impl AirbusOpticalClient {
    /// Create a client against the configured (or default) API endpoint
    pub fn new(
        http: reqwest::Client,
        api: ProviderApiConfig,
        tokens: Arc<TokenProvider>,
        store: Arc<dyn ObjectStore>,
        delivery_bucket: String,
        multi: bool,
    ) -> Result<Self> {
        let base_url = match api.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL).map_err(|e| Error::Config {
                message: format!("default optical endpoint invalid: {e}"),
                key: Some("api.base_url".to_string()),
            })?,
        };
        Ok(Self {
            http,
            base_url,
            request_timeout: api.request_timeout,
            tokens,
            store,
            delivery_bucket,
            multi,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::Config {
            message: format!("cannot build optical endpoint {path}: {e}"),
            key: Some("api.base_url".to_string()),
        })
    }

    fn product(
        &self,
        options: &BundleOptions,
        request: &OrderRequest,
        item: &ItemContext,
    ) -> Value {
        let mut product = json!({
            "id": item.acquisition_id(),
            "productType": options.product_type,
            "imageFormat": options.image_format,
            "radiometricProcessing": options.radiometric_processing,
            "crsCode": "urn:ogc:def:crs:EPSG::4326",
        });
        // Clip to the AOI when one is given; otherwise the item's own
        // footprint bounds the product
        let geometry = match &request.aoi {
            Some(ring) => json!({"type": "Polygon", "coordinates": [ring]}),
            None => item
                .document
                .get("geometry")
                .cloned()
                .unwrap_or(Value::Null),
        };
        if !geometry.is_null() {
            product["aoi"] = geometry;
        }
        product
    }

    async fn delivered_archives(&self, order_id: &OrderId) -> Result<Vec<AssetLocator>> {
        let prefix = delivery_prefix(order_id);
        let objects = self.store.list(&self.delivery_bucket, &prefix).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.key.ends_with(".zip"))
            .map(|o| AssetLocator::Object {
                bucket: self.delivery_bucket.clone(),
                key: o.key,
            })
            .collect())
    }

    /// Every acquisition must have landed before the order counts as
    /// delivered; the provider uploads archives one by one
    fn delivery_complete(&self, archives: &[AssetLocator], expected: usize) -> bool {
        if self.multi {
            archives.len() >= expected
        } else {
            !archives.is_empty()
        }
    }
}

#[async_trait]
impl ProviderClient for AirbusOpticalClient {
    fn kind(&self) -> ProviderKind {
        if self.multi {
            ProviderKind::AirbusOpticalMulti
        } else {
            ProviderKind::AirbusOptical
        }
    }

    async fn submit(&self, request: &OrderRequest, items: &[ItemContext]) -> Result<Submission> {
        if !self.multi && items.len() > 1 {
            return Err(Error::Submission(format!(
                "optical orders cover one acquisition, got {}",
                items.len()
            )));
        }
        let options = bundle_options(&request.product_bundle)?;
        let token = self.tokens.bearer_token().await?;

        let products: Vec<Value> = items
            .iter()
            .map(|item| self.product(&options, request, item))
            .collect();
        let payload = json!({
            "kind": "order.data.product",
            "products": products,
        });

        debug!(items = items.len(), bundle = %request.product_bundle, "submitting optical order");
        let response = self
            .http
            .post(self.endpoint("api/v1/orders")?)
            .bearer_auth(&token)
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
            .get("salesOrderId")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Submission("order response carries no order id".to_string()))?;

        let order_id = OrderId::new(order_id);
        info!(%order_id, multi = self.multi, "optical order accepted");
        Ok(Submission {
            reference: order_id.to_string(),
            order_id,
        })
    }

    async fn status(&self, submission: &Submission) -> Result<OrderStatus> {
        let token = self.tokens.bearer_token().await?;
        let response = self
            .http
            .get(self.endpoint(&format!("api/v1/orders/{}", submission.order_id))?)
            .bearer_auth(&token)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fetch(format!("order status read failed {status}: {body}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("malformed status response: {e}")))?;
        let reported = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
        let reason = body.get("message").and_then(|v| v.as_str());
        let status = map_airbus_status(reported, reason);

        if matches!(status, OrderStatus::Delivered) {
            let expected = body
                .get("deliverables")
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as usize;
            let archives = self.delivered_archives(&submission.order_id).await?;
            if !self.delivery_complete(&archives, expected) {
                debug!(
                    order_id = %submission.order_id,
                    landed = archives.len(),
                    expected,
                    "delivered upstream, archives still landing"
                );
                return Ok(OrderStatus::Processing);
            }
        }
        Ok(status)
    }

    async fn fetch_manifest(&self, submission: &Submission) -> Result<Vec<AssetLocator>> {
        let archives = self.delivered_archives(&submission.order_id).await?;
        if archives.is_empty() {
            return Err(Error::Fetch(format!(
                "no archives under s3://{}/{}",
                self.delivery_bucket,
                delivery_prefix(&submission.order_id)
            )));
        }
        Ok(archives)
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

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "bearer-opt",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer, store: Arc<dyn ObjectStore>, multi: bool) -> AirbusOpticalClient {
        let api = ProviderApiConfig {
            base_url: Some(Url::parse(&server.uri()).unwrap()),
            token_url: Some(Url::parse(&format!("{}/auth/token", server.uri())).unwrap()),
            request_timeout: std::time::Duration::from_secs(5),
        };
        let tokens = Arc::new(TokenProvider::new(
            reqwest::Client::new(),
            api.token_url.clone().unwrap(),
            "key".into(),
        ));
        AirbusOpticalClient::new(
            reqwest::Client::new(),
            api,
            tokens,
            store,
            "deliveries".into(),
            multi,
        )
        .unwrap()
    }

    fn item(id: &str) -> ItemContext {
        ItemContext {
            reference: StacItemRef {
                key: format!("ws/airbus_data/{id}.json"),
                collection: "airbus_data".into(),
                item_id: id.into(),
            },
            document: json!({
                "properties": {"acquisition_identifier": id},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
                }
            }),
        }
    }

    fn request(bundle: &str) -> OrderRequest {
        OrderRequest {
            product_bundle: bundle.into(),
            aoi: None,
            items: vec![],
            licence: None,
            end_users: None,
        }
    }

    #[tokio::test]
    async fn submit_expands_the_bundle_into_product_options() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/orders"))
            .and(body_partial_json(json!({
                "kind": "order.data.product",
                "products": [{
                    "id": "DS_PHR1A_1",
                    "productType": "pansharpened",
                    "radiometricProcessing": "REFLECTANCE"
                }]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"salesOrderId": "opt-7"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), false);
        let submission = client
            .submit(&request("analytic"), &[item("DS_PHR1A_1")])
            .await
            .unwrap();
        assert_eq!(submission.order_id, OrderId::new("opt-7"));
    }

    #[tokio::test]
    async fn unknown_bundle_is_rejected_before_the_provider_sees_it() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), false);
        let err = client
            .submit(&request("premium_deluxe"), &[item("DS_1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn single_variant_refuses_batches() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), false);
        let err = client
            .submit(&request("visual"), &[item("DS_1"), item("DS_2")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Submission(_)));
    }

    #[tokio::test]
    async fn multi_variant_orders_every_acquisition_at_once() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/orders"))
            .and(body_partial_json(json!({
                "products": [{"id": "DS_1"}, {"id": "DS_2"}]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "opt-8"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())), true);
        let submission = client
            .submit(&request("visual"), &[item("DS_1"), item("DS_2")])
            .await
            .unwrap();
        assert_eq!(submission.order_id, OrderId::new("opt-8"));
    }

    #[tokio::test]
    async fn multi_delivery_waits_for_every_archive() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/orders/opt-8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "delivered",
                "deliverables": 2
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let client = client(&server, store.clone(), true);
        let submission = Submission {
            order_id: OrderId::new("opt-8"),
            reference: "opt-8".into(),
        };

        store
            .put("deliveries", "commercial-data/opt-8/DS_1.zip", vec![0; 8])
            .await
            .unwrap();
        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Processing);

        store
            .put("deliveries", "commercial-data/opt-8/DS_2.zip", vec![0; 8])
            .await
            .unwrap();
        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Delivered);

        let manifest = client.fetch_manifest(&submission).await.unwrap();
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn bundle_map_matches_the_product_catalogue() {
        assert_eq!(bundle_options("visual").unwrap().radiometric_processing, "DISPLAY");
        assert_eq!(
            bundle_options("analytic").unwrap().radiometric_processing,
            "REFLECTANCE"
        );
        assert_eq!(bundle_options("basic").unwrap().product_type, "bundle");
        assert!(bundle_options("nope").is_err());
    }
}
