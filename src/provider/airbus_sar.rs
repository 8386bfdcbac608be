//! Airbus SAR order binding
//!
//! Orders are submitted to the SAR order API with a bearer token. Airbus
//! delivers each acquisition as one `.tar.gz` dropped into the shared
//! commercial-data bucket under the order's delivery prefix, so a
//! "delivered" API status only counts once the archives have actually
//! landed.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::TokenProvider;
use crate::config::{ProviderApiConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{AssetLocator, OrderId, OrderRequest, OrderStatus};

use super::{ItemContext, ProviderClient, Submission};

const DEFAULT_BASE_URL: &str = "https://sar.api.oneatlas.airbus.com";

/// Prefix within the commercial-data bucket that deliveries land under
pub(crate) fn delivery_prefix(order_id: &OrderId) -> String {
    format!("commercial-data/{order_id}/")
}

/// Map an Airbus order status string onto the provider-neutral status
pub(crate) fn map_airbus_status(status: &str, reason: Option<&str>) -> OrderStatus {
    match status.to_ascii_lowercase().as_str() {
        "submitted" | "received" | "ordered" | "placed" => OrderStatus::Pending,
        "inproduction" | "in_production" | "processing" => OrderStatus::Processing,
        "delivered" | "completed" | "fulfilled" => OrderStatus::Delivered,
        "error" | "failed" | "cancelled" | "rejected" => OrderStatus::Failed {
            reason: reason.unwrap_or(status).to_string(),
        },
        other => {
            warn!(status = other, "unrecognized provider status, treating as in production");
            OrderStatus::Processing
        }
    }
}

/// Order client for the Airbus SAR product line
pub struct AirbusSarClient {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: std::time::Duration,
    tokens: Arc<TokenProvider>,
    store: Arc<dyn ObjectStore>,
    delivery_bucket: String,
}

impl AirbusSarClient {
    /// Create a client against the configured (or default) API endpoint
    pub fn new(
        http: reqwest::Client,
        api: ProviderApiConfig,
        tokens: Arc<TokenProvider>,
        store: Arc<dyn ObjectStore>,
        delivery_bucket: String,
    ) -> Result<Self> {
        let base_url = match api.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL).map_err(|e| Error::Config {
                message: format!("default SAR endpoint invalid: {e}"),
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
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::Config {
            message: format!("cannot build SAR endpoint {path}: {e}"),
            key: Some("api.base_url".to_string()),
        })
    }

    /// Archives the provider has delivered for this order so far
    async fn delivered_archives(&self, order_id: &OrderId) -> Result<Vec<AssetLocator>> {
        let prefix = delivery_prefix(order_id);
        let objects = self.store.list(&self.delivery_bucket, &prefix).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.key.ends_with(".tar.gz") || o.key.ends_with(".tgz"))
            .map(|o| AssetLocator::Object {
                bucket: self.delivery_bucket.clone(),
                key: o.key,
            })
            .collect())
    }
}

#[async_trait]
impl ProviderClient for AirbusSarClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AirbusSar
    }

    async fn submit(&self, request: &OrderRequest, items: &[ItemContext]) -> Result<Submission> {
        let token = self.tokens.bearer_token().await?;

        let acquisitions: Vec<Value> = items
            .iter()
            .map(|item| json!({"acquisitionId": item.acquisition_id()}))
            .collect();
        let mut payload = json!({
            "acquisitions": acquisitions,
            "orderOptions": {
                "productType": request.product_bundle,
            },
        });
        if let Some(licence) = &request.licence {
            payload["orderOptions"]["licence"] = json!(licence);
        }
        if let Some(end_users) = &request.end_users {
            payload["endUsers"] = json!(
                end_users
                    .iter()
                    .map(|u| json!({"name": u.name, "country": u.country}))
                    .collect::<Vec<_>>()
            );
        }

        debug!(items = items.len(), bundle = %request.product_bundle, "submitting SAR order");
        let response = self
            .http
            .post(self.endpoint("v1/sar/orders")?)
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
            .get("orderId")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Submission("order response carries no order id".to_string()))?;

        let order_id = OrderId::new(order_id);
        info!(%order_id, "SAR order accepted");
        Ok(Submission {
            reference: order_id.to_string(),
            order_id,
        })
    }

    async fn status(&self, submission: &Submission) -> Result<OrderStatus> {
        let token = self.tokens.bearer_token().await?;
        let response = self
            .http
            .get(self.endpoint(&format!("v1/sar/orders/{}", submission.order_id))?)
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

        // The API flips to delivered before the archives finish landing
        if matches!(status, OrderStatus::Delivered)
            && self.delivered_archives(&submission.order_id).await?.is_empty()
        {
            debug!(order_id = %submission.order_id, "delivered upstream, archives not yet in bucket");
            return Ok(OrderStatus::Processing);
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
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "bearer-sar",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer, store: Arc<dyn ObjectStore>) -> AirbusSarClient {
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
        AirbusSarClient::new(reqwest::Client::new(), api, tokens, store, "deliveries".into())
            .unwrap()
    }

    fn item(id: &str, acquisition: &str) -> ItemContext {
        ItemContext {
            reference: crate::types::StacItemRef {
                key: format!("ws/airbus_sar_data/{id}.json"),
                collection: "airbus_sar_data".into(),
                item_id: id.into(),
            },
            document: json!({"properties": {"acquisition_identifier": acquisition}}),
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            product_bundle: "SSC".into(),
            aoi: None,
            items: vec![],
            licence: Some("single".into()),
            end_users: Some(vec![crate::types::EndUser {
                name: "Example Org".into(),
                country: "DE".into(),
            }]),
        }
    }

    #[tokio::test]
    async fn submit_sends_acquisitions_with_bearer_token() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/sar/orders"))
            .and(header("authorization", "Bearer bearer-sar"))
            .and(body_partial_json(json!({
                "acquisitions": [{"acquisitionId": "TSX-1"}],
                "orderOptions": {"productType": "SSC", "licence": "single"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"orderId": "sar-42"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())));
        let submission = client.submit(&request(), &[item("acq-1", "TSX-1")]).await.unwrap();
        assert_eq!(submission.order_id, OrderId::new("sar-42"));
    }

    #[tokio::test]
    async fn rejected_order_requests_are_submission_errors() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/sar/orders"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid product bundle"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = client(&server, Arc::new(LocalObjectStore::new(dir.path())));
        let err = client.submit(&request(), &[item("acq-1", "TSX-1")]).await.unwrap_err();
        assert!(matches!(err, Error::Submission(_)), "got {err:?}");
        assert_eq!(err.kind(), crate::error::ErrorKind::Submission);
        assert!(err.to_string().contains("invalid product bundle"));
    }

    #[tokio::test]
    async fn delivered_status_waits_for_archives_in_the_bucket() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/sar/orders/sar-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "delivered"})))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let client = client(&server, store.clone());
        let submission = Submission {
            order_id: OrderId::new("sar-42"),
            reference: "sar-42".into(),
        };

        // API says delivered but nothing landed yet
        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Processing);

        store
            .put("deliveries", "commercial-data/sar-42/TSX-1.tar.gz", vec![0; 8])
            .await
            .unwrap();
        assert_eq!(client.status(&submission).await.unwrap(), OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn manifest_lists_one_locator_per_archive() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        store
            .put("deliveries", "commercial-data/sar-42/TSX-1.tar.gz", vec![0; 8])
            .await
            .unwrap();
        store
            .put("deliveries", "commercial-data/sar-42/TSX-2.tar.gz", vec![0; 8])
            .await
            .unwrap();
        // Stray non-archive object is ignored
        store
            .put("deliveries", "commercial-data/sar-42/notes.txt", vec![0; 2])
            .await
            .unwrap();

        let client = client(&server, store);
        let submission = Submission {
            order_id: OrderId::new("sar-42"),
            reference: "sar-42".into(),
        };
        let manifest = client.fetch_manifest(&submission).await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.iter().all(|l| matches!(l, AssetLocator::Object { .. })));
    }

    #[test]
    fn status_mapping_covers_the_vendor_vocabulary() {
        assert_eq!(map_airbus_status("submitted", None), OrderStatus::Pending);
        assert_eq!(map_airbus_status("inProduction", None), OrderStatus::Processing);
        assert_eq!(map_airbus_status("DELIVERED", None), OrderStatus::Delivered);
        assert_eq!(
            map_airbus_status("error", Some("production failed")),
            OrderStatus::Failed { reason: "production failed".into() }
        );
        // Unknown statuses keep the poll loop alive
        assert_eq!(map_airbus_status("somethingNew", None), OrderStatus::Processing);
    }
}
