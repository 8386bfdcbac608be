//! Vendor order bindings
//!
//! Each commercial imagery vendor exposes the same three capabilities with
//! a different API shape: submit an order, report its status, and say
//! where the deliverables landed. [`ProviderClient`] is that seam; the
//! controller is written against it and never sees vendor JSON.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::TokenProvider;
use crate::config::{Config, ProviderKind};
use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{AssetLocator, OrderId, OrderRequest, OrderStatus, StacItemRef};

mod airbus_optical;
mod airbus_sar;
mod planet;

pub use airbus_optical::AirbusOpticalClient;
pub use airbus_sar::AirbusSarClient;
pub use planet::PlanetClient;

/// One STAC item of the order together with its loaded document.
///
/// The vendor bindings read acquisition identifiers and geometry out of
/// the document; the controller loads it once and shares it.
#[derive(Clone, Debug)]
pub struct ItemContext {
    /// Catalogue reference
    pub reference: StacItemRef,
    /// The item document as currently stored
    pub document: Value,
}

impl ItemContext {
    /// Provider-side acquisition identifier for this item.
    ///
    /// Items carry it as `properties.acquisition_identifier`; the item id
    /// doubles as the identifier when the property is absent.
    pub fn acquisition_id(&self) -> &str {
        self.document
            .get("properties")
            .and_then(|p| p.get("acquisition_identifier"))
            .and_then(|v| v.as_str())
            .unwrap_or(&self.reference.item_id)
    }
}

/// A successfully submitted order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    /// Provider-assigned order id
    pub order_id: OrderId,
    /// Customer reference attached to the order, used to locate deliveries
    pub reference: String,
}

/// Uniform interface over the vendor order APIs
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which vendor binding this is
    fn kind(&self) -> ProviderKind;

    /// Submit the order. Exactly one provider-side order is created per
    /// call; anything that prevents acceptance surfaces as
    /// [`Error::Submission`] and is never retried. [`Error::ProviderRejected`]
    /// is reserved for orders that fail after acceptance.
    async fn submit(&self, request: &OrderRequest, items: &[ItemContext]) -> Result<Submission>;

    /// Current status of a submitted order. Read-only and safe to call
    /// any number of times.
    async fn status(&self, submission: &Submission) -> Result<OrderStatus>;

    /// Locations of the raw deliverables for a delivered order
    async fn fetch_manifest(&self, submission: &Submission) -> Result<Vec<AssetLocator>>;
}

/// Build the vendor binding selected by the configuration
pub fn build_provider(
    config: &Config,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
) -> Result<Arc<dyn ProviderClient>> {
    if matches!(config.provider, ProviderKind::Planet) {
        let client = PlanetClient::new(
            http,
            config.api.clone(),
            config.credentials.clone(),
            store,
            config.commercial_data_bucket.clone(),
        )?;
        return Ok(Arc::new(client));
    }

    // The Airbus bindings share the token exchange and the delivery bucket
    let token_url = config.api.token_url.clone().ok_or(Error::Config {
        message: "token endpoint required for Airbus providers".to_string(),
        key: Some("api.token_url".to_string()),
    })?;
    let tokens = Arc::new(TokenProvider::new(
        http.clone(),
        token_url,
        config.credentials.api_key.clone(),
    ));
    let delivery_bucket = config.commercial_data_bucket.clone().ok_or(Error::Config {
        message: "commercial data bucket required".to_string(),
        key: Some("commercial_data_bucket".to_string()),
    })?;

    let client: Arc<dyn ProviderClient> = match config.provider {
        ProviderKind::AirbusSar => Arc::new(AirbusSarClient::new(
            http,
            config.api.clone(),
            tokens,
            store,
            delivery_bucket,
        )?),
        ProviderKind::AirbusOptical => Arc::new(AirbusOpticalClient::new(
            http,
            config.api.clone(),
            tokens,
            store,
            delivery_bucket,
            false,
        )?),
        // Planet is handled above
        _ => {
            Arc::new(AirbusOpticalClient::new(
                http,
                config.api.clone(),
                tokens,
                store,
                delivery_bucket,
                true,
            )?)
        }
    };
    Ok(client)
}
