//! Order-fulfilment adaptor for commercial satellite imagery.
//!
//! Connects a STAC catalogue to commercial imagery vendors: an order is
//! submitted against catalogue items, polled until the vendor fulfils it,
//! and the delivered scenes are staged into the user's workspace with the
//! catalogue patched to point at them.
//!
//! # Architecture
//!
//! - [`provider`]: one [`provider::ProviderClient`] binding per vendor
//!   (Airbus SAR, Airbus optical, Planet), all speaking the same
//!   submit/status/manifest interface
//! - [`fetch`]: retrieval of raw deliverables with content-sniffed,
//!   traversal-safe archive extraction
//! - [`workspace`]: checksum-verified staging into the workspace bucket
//!   under deterministic keys
//! - [`stac`]: idempotent patching of the item documents
//! - [`notify`]: best-effort change messages to downstream indexers
//! - [`controller`]: the state machine driving all of the above
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stac_order_adaptor::config::Config;
//! use stac_order_adaptor::controller::OrderController;
//! use stac_order_adaptor::notify::NoopPublisher;
//! use stac_order_adaptor::provider::build_provider;
//! use stac_order_adaptor::store::S3ObjectStore;
//! use stac_order_adaptor::types::{OrderRequest, StacItemRef};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(S3ObjectStore::from_env().await);
//! let provider = build_provider(&config, store.clone(), reqwest::Client::new())?;
//! let controller = OrderController::new(
//!     config,
//!     store.clone(),
//!     store,
//!     provider,
//!     Arc::new(NoopPublisher),
//!     None,
//! )?;
//!
//! let request = OrderRequest {
//!     product_bundle: "analytic".into(),
//!     aoi: None,
//!     items: vec![StacItemRef::from_key("ws-alice/airbus_data/acq-1.json")?],
//!     licence: None,
//!     end_users: None,
//! };
//! let outcome = controller.run(&request, &CancellationToken::new()).await?;
//! assert!(outcome.succeeded());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod provider;
pub mod report;
pub mod retry;
pub mod stac;
pub mod store;
pub mod types;
pub mod workspace;

pub use config::Config;
pub use controller::OrderController;
pub use error::{Error, Result};
pub use types::{OrderOutcome, OrderRequest, OrderState};
