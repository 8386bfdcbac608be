//! Order pipeline
//!
//! [`OrderController`] drives one order end to end: validate the request,
//! submit it to the vendor, poll until fulfilment, fetch and normalize
//! the deliverables, stage them into the workspace, patch the catalogue
//! and notify downstream indexers. Batches are best-effort per item: one
//! failing item never takes the others down, and the order as a whole
//! fails only when no item succeeds.

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, FailureRecord, Result, Stage};
use crate::fetch::AssetFetcher;
use crate::notify::{NotificationPublisher, publish_best_effort};
use crate::provider::{ItemContext, ProviderClient, Submission};
use crate::report::ResultWriter;
use crate::retry::{IsRetryable, retry_with_backoff};
use crate::stac::StacItemUpdater;
use crate::store::ObjectStore;
use crate::types::{
    Asset, AssetLocator, ChangeNotification, ItemOutcome, Order, OrderId, OrderOutcome,
    OrderRequest, OrderState, OrderStatus, StacItemRef,
};
use crate::workspace::WorkspaceTransferer;

/// Working state of one item while the pipeline runs
struct ItemWork {
    context: ItemContext,
    /// The catalogue was told an order is in flight for this item
    ordered: bool,
    /// A previous run already fulfilled this item
    already_succeeded: bool,
    assets: Vec<Asset>,
    updated: bool,
    error: Option<FailureRecord>,
    /// The item document as last written, for the result output
    final_document: Option<serde_json::Value>,
}

impl ItemWork {
    fn new(context: ItemContext) -> Self {
        Self {
            context,
            ordered: false,
            already_succeeded: false,
            assets: Vec::new(),
            updated: false,
            error: None,
            final_document: None,
        }
    }

    /// True while the item is still moving through the pipeline
    fn active(&self) -> bool {
        self.error.is_none() && !self.already_succeeded
    }

    /// Record the first failure; later failures of an already-failed item
    /// are dropped
    fn fail(&mut self, stage: Stage, error: &Error) {
        if self.error.is_none() {
            warn!(item = %self.context.reference.item_id, ?stage, %error, "item failed");
            self.error = Some(FailureRecord::new(stage, error));
        }
    }
}

/// Drives orders through the fulfilment pipeline
pub struct OrderController {
    config: Config,
    provider: Arc<dyn ProviderClient>,
    fetcher: AssetFetcher,
    transferer: WorkspaceTransferer,
    updater: StacItemUpdater,
    publisher: Arc<dyn NotificationPublisher>,
    report: Option<ResultWriter>,
}

impl OrderController {
    /// Wire a controller from its parts.
    ///
    /// `delivery_store` is where the vendor drops raw deliverables;
    /// `workspace_store` holds the user's workspace and catalogue. They
    /// may be the same store.
    pub fn new(
        config: Config,
        delivery_store: Arc<dyn ObjectStore>,
        workspace_store: Arc<dyn ObjectStore>,
        provider: Arc<dyn ProviderClient>,
        publisher: Arc<dyn NotificationPublisher>,
        report_root: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let fetcher = AssetFetcher::new(delivery_store, config.api.request_timeout);
        let transferer = WorkspaceTransferer::new(workspace_store.clone(), config.workspace.clone());
        let updater = StacItemUpdater::new(workspace_store, config.workspace.clone());
        Ok(Self {
            config,
            provider,
            fetcher,
            transferer,
            updater,
            publisher,
            report: report_root.map(ResultWriter::new),
        })
    }

    /// Run one order to a terminal state.
    ///
    /// Terminal failures and timeouts are reported inside the returned
    /// [`OrderOutcome`]; `Err` is reserved for an invalid request and for
    /// cancellation.
    pub async fn run(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> Result<OrderOutcome> {
        request.validate()?;
        let mut order = Order::new(self.config.polling.initial_interval);
        let mut works = self.load_items(request).await;

        // Duplicate guard: an item with an order already in flight is not
        // ordered again; an already-fulfilled item short-circuits
        for work in works.iter_mut().filter(|w| w.error.is_none()) {
            match StacItemUpdater::order_status(&work.context.document) {
                Some("ordered") => {
                    work.fail(
                        Stage::Submit,
                        &Error::Submission(format!(
                            "item {} already has an order in flight",
                            work.context.reference.item_id
                        )),
                    );
                }
                Some("succeeded") => {
                    info!(item = %work.context.reference.item_id, "already fulfilled, skipping");
                    work.already_succeeded = true;
                    work.updated = true;
                }
                _ => {}
            }
        }

        let contexts: Vec<ItemContext> = works
            .iter()
            .filter(|w| w.active())
            .map(|w| w.context.clone())
            .collect();
        if contexts.is_empty() {
            let state = if works.iter().any(|w| w.already_succeeded) {
                OrderState::Completed
            } else {
                let record = works
                    .iter()
                    .find_map(|w| w.error.clone())
                    .unwrap_or_else(|| {
                        FailureRecord::new(
                            Stage::Validate,
                            &Error::Submission("no orderable items".to_string()),
                        )
                    });
                OrderState::Failed(record)
            };
            order.advance(state)?;
            return self.finalize(order, works).await;
        }

        // Submit
        let submission = match self.provider.submit(request, &contexts).await {
            Ok(submission) => submission,
            Err(e) => {
                let record = FailureRecord::new(Stage::Submit, &e);
                for work in works.iter_mut().filter(|w| w.active()) {
                    work.fail(Stage::Submit, &e);
                }
                order.advance(OrderState::Failed(record))?;
                return self.finalize(order, works).await;
            }
        };
        order.id = Some(submission.order_id.clone());
        order.submitted_at = Some(Utc::now());
        order.advance(OrderState::Submitted)?;

        for work in works.iter_mut().filter(|w| w.active()) {
            match self
                .updater
                .mark_ordered(&work.context.reference, &submission.order_id)
                .await
            {
                Ok(_) => work.ordered = true,
                // Bookkeeping only; the final update will surface a real
                // catalogue problem
                Err(e) => warn!(
                    item = %work.context.reference.item_id,
                    error = %e,
                    "could not record in-flight order on item"
                ),
            }
        }

        // Poll until the provider reaches a terminal status
        order.advance(OrderState::Polling)?;
        let polled = match self.poll(&mut order, &submission, cancel).await {
            Ok(status) => status,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                let record = FailureRecord::new(Stage::Poll, &e);
                for work in works.iter_mut() {
                    if work.active() {
                        work.fail(Stage::Poll, &e);
                    }
                    self.mark_failed(work, Some(&submission.order_id)).await;
                }
                order.advance(OrderState::Failed(record))?;
                return self.finalize(order, works).await;
            }
        };
        match polled {
            OrderStatus::Delivered => {}
            OrderStatus::Failed { reason } => {
                let error = Error::ProviderRejected(reason);
                let record = FailureRecord::new(Stage::Poll, &error);
                for work in works.iter_mut() {
                    if work.active() {
                        work.fail(Stage::Poll, &error);
                    }
                    self.mark_failed(work, Some(&submission.order_id)).await;
                }
                order.advance(OrderState::Failed(record))?;
                return self.finalize(order, works).await;
            }
            // Deadline elapsed. Items are marked failed so a resubmission
            // passes the duplicate guard.
            _ => {
                let error = Error::TimedOut {
                    waited: self.config.polling.deadline,
                    deadline: self.config.polling.deadline,
                };
                for work in works.iter_mut() {
                    if work.active() {
                        work.fail(Stage::Poll, &error);
                    }
                    self.mark_failed(work, Some(&submission.order_id)).await;
                }
                order.advance(OrderState::TimedOut)?;
                return self.finalize(order, works).await;
            }
        }
        order.advance(OrderState::Fulfilled)?;

        // Read the manifest once
        let manifest = match retry_with_backoff(&self.config.transfer.retry, || {
            self.provider.fetch_manifest(&submission)
        })
        .await
        {
            Ok(manifest) => manifest,
            Err(e) => {
                let record = FailureRecord::new(Stage::Fetch, &e);
                for work in works.iter_mut() {
                    if work.active() {
                        work.fail(Stage::Fetch, &e);
                    }
                    self.mark_failed(work, Some(&submission.order_id)).await;
                }
                order.advance(OrderState::Failed(record))?;
                return self.finalize(order, works).await;
            }
        };
        order.set_manifest(manifest.clone())?;

        // Fetch and stage, best-effort per item
        order.advance(OrderState::Transferring)?;
        let active_count = works.iter().filter(|w| w.active()).count();
        for work in works.iter_mut().filter(|w| w.active()) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let locators = matching_locators(&manifest, &work.context, active_count);
            if locators.is_empty() {
                work.fail(
                    Stage::Fetch,
                    &Error::Fetch(format!(
                        "no deliverable matched item {}",
                        work.context.reference.item_id
                    )),
                );
                continue;
            }
            match self.stage_item(&work.context.reference, &locators).await {
                Ok(assets) => work.assets = assets,
                Err(e) => {
                    let stage = match e {
                        Error::Transfer(_) => Stage::Transfer,
                        _ => Stage::Fetch,
                    };
                    work.fail(stage, &e);
                }
            }
        }

        // Patch the catalogue and notify
        order.advance(OrderState::Updating)?;
        for work in works.iter_mut() {
            if work.active() {
                match self
                    .updater
                    .apply(&work.context.reference, &work.assets, &submission.order_id)
                    .await
                {
                    Ok((document, written)) => {
                        work.updated = true;
                        work.final_document = Some(document);
                        if written {
                            let notification = ChangeNotification::for_updated_item(
                                &self.config.workspace.name,
                                &self.config.workspace.bucket,
                                &work.context.reference.key,
                            );
                            publish_best_effort(self.publisher.as_ref(), &notification).await;
                        }
                    }
                    Err(e) => work.fail(Stage::Update, &e),
                }
            }
            if work.error.is_some() {
                self.mark_failed(work, Some(&submission.order_id)).await;
            }
        }

        let state = if works.iter().any(|w| w.updated && !w.already_succeeded) {
            OrderState::Completed
        } else {
            let record = works
                .iter()
                .find_map(|w| w.error.clone())
                .unwrap_or_else(|| {
                    FailureRecord::new(
                        Stage::Update,
                        &Error::CatalogueUpdate("no item was updated".to_string()),
                    )
                });
            OrderState::Failed(record)
        };
        order.advance(state)?;
        self.finalize(order, works).await
    }

    /// Load every requested item document; a missing or unreadable item
    /// fails that item only
    async fn load_items(&self, request: &OrderRequest) -> Vec<ItemWork> {
        let mut works = Vec::with_capacity(request.items.len());
        for reference in &request.items {
            match self.updater.load(reference).await {
                Ok(document) => works.push(ItemWork::new(ItemContext {
                    reference: reference.clone(),
                    document,
                })),
                Err(e) => {
                    let mut work = ItemWork::new(ItemContext {
                        reference: reference.clone(),
                        document: serde_json::Value::Null,
                    });
                    work.fail(Stage::Validate, &e);
                    works.push(work);
                }
            }
        }
        works
    }

    /// Poll the provider until a terminal status, the deadline or
    /// cancellation. Returns `Pending` when the deadline elapsed.
    async fn poll(
        &self,
        order: &mut Order,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<OrderStatus> {
        let polling = &self.config.polling;
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= polling.deadline {
                warn!(order_id = %submission.order_id, deadline_secs = polling.deadline.as_secs(), "order deadline elapsed");
                return Ok(OrderStatus::Pending);
            }
            let wait = order.poll_interval.min(polling.deadline - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            order.poll_attempts += 1;
            order.last_polled_at = Some(Utc::now());
            match self.provider.status(submission).await {
                Ok(status) if status.is_terminal() => {
                    info!(order_id = %submission.order_id, polls = order.poll_attempts, ?status, "order reached terminal status");
                    return Ok(status);
                }
                Ok(status) => {
                    tracing::debug!(order_id = %submission.order_id, ?status, "order still in progress");
                }
                // A flaky status read keeps the loop alive; the deadline
                // bounds it
                Err(e) if e.is_retryable() => {
                    warn!(order_id = %submission.order_id, error = %e, "status poll failed, will retry");
                    order.errors.push(FailureRecord::new(Stage::Poll, &e));
                }
                Err(e) => return Err(e),
            }
            order.poll_interval = Duration::from_secs_f64(
                order.poll_interval.as_secs_f64() * polling.multiplier,
            )
            .min(polling.max_interval);
        }
    }

    /// Fetch every matched deliverable and stage its files, transfers
    /// running concurrently up to the configured width
    async fn stage_item(
        &self,
        item: &StacItemRef,
        locators: &[&AssetLocator],
    ) -> Result<Vec<Asset>> {
        let scratch = tempfile::tempdir()?;
        let mut raws = Vec::new();
        for locator in locators {
            let files = retry_with_backoff(&self.config.transfer.retry, || {
                self.fetcher.retrieve(locator, scratch.path())
            })
            .await?;
            raws.extend(files);
        }
        if raws.is_empty() {
            return Err(Error::Fetch(format!(
                "deliverables for item {} contained no files",
                item.item_id
            )));
        }

        let assets: Vec<Asset> = stream::iter(raws.iter())
            .map(|raw| async move {
                retry_with_backoff(&self.config.transfer.retry, || {
                    self.transferer.store_file(item, raw)
                })
                .await
            })
            .buffer_unordered(self.config.transfer.concurrency)
            .try_collect()
            .await?;
        Ok(assets)
    }

    /// Record a terminal failure on the item document, best-effort
    async fn mark_failed(&self, work: &mut ItemWork, order_id: Option<&OrderId>) {
        if !work.ordered || work.final_document.is_some() {
            return;
        }
        match self.updater.mark_failed(&work.context.reference, order_id).await {
            Ok(document) => work.final_document = Some(document),
            Err(e) => warn!(
                item = %work.context.reference.item_id,
                error = %e,
                "could not record failure on item"
            ),
        }
    }

    /// Turn the working state into the outcome and write the result output
    async fn finalize(&self, order: Order, works: Vec<ItemWork>) -> Result<OrderOutcome> {
        let outcome = OrderOutcome {
            order_id: order.id.clone(),
            state: order.state().clone(),
            items: works
                .iter()
                .map(|w| ItemOutcome {
                    item_id: w.context.reference.item_id.clone(),
                    stac_key: w.context.reference.key.clone(),
                    updated: w.updated,
                    asset_keys: w.assets.iter().map(|a| a.key.clone()).collect(),
                    error: w.error.clone(),
                })
                .collect(),
            errors: order.errors,
        };

        if let Some(report) = &self.report {
            for work in &works {
                if let Some(document) = &work.final_document {
                    report.write_item(&work.context.reference, document).await?;
                }
            }
            report.write_outcome(&outcome).await?;
        }

        info!(
            order_id = ?outcome.order_id,
            state = ?outcome.state,
            items = outcome.items.len(),
            updated = outcome.items.iter().filter(|i| i.updated).count(),
            "order finished"
        );
        Ok(outcome)
    }
}

/// Deliverables belonging to one item of a batch.
///
/// A single-item order owns the whole manifest; in a batch, locators are
/// matched by the item or acquisition identifier appearing in their path.
fn matching_locators<'a>(
    manifest: &'a [AssetLocator],
    context: &ItemContext,
    active_items: usize,
) -> Vec<&'a AssetLocator> {
    if active_items <= 1 {
        return manifest.iter().collect();
    }
    let item_id = &context.reference.item_id;
    let acquisition = context.acquisition_id();
    manifest
        .iter()
        .filter(|locator| {
            let described = locator.describe();
            described.contains(item_id.as_str()) || described.contains(acquisition)
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(item_id: &str, acquisition: &str) -> ItemContext {
        ItemContext {
            reference: StacItemRef {
                key: format!("ws/coll/{item_id}.json"),
                collection: "coll".into(),
                item_id: item_id.into(),
            },
            document: json!({"properties": {"acquisition_identifier": acquisition}}),
        }
    }

    fn object(key: &str) -> AssetLocator {
        AssetLocator::Object {
            bucket: "deliveries".into(),
            key: key.into(),
        }
    }

    #[test]
    fn single_item_orders_take_the_whole_manifest() {
        let manifest = vec![object("commercial-data/o-1/whatever.tar.gz")];
        let matched = matching_locators(&manifest, &context("acq-1", "TSX-1"), 1);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn batch_items_match_by_identifier_in_the_path() {
        let manifest = vec![
            object("commercial-data/o-1/TSX-1.tar.gz"),
            object("commercial-data/o-1/TSX-2.tar.gz"),
        ];
        let matched = matching_locators(&manifest, &context("acq-1", "TSX-2"), 2);
        assert_eq!(matched.len(), 1);
        assert!(matched[0].describe().contains("TSX-2"));
    }

    #[test]
    fn batch_item_without_deliverable_matches_nothing() {
        let manifest = vec![object("commercial-data/o-1/TSX-1.tar.gz")];
        let matched = matching_locators(&manifest, &context("acq-9", "TSX-9"), 2);
        assert!(matched.is_empty());
    }
}
