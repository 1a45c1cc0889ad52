//! Crust reconcile: drives a PizzaOrder from `placeOrder: true` to delivered.
//!
//! One [`Reconciler::reconcile`] call is one level-triggered pass: fetch, classify,
//! act, persist status, and report when the key should be looked at again.
//! [`controller::Controller`] schedules those passes.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crust_core::{now_rfc3339, ErrorKind, ObjectKey, OrderStatus, PizzaOrder, StoreStatus, Tracker, Version, Versioned};
use crust_fulfill::{assemble_order, FulfillError, FulfillmentClient};
use crust_store::{OrderStore, SecretStore, StatusWrite, StoreError};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod classify;
pub mod config;
pub mod controller;
mod guard;
pub mod payment;

pub use classify::{classify, Verdict};
pub use config::ReconcileConfig;
pub use guard::Interrupt;
pub use payment::{PaymentResolver, ResolveError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("fulfillment: {0}")]
    Fulfill(#[from] FulfillError),
    #[error("payment: {0}")]
    Payment(#[from] ResolveError),
    #[error("{op}: {cause}")]
    Interrupted { op: &'static str, cause: Interrupt },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Store(e) => e.kind(),
            ReconcileError::Fulfill(e) => e.kind(),
            ReconcileError::Payment(e) => e.kind(),
            ReconcileError::Interrupted { cause: Interrupt::Cancelled, .. } => ErrorKind::Cancelled,
            ReconcileError::Interrupted { cause: Interrupt::TimedOut(_), .. } => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change notification.
    None,
    After(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// None when the resource no longer exists.
    pub verdict: Option<Verdict>,
    pub requeue: Requeue,
}

pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    fulfill: Arc<dyn FulfillmentClient>,
    payments: PaymentResolver,
    cfg: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        secrets: Arc<dyn SecretStore>,
        fulfill: Arc<dyn FulfillmentClient>,
        cfg: ReconcileConfig,
    ) -> Self {
        let payments = PaymentResolver::new(secrets, cfg.gratuity, cfg.call_timeout);
        Self { orders, fulfill, payments, cfg }
    }

    pub fn config(&self) -> &ReconcileConfig { &self.cfg }

    async fn call<T, E, F>(&self, op: &'static str, cancel: &CancellationToken, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ReconcileError>,
    {
        match guard::guarded(cancel, self.cfg.call_timeout, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(cause) => Err(ReconcileError::Interrupted { op, cause }),
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let Some(Versioned { value: fetched, version }) = self.call("get", cancel, self.orders.get(key)).await? else {
            debug!(%key, "order not found; nothing to do");
            return Ok(Outcome { verdict: None, requeue: Requeue::None });
        };

        let mut order = fetched.clone();
        let verdict = classify(&order.spec, &order.status);
        counter!("crust_reconcile_total", 1u64, "verdict" => verdict.as_str());
        debug!(%key, %verdict, version = %version, "reconciling");

        // A cancelled step ends the pass with an error once progress so far is persisted.
        let mut interrupted: Option<ReconcileError> = None;
        let requeue = match verdict {
            Verdict::Terminal => {
                debug!(%key, "order already delivered");
                Requeue::None
            }
            Verdict::TrackingPoll => {
                if let Err(e) = self.poll_tracking(&mut order, cancel).await {
                    interrupted = Some(e);
                }
                Requeue::After(self.cfg.poll_interval)
            }
            Verdict::PlaceNew => match self.place_new(&mut order, cancel).await {
                Ok(()) => {
                    counter!("crust_orders_placed_total", 1u64);
                    info!(%key, order_id = %order.status.order_id, price = %order.status.price, "pizza order placed");
                    Requeue::After(self.cfg.poll_interval)
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    debug!(%key, error = %e, "placement interrupted");
                    interrupted = Some(e);
                    Requeue::After(self.cfg.retry_interval)
                }
                Err(e) => {
                    counter!("crust_reconcile_errors_total", 1u64, "kind" => e.kind().as_str());
                    if e.kind() == ErrorKind::Configuration {
                        error!(%key, error = %e, kind = %e.kind(), "placement blocked by configuration");
                    } else {
                        warn!(%key, error = %e, kind = %e.kind(), "placement step failed");
                    }
                    Requeue::After(self.cfg.retry_interval)
                }
            },
            Verdict::Idle => Requeue::None,
        };

        self.persist_status(&fetched.status, &order, &version, cancel).await;
        histogram!("crust_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if let Some(e) = interrupted {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(ReconcileError::Interrupted { op: "reconcile", cause: Interrupt::Cancelled });
        }
        Ok(Outcome { verdict: Some(verdict), requeue })
    }

    /// Provider failures leave the tracker untouched and are only logged; the caller
    /// polls again either way. Cancellation is returned.
    async fn poll_tracking(&self, order: &mut PizzaOrder, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        let store_id = order.status.store.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        let snap = match self.call("track", cancel, self.fulfill.track(&store_id, &order.status.order_id)).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
            Err(e) => {
                counter!("crust_reconcile_errors_total", 1u64, "kind" => e.kind().as_str());
                warn!(key = %order.key, order_id = %order.status.order_id, error = %e, "tracking refresh failed");
                return Ok(());
            }
        };
        if !snap.stages.is_empty() && order.status.tracker.get_or_insert_with(Tracker::default).merge(&snap.stages) {
            debug!(key = %order.key, "tracker advanced");
        }
        if snap.delivered && !order.status.delivered {
            order.status.delivered = true;
            info!(key = %order.key, order_id = %order.status.order_id, "pizza delivered");
        }
        Ok(())
    }

    /// Strictly sequential; each step feeds the next. Store and price already recorded
    /// by an earlier failed attempt are reused instead of asked for again.
    async fn place_new(&self, order: &mut PizzaOrder, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        let store_id = match order.status.store.as_ref().filter(|s| !s.id.is_empty()) {
            Some(s) => s.id.clone(),
            None => {
                let address = order.spec.address.clone().unwrap_or_default();
                let found = self.call("locate_store", cancel, self.fulfill.locate_store(&address)).await?;
                debug!(key = %order.key, store = %found.id, "store located");
                order.status.store = Some(StoreStatus { id: found.id.clone(), address: found.address });
                found.id
            }
        };

        let mut external = assemble_order(order, &store_id);

        if order.status.price.trim().is_empty() {
            let price = self.call("price", cancel, self.fulfill.price(&external)).await?;
            order.status.price = price.to_string();
        }

        let payment = self.payments.resolve(order, cancel).await?;
        external.payments = vec![payment];

        let order_id = self.call("place", cancel, self.fulfill.place(&external)).await?;
        order.status.order_id = order_id;
        order.status.placed = true;
        let tracker = order.status.tracker.get_or_insert_with(Tracker::default);
        if tracker.prep.is_none() {
            tracker.prep = Some(now_rfc3339());
        }
        Ok(())
    }

    /// Best effort: conflicts and store failures are logged and left for the next pass.
    async fn persist_status(&self, before: &OrderStatus, order: &PizzaOrder, version: &Version, cancel: &CancellationToken) {
        if before == &order.status {
            return;
        }
        let key = &order.key;
        let res = self.call("update_status", cancel, self.orders.update_status(key, version, &order.status)).await;
        let reason = match res {
            Ok(StatusWrite::Updated(v)) => {
                debug!(%key, version = %v, "status persisted");
                return;
            }
            Ok(StatusWrite::Conflict) => {
                warn!(%key, version = %version, "status update conflicted; next pass recomputes");
                "conflict"
            }
            Ok(StatusWrite::Missing) => {
                warn!(%key, "order vanished before status update");
                "missing"
            }
            Err(e) => {
                warn!(%key, error = %e, "failed to update order status");
                e.kind().as_str()
            }
        };
        counter!("crust_status_update_failed_total", 1u64, "reason" => reason);
    }
}
