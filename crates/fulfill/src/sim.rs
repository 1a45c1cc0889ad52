//! In-process provider. Deterministic enough to drive tests, and usable as a sandbox
//! backend for the controller when no real provider is wired in.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use crust_core::{now_rfc3339, Address, Money, Tracker};
use tracing::info;

use crate::assemble::{SIZE_LARGE, SIZE_MEDIUM, SIZE_SMALL};
use crate::{ExternalOrder, FulfillError, FulfillmentClient, StoreRef, TrackerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    LocateStore,
    Price,
    Place,
    Track,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::LocateStore => "locate_store",
            Op::Price => "price",
            Op::Place => "place",
            Op::Track => "track",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub store: StoreRef,
    /// Fixed quote; None prices each product from its size code plus toppings.
    pub price: Option<Money>,
    /// Fixed order id; None generates `SIM-<uuid>`.
    pub order_id: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            store: StoreRef { id: "1234".into(), address: "123 Main St, Anytown, NY 10001".into() },
            price: None,
            order_id: None,
        }
    }
}

#[derive(Default)]
struct SimState {
    calls: HashMap<Op, u32>,
    failures: HashMap<Op, u32>,
    /// order id -> tracker progress
    orders: HashMap<String, Tracker>,
    placed: Vec<ExternalOrder>,
}

pub struct SimProvider {
    cfg: SimConfig,
    state: Mutex<SimState>,
}

impl Default for SimProvider {
    fn default() -> Self { Self::new(SimConfig::default()) }
}

fn product_price(code: &str, options: usize) -> Option<Money> {
    let base = match code {
        SIZE_SMALL => 999,
        SIZE_MEDIUM => 1299,
        SIZE_LARGE => 1599,
        _ => return None,
    };
    // cheese and sauce are included
    let extras = options.saturating_sub(2) as i64 * 150;
    Some(Money::from_cents(base + extras))
}

impl SimProvider {
    pub fn new(cfg: SimConfig) -> Self { Self { cfg, state: Mutex::new(SimState::default()) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: Op, times: u32) { self.lock().failures.insert(op, times); }

    pub fn calls(&self, op: Op) -> u32 { self.lock().calls.get(&op).copied().unwrap_or(0) }

    pub fn total_calls(&self) -> u32 { self.lock().calls.values().sum() }

    pub fn placed_orders(&self) -> Vec<ExternalOrder> { self.lock().placed.clone() }

    /// Count the call and consume a scripted failure if one is pending.
    fn enter(&self, op: Op) -> Result<(), FulfillError> {
        let mut g = self.lock();
        *g.calls.entry(op).or_insert(0) += 1;
        metrics::counter!("crust_fulfill_calls_total", 1u64, "op" => op.as_str());
        if let Some(n) = g.failures.get_mut(&op) {
            if *n > 0 {
                *n -= 1;
                return Err(FulfillError::Unavailable(format!("scripted {} failure", op.as_str())));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FulfillmentClient for SimProvider {
    async fn locate_store(&self, address: &Address) -> Result<StoreRef, FulfillError> {
        self.enter(Op::LocateStore)?;
        if address.postal_code.trim().is_empty() && address.city.trim().is_empty() {
            return Err(FulfillError::NoStore("address has neither postal code nor city".into()));
        }
        Ok(self.cfg.store.clone())
    }

    async fn price(&self, order: &ExternalOrder) -> Result<Money, FulfillError> {
        self.enter(Op::Price)?;
        if let Some(p) = self.cfg.price {
            return Ok(p);
        }
        let mut total = Money::ZERO;
        for p in &order.products {
            let each = product_price(&p.code, p.options.len())
                .ok_or_else(|| FulfillError::Rejected(format!("invalid product code {}", p.code)))?;
            for _ in 0..p.qty {
                total = total.checked_add(each).ok_or_else(|| FulfillError::Rejected("price overflow".into()))?;
            }
        }
        Ok(total)
    }

    async fn place(&self, order: &ExternalOrder) -> Result<String, FulfillError> {
        self.enter(Op::Place)?;
        if order.payments.is_empty() {
            return Err(FulfillError::Rejected("order carries no payment".into()));
        }
        if order.products.is_empty() {
            return Err(FulfillError::Rejected("order has no products".into()));
        }
        let id = self.cfg.order_id.clone().unwrap_or_else(|| format!("SIM-{}", uuid::Uuid::new_v4()));
        let mut g = self.lock();
        g.orders.insert(id.clone(), Tracker { prep: Some(now_rfc3339()), ..Default::default() });
        g.placed.push(order.clone());
        info!(order_id = %id, store = %order.store_id, products = order.products.len(), "sim order placed");
        Ok(id)
    }

    /// Every call advances the order by one stage until it is delivered.
    async fn track(&self, store_id: &str, order_id: &str) -> Result<TrackerSnapshot, FulfillError> {
        self.enter(Op::Track)?;
        if store_id != self.cfg.store.id {
            return Err(FulfillError::UnknownOrder(format!("{} at store {}", order_id, store_id)));
        }
        let mut g = self.lock();
        let t = g.orders.get_mut(order_id).ok_or_else(|| FulfillError::UnknownOrder(order_id.to_string()))?;
        let now = now_rfc3339();
        let next = [&mut t.prep, &mut t.bake, &mut t.quality_check, &mut t.out_for_delivery, &mut t.delivered]
            .into_iter()
            .find(|s| s.is_none());
        if let Some(stage) = next {
            *stage = Some(now);
        }
        Ok(TrackerSnapshot { delivered: t.delivered.is_some(), stages: t.clone() })
    }
}
