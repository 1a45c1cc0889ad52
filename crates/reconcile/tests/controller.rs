#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crust_core::{Address, Money, ObjectKey, OrderSpec, OrderStatus, Pizza, PizzaOrder, SecretRef, StoreStatus};
use crust_fulfill::sim::{Op, SimConfig, SimProvider};
use crust_fulfill::{ExternalOrder, FulfillError, FulfillmentClient, StoreRef, TrackerSnapshot};
use crust_reconcile::controller::Controller;
use crust_reconcile::{ReconcileConfig, Reconciler};
use crust_store::{MemStore, SecretData};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn order(name: &str) -> PizzaOrder {
    PizzaOrder::new(
        ObjectKey::new("kitchen", name),
        OrderSpec {
            place_order: true,
            address: Some(Address { postal_code: "10001".into(), city: "Anytown".into(), ..Default::default() }),
            payment_secret: SecretRef { name: "card".into() },
            pizzas: vec![Pizza { size: "medium".into(), toppings: vec!["olives".into()] }],
            ..Default::default()
        },
    )
}

fn fast() -> ReconcileConfig {
    ReconcileConfig {
        poll_interval: Duration::from_millis(10),
        retry_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn controller_drives_order_to_delivery() {
    let (tx, rx) = mpsc::channel(64);
    let store = Arc::new(MemStore::with_feed(tx));
    store.put_secret("kitchen", "card", SecretData::from_pairs([("Number", "4111"), ("Expiration", "01/30")]));
    let sim = Arc::new(SimProvider::new(SimConfig { price: Some(Money::from_cents(999)), ..Default::default() }));
    let rec = Arc::new(Reconciler::new(store.clone(), store.clone(), sim.clone(), fast()));
    let shutdown = CancellationToken::new();
    let ctl = tokio::spawn(Controller::new(rec, &fast()).run(rx, shutdown.clone()));

    store.apply(order("friday")).await;
    let key = ObjectKey::new("kitchen", "friday");
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.peek(&key).is_some_and(|o| o.status.delivered) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    shutdown.cancel();
    let stats = ctl.await.unwrap();

    assert!(delivered.is_ok(), "order was not delivered in time");
    assert_eq!(sim.calls(Op::Place), 1);
    let st = store.peek(&key).unwrap().status;
    assert!(st.placed);
    assert!(st.order_id.starts_with("SIM-"));
    assert_eq!(st.price, "9.99");
    assert!(stats.reconciled >= 4);
    assert_eq!(stats.failed, 0);
}

/// Provider whose tracking call is slow and records how many calls overlap per order.
#[derive(Default)]
struct SlowTracker {
    state: Mutex<Overlap>,
}

#[derive(Default)]
struct Overlap {
    active: HashMap<String, usize>,
    peak_per_order: HashMap<String, usize>,
    active_total: usize,
    peak_total: usize,
    calls: usize,
}

#[async_trait]
impl FulfillmentClient for SlowTracker {
    async fn locate_store(&self, _: &Address) -> Result<StoreRef, FulfillError> { Err(FulfillError::NoStore("test".into())) }
    async fn price(&self, _: &ExternalOrder) -> Result<Money, FulfillError> { Err(FulfillError::Unavailable("test".into())) }
    async fn place(&self, _: &ExternalOrder) -> Result<String, FulfillError> { Err(FulfillError::Unavailable("test".into())) }

    async fn track(&self, _store_id: &str, order_id: &str) -> Result<TrackerSnapshot, FulfillError> {
        {
            let mut s = self.state.lock().unwrap();
            s.calls += 1;
            s.active_total += 1;
            s.peak_total = s.peak_total.max(s.active_total);
            let n = s.active.entry(order_id.to_string()).or_default();
            *n += 1;
            let now = *n;
            let peak = s.peak_per_order.entry(order_id.to_string()).or_default();
            *peak = (*peak).max(now);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut s = self.state.lock().unwrap();
        s.active_total -= 1;
        if let Some(n) = s.active.get_mut(order_id) {
            *n -= 1;
        }
        Ok(TrackerSnapshot::default())
    }
}

#[tokio::test]
async fn one_key_never_runs_twice_at_once() {
    let store = Arc::new(MemStore::new());
    for (name, id) in [("a", "ORD-A"), ("b", "ORD-B")] {
        let mut o = order(name);
        o.status = OrderStatus {
            placed: true,
            order_id: id.into(),
            store: Some(StoreStatus { id: "1".into(), address: String::new() }),
            ..Default::default()
        };
        store.apply(o).await;
    }
    let provider = Arc::new(SlowTracker::default());
    let cfg = ReconcileConfig::default();
    let rec = Arc::new(Reconciler::new(store.clone(), store.clone(), provider.clone(), cfg.clone()));

    let (tx, rx) = mpsc::channel(64);
    for _ in 0..5 {
        tx.send(ObjectKey::new("kitchen", "a")).await.unwrap();
        tx.send(ObjectKey::new("kitchen", "b")).await.unwrap();
    }
    let ctl = tokio::spawn(Controller::new(rec, &cfg).run(rx, CancellationToken::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    for _ in 0..5 {
        tx.send(ObjectKey::new("kitchen", "a")).await.unwrap();
    }
    drop(tx);
    let stats = tokio::time::timeout(Duration::from_secs(5), ctl).await.expect("controller did not stop").unwrap();

    let s = provider.state.lock().unwrap();
    assert_eq!(s.peak_per_order.get("ORD-A"), Some(&1));
    assert_eq!(s.peak_per_order.get("ORD-B"), Some(&1));
    assert_eq!(s.peak_total, 2);
    // Notifications queued while a key is in flight collapse into one follow-up pass.
    assert!(s.calls <= 6, "expected coalescing, saw {} passes", s.calls);
    assert_eq!(stats.reconciled as usize, s.calls);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn shutdown_interrupts_in_flight_work() {
    let store = Arc::new(MemStore::new());
    let mut o = order("slow");
    o.status = OrderStatus { placed: true, order_id: "ORD-S".into(), ..Default::default() };
    store.apply(o).await;
    let cfg = ReconcileConfig::default();
    let rec = Arc::new(Reconciler::new(store.clone(), store.clone(), Arc::new(SlowTracker::default()), cfg.clone()));

    let (tx, rx) = mpsc::channel(4);
    tx.send(ObjectKey::new("kitchen", "slow")).await.unwrap();
    let shutdown = CancellationToken::new();
    let ctl = tokio::spawn(Controller::new(rec, &cfg).run(rx, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(1), ctl).await.expect("shutdown hung").unwrap();
    assert_eq!(stats.reconciled, 0);
    drop(tx);
}
