#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use crust_core::{Address, Customer, ErrorKind, Money, ObjectKey, OrderSpec, OrderStatus, Pizza, PizzaOrder, SecretRef, StoreStatus};
use crust_fulfill::sim::{Op, SimConfig, SimProvider};
use async_trait::async_trait;
use crust_fulfill::{ExternalOrder, FulfillError, FulfillmentClient, StoreRef, TrackerSnapshot};
use crust_reconcile::{Outcome, ReconcileConfig, ReconcileError, Reconciler, Requeue, Verdict};
use crust_store::{MemStore, SecretData};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_secs(120);
const RETRY: Duration = Duration::from_secs(300);

struct World {
    store: Arc<MemStore>,
    sim: Arc<SimProvider>,
    rec: Reconciler,
}

fn world() -> World {
    let store = Arc::new(MemStore::new());
    let sim = Arc::new(SimProvider::new(SimConfig {
        store: StoreRef { id: "4321".into(), address: "9 Oven St".into() },
        price: Some(Money::from_cents(999)),
        order_id: Some("ORD-1".into()),
    }));
    let rec = Reconciler::new(store.clone(), store.clone(), sim.clone(), ReconcileConfig::default());
    World { store, sim, rec }
}

fn card() -> SecretData {
    SecretData::from_pairs([("Number", "4111111111111111"), ("Expiration", "01/30"), ("SecurityCode", "123"), ("PostalCode", "10001")])
}

fn key() -> ObjectKey { ObjectKey::new("kitchen", "friday") }

fn spec(secret: &str) -> OrderSpec {
    OrderSpec {
        place_order: true,
        address: Some(Address {
            street: "1 Main St".into(),
            city: "Anytown".into(),
            region: "NY".into(),
            postal_code: "10001".into(),
            phone: "5550100".into(),
        }),
        customer: Some(Customer { first_name: "Ada".into(), last_name: "L".into(), email: "ada@example.com".into() }),
        payment_secret: SecretRef { name: secret.into() },
        pizzas: vec![
            Pizza { size: "large".into(), toppings: vec!["pepperoni".into(), "mushrooms".into()] },
            Pizza { size: "small".into(), toppings: vec![] },
        ],
    }
}

async fn pass(w: &World) -> Outcome {
    w.rec.reconcile(&key(), &CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn order_goes_from_placement_to_delivery() {
    let w = world();
    w.store.put_secret("kitchen", "card", card());
    w.store.apply(PizzaOrder::new(key(), spec("card"))).await;

    let out = pass(&w).await;
    assert_eq!(out.verdict, Some(Verdict::PlaceNew));
    assert_eq!(out.requeue, Requeue::After(POLL));
    let st = w.store.peek(&key()).unwrap().status;
    assert!(st.placed && !st.delivered);
    assert_eq!(st.order_id, "ORD-1");
    assert_eq!(st.price, "9.99");
    assert_eq!(st.store, Some(StoreStatus { id: "4321".into(), address: "9 Oven St".into() }));

    let placed = w.sim.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].store_id, "4321");
    assert_eq!(placed[0].products.len(), 2);
    assert_eq!(placed[0].payments[0].amount, Money::from_cents(1499));
    assert_eq!(placed[0].payments[0].tip_amount, Money::from_cents(500));

    let mut polls = 0;
    loop {
        let out = pass(&w).await;
        if out.verdict == Some(Verdict::Terminal) {
            assert_eq!(out.requeue, Requeue::None);
            break;
        }
        assert_eq!(out, Outcome { verdict: Some(Verdict::TrackingPoll), requeue: Requeue::After(POLL) });
        polls += 1;
        assert!(polls <= 5, "order never delivered");
    }
    assert_eq!(w.sim.calls(Op::Place), 1);
    let tracker = w.store.peek(&key()).unwrap().status.tracker.unwrap();
    assert!(tracker.prep.is_some() && tracker.bake.is_some() && tracker.delivered.is_some());
}

#[tokio::test]
async fn delivered_order_is_left_alone() {
    let w = world();
    let mut o = PizzaOrder::new(key(), spec("card"));
    o.status = OrderStatus { placed: true, delivered: true, order_id: "ORD-0".into(), ..Default::default() };
    w.store.apply(o).await;

    for _ in 0..3 {
        let out = pass(&w).await;
        assert_eq!(out.verdict, Some(Verdict::Terminal));
        assert_eq!(out.requeue, Requeue::None);
    }
    assert_eq!(w.sim.total_calls(), 0);
    assert_eq!(w.store.status_writes(), 0);
    assert_eq!(w.store.secret_reads(), 0);
}

#[tokio::test]
async fn placed_order_is_never_placed_again() {
    for place_order in [true, false] {
        let w = world();
        w.store.put_secret("kitchen", "card", card());
        let mut o = PizzaOrder::new(key(), OrderSpec { place_order, ..spec("card") });
        o.status = OrderStatus {
            placed: true,
            order_id: "ORD-9".into(),
            store: Some(StoreStatus { id: "4321".into(), address: String::new() }),
            ..Default::default()
        };
        w.store.apply(o).await;

        for _ in 0..3 {
            assert_eq!(pass(&w).await.verdict, Some(Verdict::TrackingPoll), "placeOrder={place_order}");
        }
        assert_eq!(w.sim.calls(Op::Place), 0);
        assert_eq!(w.sim.calls(Op::LocateStore), 0);
        assert_eq!(w.sim.calls(Op::Price), 0);
        assert_eq!(w.sim.calls(Op::Track), 3);
        assert_eq!(w.store.secret_reads(), 0);
        // ORD-9 was never placed with the simulator, so tracking keeps failing and status stays put.
        assert_eq!(w.store.status_writes(), 0);
    }
}

#[tokio::test]
async fn missing_secret_keeps_progress_and_recovers_once_created() {
    let w = world();
    w.store.apply(PizzaOrder::new(key(), spec("card"))).await;

    let out = pass(&w).await;
    assert_eq!(out.requeue, Requeue::After(RETRY));
    let st = w.store.peek(&key()).unwrap().status;
    assert!(!st.placed);
    assert_eq!(st.price, "9.99");
    assert_eq!(st.store.as_ref().map(|s| s.id.as_str()), Some("4321"));
    assert_eq!(w.sim.calls(Op::Place), 0);

    w.store.put_secret("kitchen", "card", card());
    let out = pass(&w).await;
    assert_eq!(out.requeue, Requeue::After(POLL));
    assert!(w.store.peek(&key()).unwrap().status.placed);
    assert_eq!(w.sim.calls(Op::LocateStore), 1);
    assert_eq!(w.sim.calls(Op::Price), 1);
}

#[tokio::test]
async fn empty_secret_reference_never_reaches_the_provider_for_placement() {
    let w = world();
    w.store.apply(PizzaOrder::new(key(), spec(""))).await;
    let out = pass(&w).await;
    assert_eq!(out.requeue, Requeue::After(RETRY));
    assert_eq!(w.store.secret_reads(), 0);
    assert_eq!(w.sim.calls(Op::Place), 0);
}

#[tokio::test]
async fn store_failure_aborts_before_pricing() {
    let w = world();
    w.store.put_secret("kitchen", "card", card());
    w.store.apply(PizzaOrder::new(key(), spec("card"))).await;
    w.sim.fail(Op::LocateStore, 1);

    let out = pass(&w).await;
    assert_eq!(out.requeue, Requeue::After(RETRY));
    assert_eq!(w.sim.calls(Op::Price), 0);
    assert_eq!(w.store.status_writes(), 0);
}

#[tokio::test]
async fn deleted_order_is_forgotten() {
    let w = world();
    w.store.apply(PizzaOrder::new(key(), spec("card"))).await;
    assert!(w.store.delete(&key()));
    let out = pass(&w).await;
    assert_eq!(out.verdict, None);
    assert_eq!(out.requeue, Requeue::None);
}

#[tokio::test]
async fn hung_provider_times_out_as_transient() {
    struct Hung;

    #[async_trait]
    impl FulfillmentClient for Hung {
        async fn locate_store(&self, _: &Address) -> Result<StoreRef, FulfillError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(FulfillError::Unavailable("unreachable".into()))
        }
        async fn price(&self, _: &ExternalOrder) -> Result<Money, FulfillError> { Ok(Money::ZERO) }
        async fn place(&self, _: &ExternalOrder) -> Result<String, FulfillError> { Ok("x".into()) }
        async fn track(&self, _: &str, _: &str) -> Result<TrackerSnapshot, FulfillError> { Ok(TrackerSnapshot::default()) }
    }

    let store = Arc::new(MemStore::new());
    store.apply(PizzaOrder::new(key(), spec("card"))).await;
    let cfg = ReconcileConfig { call_timeout: Some(Duration::from_millis(20)), ..Default::default() };
    let rec = Reconciler::new(store.clone(), store.clone(), Arc::new(Hung), cfg);
    let out = rec.reconcile(&key(), &CancellationToken::new()).await.unwrap();
    assert_eq!(out.requeue, Requeue::After(RETRY));
    assert!(!store.peek(&key()).unwrap().status.placed);

    let token = CancellationToken::new();
    token.cancel();
    let err = rec.reconcile(&key(), &token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

/// Provider whose store lookup and tracking never answer on their own.
struct Stalled;

#[async_trait]
impl FulfillmentClient for Stalled {
    async fn locate_store(&self, _: &Address) -> Result<StoreRef, FulfillError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(StoreRef::default())
    }
    async fn price(&self, _: &ExternalOrder) -> Result<Money, FulfillError> { Ok(Money::ZERO) }
    async fn place(&self, _: &ExternalOrder) -> Result<String, FulfillError> { Ok("x".into()) }
    async fn track(&self, _: &str, _: &str) -> Result<TrackerSnapshot, FulfillError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TrackerSnapshot::default())
    }
}

async fn cancel_mid_pass(o: PizzaOrder) -> (Result<Outcome, ReconcileError>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    store.apply(o).await;
    let rec = Reconciler::new(store.clone(), store.clone(), Arc::new(Stalled), ReconcileConfig::default());
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let res = tokio::time::timeout(Duration::from_secs(5), rec.reconcile(&key(), &token)).await.expect("pass ignored cancellation");
    (res, store)
}

#[tokio::test]
async fn cancelled_tracking_poll_is_an_error() {
    let mut o = PizzaOrder::new(key(), spec("card"));
    o.status = OrderStatus { placed: true, order_id: "ORD-1".into(), ..Default::default() };
    let (res, store) = cancel_mid_pass(o).await;
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(store.status_writes(), 0);
}

#[tokio::test]
async fn cancelled_placement_is_an_error() {
    let (res, store) = cancel_mid_pass(PizzaOrder::new(key(), spec("card"))).await;
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(!store.peek(&key()).unwrap().status.placed);
}
