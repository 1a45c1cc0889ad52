//! Crust store: the narrow store-client interface the reconciler depends on,
//! an in-RAM implementation with a change feed, and the per-key coalescing queue.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use async_trait::async_trait;
use crust_core::{ErrorKind, ObjectKey, OrderStatus, PizzaOrder, Version, Versioned};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed object {key}: {reason}")]
    Malformed { key: ObjectKey, reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable(_) => ErrorKind::Transient,
            StoreError::Malformed { .. } => ErrorKind::Format,
        }
    }
}

/// Result of a conditional status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusWrite {
    Updated(Version),
    /// The version token no longer matches; someone else wrote first.
    Conflict,
    /// The object disappeared between fetch and write.
    Missing,
}

/// Get-by-key plus conditional status update over versioned orders.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Versioned<PizzaOrder>>, StoreError>;
    async fn update_status(&self, key: &ObjectKey, version: &Version, status: &OrderStatus) -> Result<StatusWrite, StoreError>;
}

/// Raw secret payload (already base64-decoded).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretData(pub BTreeMap<String, Vec<u8>>);

impl SecretData {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect())
    }

    /// Value of `key` as text, byte for byte. Absent keys yield an empty string;
    /// values that are not UTF-8 are an error rather than being patched up.
    pub fn text(&self, key: &str) -> Result<String, std::str::Utf8Error> {
        match self.0.get(key) {
            Some(b) => std::str::from_utf8(b).map(str::to_string),
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError>;
}

struct Stored {
    order: PizzaOrder,
    rv: u64,
}

#[derive(Default)]
struct Inner {
    orders: FxHashMap<ObjectKey, Stored>,
    secrets: FxHashMap<(String, String), SecretData>,
    next_rv: u64,
    conflicts_pending: u32,
    status_writes: u64,
    secret_reads: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_rv += 1;
        self.next_rv
    }
}

/// In-RAM store with Kubernetes-like semantics: every accepted write bumps the
/// version and emits the key on the change feed; identical status writes are no-ops.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
    feed: Option<mpsc::Sender<ObjectKey>>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// Store that announces every accepted write on `feed`.
    pub fn with_feed(feed: mpsc::Sender<ObjectKey>) -> Self {
        Self { inner: Mutex::new(Inner::default()), feed: Some(feed) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn notify(&self, key: ObjectKey) {
        if let Some(tx) = &self.feed {
            if tx.send(key).await.is_err() {
                debug!("change feed closed; notification dropped");
            }
        }
    }

    /// Create or replace an order (spec and status as given). Returns the new version.
    pub async fn apply(&self, order: PizzaOrder) -> Version {
        let key = order.key.clone();
        let rv = {
            let mut g = self.lock();
            let rv = g.bump();
            g.orders.insert(key.clone(), Stored { order, rv });
            rv
        };
        self.notify(key).await;
        Version(rv.to_string())
    }

    pub fn delete(&self, key: &ObjectKey) -> bool { self.lock().orders.remove(key).is_some() }

    pub fn put_secret(&self, namespace: &str, name: &str, data: SecretData) {
        self.lock().secrets.insert((namespace.to_string(), name.to_string()), data);
    }

    /// Current snapshot without touching call counters.
    pub fn peek(&self, key: &ObjectKey) -> Option<PizzaOrder> { self.lock().orders.get(key).map(|s| s.order.clone()) }

    /// Make the next `n` status writes fail with a version conflict.
    pub fn inject_conflicts(&self, n: u32) { self.lock().conflicts_pending = n; }

    /// Accepted (non no-op) status writes so far.
    pub fn status_writes(&self) -> u64 { self.lock().status_writes }

    pub fn secret_reads(&self) -> u64 { self.lock().secret_reads }
}

#[async_trait]
impl OrderStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Versioned<PizzaOrder>>, StoreError> {
        let g = self.lock();
        Ok(g.orders.get(key).map(|s| Versioned { value: s.order.clone(), version: Version(s.rv.to_string()) }))
    }

    async fn update_status(&self, key: &ObjectKey, version: &Version, status: &OrderStatus) -> Result<StatusWrite, StoreError> {
        let res = {
            let mut g = self.lock();
            if g.conflicts_pending > 0 {
                g.conflicts_pending -= 1;
                return Ok(StatusWrite::Conflict);
            }
            let next = g.next_rv + 1;
            match g.orders.get_mut(key) {
                None => return Ok(StatusWrite::Missing),
                Some(s) if s.rv.to_string() != version.as_str() => return Ok(StatusWrite::Conflict),
                Some(s) if &s.order.status == status => return Ok(StatusWrite::Updated(Version(s.rv.to_string()))),
                Some(s) => {
                    s.order.status = status.clone();
                    s.rv = next;
                }
            }
            g.next_rv = next;
            g.status_writes += 1;
            StatusWrite::Updated(Version(next.to_string()))
        };
        self.notify(key.clone()).await;
        Ok(res)
    }
}

#[async_trait]
impl SecretStore for MemStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError> {
        let mut g = self.lock();
        g.secret_reads += 1;
        Ok(g.secrets.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}

/// Coalescing queue keyed by identity with FIFO order: a key waits at most once.
pub struct Coalescer<K> {
    queued: FxHashSet<K>,
    order: VecDeque<K>,
}

impl<K: Hash + Eq + Clone> Default for Coalescer<K> {
    fn default() -> Self { Self { queued: FxHashSet::default(), order: VecDeque::new() } }
}

impl<K: Hash + Eq + Clone> Coalescer<K> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn contains(&self, key: &K) -> bool { self.queued.contains(key) }

    /// Queue `key` unless it is already waiting. Returns true when newly queued.
    pub fn push(&mut self, key: K) -> bool {
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    /// Pop the first key accepted by `ready`, leaving the others in order.
    pub fn pop_where(&mut self, mut ready: impl FnMut(&K) -> bool) -> Option<K> {
        let idx = self.order.iter().position(|k| ready(k))?;
        let key = self.order.remove(idx)?;
        self.queued.remove(&key);
        Some(key)
    }

    pub fn drain_ready(&mut self) -> Vec<K> {
        self.queued.clear();
        self.order.drain(..).collect()
    }
}

/// Log-and-count helper for feeds whose receiver went away.
pub fn feed_closed(source: &str) {
    metrics::counter!("crust_feed_closed_total", 1u64);
    warn!(source, "change feed receiver dropped");
}
