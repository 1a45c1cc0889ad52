//! Crust kubehub: binds the store-client interface to a Kubernetes cluster.
//!
//! The PizzaOrder kind is addressed through an explicit [`TypeRegistry`] built once by the
//! caller; objects travel as `DynamicObject` and are converted into owned [`PizzaOrder`] snapshots.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use crust_core::{ObjectKey, OrderStatus, PizzaOrder, Version, Versioned};
use crust_store::{OrderStore, SecretData, SecretStore, StatusWrite, StoreError};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client, built from the default kubeconfig/in-cluster config on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    let _ = CLIENT.set(client.clone());
    Ok(client)
}

pub const DEFAULT_GROUP: &str = "pizza.bilalashraf.xyz";
pub const DEFAULT_VERSION: &str = "v1";
pub const DEFAULT_KIND: &str = "PizzaOrder";
pub const DEFAULT_PLURAL: &str = "pizzaorders";

/// Resource types the controller talks to. Constructed once at startup and passed down.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    pub order: ApiResource,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let gvk = GroupVersionKind::gvk(DEFAULT_GROUP, DEFAULT_VERSION, DEFAULT_KIND);
        Self { order: ApiResource::from_gvk_with_plural(&gvk, DEFAULT_PLURAL) }
    }
}

impl TypeRegistry {
    /// Registry for a custom GVK key ("group/v1/Kind"); plural defaults to lowercase kind + "s".
    pub fn from_gvk_key(key: &str, plural: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(key)?;
        let plural = plural.map(|s| s.to_string()).unwrap_or_else(|| format!("{}s", gvk.kind.to_ascii_lowercase()));
        Ok(Self { order: ApiResource::from_gvk_with_plural(&gvk, &plural) })
    }

    pub fn gvk_key(&self) -> String {
        if self.order.group.is_empty() {
            format!("{}/{}", self.order.version, self.order.kind)
        } else {
            format!("{}/{}/{}", self.order.group, self.order.version, self.order.kind)
        }
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Store client backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: TypeRegistry,
}

impl KubeStore {
    pub fn new(client: Client, registry: TypeRegistry) -> Self { Self { client, registry } }

    fn orders(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.registry.order)
    }
}

fn key_of(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), name))
}

fn order_from(key: &ObjectKey, obj: &DynamicObject) -> Result<Versioned<PizzaOrder>, StoreError> {
    let malformed = |reason: String| StoreError::Malformed { key: key.clone(), reason };
    let version = obj
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| malformed("missing metadata.resourceVersion".into()))?;
    let order = PizzaOrder::from_parts(key.clone(), obj.metadata.uid.clone(), &obj.data).map_err(|e| malformed(e.to_string()))?;
    Ok(Versioned { value: order, version: Version(version) })
}

/// Body for PUT .../status: identity plus the version token and the new status only.
fn status_body(ar: &ApiResource, key: &ObjectKey, version: &Version, status: &OrderStatus) -> Json {
    serde_json::json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": key.name,
            "namespace": key.namespace,
            "resourceVersion": version.as_str(),
        },
        "status": status,
    })
}

fn write_outcome(err: &kube::Error) -> Option<StatusWrite> {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Some(StatusWrite::Conflict),
        kube::Error::Api(ae) if ae.code == 404 => Some(StatusWrite::Missing),
        _ => None,
    }
}

fn secret_data(secret: &Secret) -> SecretData {
    let mut out = SecretData::default();
    if let Some(data) = &secret.data {
        for (k, v) in data {
            out.0.insert(k.clone(), v.0.clone());
        }
    }
    // stringData is write-only on real servers; honour it for objects built locally
    if let Some(data) = &secret.string_data {
        for (k, v) in data {
            out.0.entry(k.clone()).or_insert_with(|| v.as_bytes().to_vec());
        }
    }
    out
}

#[async_trait]
impl OrderStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Versioned<PizzaOrder>>, StoreError> {
        let obj = self
            .orders(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        obj.map(|o| order_from(key, &o)).transpose()
    }

    async fn update_status(&self, key: &ObjectKey, version: &Version, status: &OrderStatus) -> Result<StatusWrite, StoreError> {
        let body = status_body(&self.registry.order, key, version, status);
        let bytes = serde_json::to_vec(&body).map_err(|e| StoreError::Malformed { key: key.clone(), reason: e.to_string() })?;
        match self.orders(&key.namespace).replace_status(&key.name, &PostParams::default(), bytes).await {
            Ok(o) => Ok(StatusWrite::Updated(Version(o.metadata.resource_version.unwrap_or_default()))),
            Err(e) => match write_outcome(&e) {
                Some(outcome) => Ok(outcome),
                None => Err(StoreError::Unavailable(e.to_string())),
            },
        }
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(secret.as_ref().map(secret_data))
    }
}

/// Watch orders and forward the key of every applied or re-listed object into `tx`.
/// Deletions are not forwarded; the store owns cleanup. Watch errors are retried with
/// backoff; the feed only ends when the receiver goes away.
pub async fn start_feed(client: Client, registry: &TypeRegistry, namespace: Option<&str>, tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &registry.order),
        None => Api::all_with(client, &registry.order),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    info!(gvk = %registry.gvk_key(), ns = ?namespace, "order feed started");
    pump(stream, &tx).await;
    Ok(())
}

async fn pump<S>(stream: S, tx: &mpsc::Sender<ObjectKey>)
where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let objs = match item {
            Ok(Event::Applied(o)) => vec![o],
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                list
            }
            Ok(Event::Deleted(o)) => {
                debug!(name = ?o.metadata.name, "order deleted");
                continue;
            }
            Err(e) => {
                metrics::counter!("crust_feed_errors_total", 1u64);
                warn!(error = %e, "order watch error; retrying");
                continue;
            }
        };
        for o in objs.iter() {
            let Some(key) = key_of(o) else { continue };
            metrics::counter!("crust_feed_events_total", 1u64);
            if tx.send(key).await.is_err() {
                crust_store::feed_closed("kube-watch");
                return;
            }
        }
    }
    warn!("order feed stream ended");
}
