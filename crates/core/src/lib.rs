//! Crust core types: the PizzaOrder resource, object keys, version tokens and error kinds.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod money;

pub use money::{Money, MoneyParseError};

/// Namespace/name identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque optimistic-concurrency token (Kubernetes `resourceVersion`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(pub String);

impl Version {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A value read from the store together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pizza {
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub toppings: Vec<String>,
}

/// Local reference to a Secret in the order's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
}

/// Desired state. Written by the order author, never by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    pub place_order: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(default)]
    pub payment_secret: SecretRef,
    #[serde(default)]
    pub pizzas: Vec<Pizza>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
}

/// Per-stage RFC3339 timestamps reported by the provider's tracking feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bake: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_for_delivery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<String>,
}

impl Tracker {
    fn stages_mut(&mut self) -> [&mut Option<String>; 5] {
        [&mut self.prep, &mut self.bake, &mut self.quality_check, &mut self.out_for_delivery, &mut self.delivered]
    }

    fn stages(&self) -> [&Option<String>; 5] {
        [&self.prep, &self.bake, &self.quality_check, &self.out_for_delivery, &self.delivered]
    }

    /// Fill stages that are still empty from `other`. Stages already set are never
    /// overwritten or cleared. Returns true when anything changed.
    pub fn merge(&mut self, other: &Tracker) -> bool {
        let mut changed = false;
        for (mine, theirs) in self.stages_mut().into_iter().zip(other.stages()) {
            if mine.is_none() {
                if let Some(ts) = theirs.as_ref().filter(|s| !s.is_empty()) {
                    *mine = Some(ts.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn is_empty(&self) -> bool { self.stages().iter().all(|s| s.is_none()) }
}

/// Observed state. Owned by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    #[serde(rename = "orderID", default, skip_serializing_if = "String::is_empty")]
    pub order_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub price: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Tracker>,
}

/// The unit of reconciliation. An owned snapshot per invocation; nothing aliases it.
#[derive(Debug, Clone, PartialEq)]
pub struct PizzaOrder {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub spec: OrderSpec,
    pub status: OrderStatus,
}

impl PizzaOrder {
    pub fn new(key: ObjectKey, spec: OrderSpec) -> Self {
        Self { key, uid: None, spec, status: OrderStatus::default() }
    }

    /// Build from the `spec`/`status` halves of a raw JSON object.
    pub fn from_parts(key: ObjectKey, uid: Option<String>, raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let spec = serde_json::from_value(raw.get("spec").cloned().unwrap_or(serde_json::Value::Null))?;
        let status = match raw.get("status") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => OrderStatus::default(),
        };
        Ok(Self { key, uid, spec, status })
    }
}

/// Current wall-clock time in the format used by tracker stages.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Error classification shared by every crate in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Something referenced does not exist.
    NotFound,
    /// External call failed (network, provider-side, timeout).
    Transient,
    /// Missing or empty required reference.
    Configuration,
    /// Unparsable content in a status field or payload.
    Format,
    /// The invocation was cancelled mid-flight.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Format => "format",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub mod prelude {
    pub use super::{
        Address, Customer, ErrorKind, Money, ObjectKey, OrderSpec, OrderStatus, Pizza, PizzaOrder, SecretRef,
        StoreStatus, Tracker, Version, Versioned,
    };
}
