//! Crust fulfill: the contract with the external order-fulfillment provider.
//!
//! Payload types mirror the provider's PascalCase JSON. The production HTTP binding is
//! not part of this crate; [`sim::SimProvider`] is an in-process implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use crust_core::{Address, ErrorKind, Money, Tracker};
use serde::{Deserialize, Serialize};

pub mod assemble;
pub mod sim;

pub use assemble::assemble_order;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalAddress {
    pub street: String,
    pub city: String,
    pub region: String,
    pub postal_code: String,
    #[serde(rename = "Type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Portion -> quantity, e.g. `{"1/1": "1"}` for a whole-pizza normal amount.
pub type OptionAmounts = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalProduct {
    pub code: String,
    pub qty: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, OptionAmounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentInstruction {
    #[serde(rename = "Type")]
    pub kind: String,
    /// Order price plus gratuity.
    pub amount: Money,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expiration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub postal_code: String,
    pub tip_amount: Money,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalOrder {
    pub address: ExternalAddress,
    pub customer: BTreeMap<String, String>,
    #[serde(rename = "StoreID")]
    pub store_id: String,
    pub products: Vec<ExternalProduct>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payments: Vec<PaymentInstruction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    pub id: String,
    /// Human-readable store address.
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub stages: Tracker,
    /// Terminal tracking status observed.
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FulfillError {
    #[error("no store in range: {0}")]
    NoStore(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("order unknown: {0}")]
    UnknownOrder(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl FulfillError {
    /// Every provider failure is retried the same way.
    pub fn kind(&self) -> ErrorKind { ErrorKind::Transient }
}

/// External provider operations. Each is a single call; no retries happen inside.
#[async_trait]
pub trait FulfillmentClient: Send + Sync {
    async fn locate_store(&self, address: &Address) -> Result<StoreRef, FulfillError>;
    async fn price(&self, order: &ExternalOrder) -> Result<Money, FulfillError>;
    /// Place an order that already carries its payment. Returns the provider's order id.
    async fn place(&self, order: &ExternalOrder) -> Result<String, FulfillError>;
    async fn track(&self, store_id: &str, order_id: &str) -> Result<TrackerSnapshot, FulfillError>;
}
