//! Payment resolution: referenced card secret + recorded price -> payment instruction.

use std::sync::Arc;
use std::time::Duration;

use crust_core::{ErrorKind, Money, MoneyParseError, PizzaOrder};
use crust_fulfill::PaymentInstruction;
use crust_store::{SecretStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::guard::{guarded, Interrupt};

pub const PAYMENT_TYPE: &str = "CreditCard";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("payment secret name is empty")]
    MissingSecretRef,
    #[error("payment secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("status.price is not a decimal amount: {0}")]
    BadPrice(#[source] MoneyParseError),
    #[error("payment amount overflows")]
    Overflow,
    #[error("payment secret field {0} is not valid UTF-8")]
    BadSecretValue(&'static str),
    #[error("reading payment secret: {0}")]
    Store(#[from] StoreError),
    #[error("reading payment secret: {0}")]
    Interrupted(#[from] Interrupt),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::MissingSecretRef => ErrorKind::Configuration,
            ResolveError::SecretNotFound { .. } => ErrorKind::NotFound,
            ResolveError::BadPrice(_) | ResolveError::Overflow | ResolveError::BadSecretValue(_) => ErrorKind::Format,
            ResolveError::Store(e) => e.kind(),
            ResolveError::Interrupted(Interrupt::Cancelled) => ErrorKind::Cancelled,
            ResolveError::Interrupted(Interrupt::TimedOut(_)) => ErrorKind::Transient,
        }
    }
}

pub struct PaymentResolver {
    secrets: Arc<dyn SecretStore>,
    gratuity: Money,
    call_timeout: Option<Duration>,
}

impl PaymentResolver {
    pub fn new(secrets: Arc<dyn SecretStore>, gratuity: Money, call_timeout: Option<Duration>) -> Self {
        Self { secrets, gratuity, call_timeout }
    }

    /// Card fields are copied verbatim; missing keys become empty strings and are left
    /// for the provider to reject.
    pub async fn resolve(&self, order: &PizzaOrder, cancel: &CancellationToken) -> Result<PaymentInstruction, ResolveError> {
        let name = order.spec.payment_secret.name.as_str();
        if name.is_empty() {
            return Err(ResolveError::MissingSecretRef);
        }
        let namespace = order.key.namespace.as_str();
        let secret = guarded(cancel, self.call_timeout, self.secrets.get_secret(namespace, name))
            .await??
            .ok_or_else(|| ResolveError::SecretNotFound { namespace: namespace.to_string(), name: name.to_string() })?;

        let price = if order.status.price.trim().is_empty() {
            Money::ZERO
        } else {
            order.status.price.parse::<Money>().map_err(ResolveError::BadPrice)?
        };
        let amount = price.checked_add(self.gratuity).ok_or(ResolveError::Overflow)?;
        debug!(key = %order.key, %price, %amount, "payment resolved");

        let field = |k: &'static str| secret.text(k).map_err(|_| ResolveError::BadSecretValue(k));
        Ok(PaymentInstruction {
            kind: PAYMENT_TYPE.to_string(),
            amount,
            number: field("Number")?,
            expiration: field("Expiration")?,
            security_code: field("SecurityCode")?,
            postal_code: field("PostalCode")?,
            tip_amount: self.gratuity,
        })
    }
}
