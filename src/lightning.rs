//! Payment backend boundary: invoice creation, paying, lookups and the
//! settlement stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
    Accepted,
}

impl InvoiceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "SETTLED" => Some(Self::Settled),
            "CANCELED" => Some(Self::Canceled),
            "ACCEPTED" => Some(Self::Accepted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Hex payment hash.
    pub payment_hash: String,
    pub payment_request: String,
    pub memo: String,
    pub amount_msat: u128,
    pub amount_paid_msat: u128,
    pub state: InvoiceState,
    /// Hex preimage, present once settled.
    pub preimage: Option<String>,
}

/// Result of a successful payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub payment_hash: String,
    pub preimage: String,
}

#[derive(Debug, Error)]
pub enum PayError {
    #[error("payment timed out")]
    Timeout,
    #[error("payment failed: {0}")]
    Failed(String),
    #[error("payment backend error: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for PayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PayError::Timeout
        } else {
            PayError::Backend(e.to_string())
        }
    }
}

#[async_trait]
pub trait PaymentBackend: Send + Sync {
    async fn generate_invoice(&self, amount_msat: u128, memo: &str) -> Result<Invoice, PayError>;
    /// Pay `payment_request`, resolving once the payment reached a final state.
    async fn pay_invoice(&self, payment_request: &str) -> Result<PaymentOutcome, PayError>;
    /// Outcome of an earlier successful payment of `payment_request`, if any.
    async fn lookup_payment(&self, payment_request: &str) -> Result<Option<PaymentOutcome>, PayError>;
    async fn get_invoice(&self, payment_hash: &str) -> Result<Invoice, PayError>;
    /// Stream of invoice updates; the channel closes when the backend stream
    /// ends.
    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<Invoice>, PayError>;
}
