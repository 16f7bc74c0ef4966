//! Credits settled invoices to the ledger exactly once.
//!
//! The payment backend may deliver the same settlement several times. The
//! first delivery to move the settlement lease `a:<prHash>` from 0 to 1 owns
//! the settlement; the lease is given back on every early exit but kept after
//! a successful credit, where the handled marker makes re-entry a no-op. The
//! lease TTL clears it should the process die mid-way.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    event::{Event, KIND_ZAP_REQUEST},
    invoice::hash_payment_request,
    ledger::{inbound_tx, zap_receipt, zap_relays},
    lightning::{Invoice, InvoiceState, PaymentBackend},
    outbox::Outbox,
    pool::RelayPool,
    store::{acquire_lease, release_lease, CoordinationStore, HANDLED_FIELD},
    transaction::DEFAULT_LEASE_TTL,
};

/// Upper bound on third-party relays a zap receipt is sent to.
pub const DEFAULT_RECEIPT_FANOUT: usize = 5;
/// Id of the zap receipt published for an invoice.
const RECEIPT_FIELD: &str = "receipt";
/// Set once the ledger was credited; read by invoice status queries.
const PAID_FIELD: &str = "paid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Not a settlement.
    Ignored,
    /// Another delivery holds the lease.
    InProgress,
    /// No metadata: the invoice was not issued by this service.
    Unknown,
    AlreadyHandled,
    Credited {
        inbound_id: String,
        receipt_id: Option<String>,
    },
}

pub struct SettlementGuard {
    ledger: String,
    store: Arc<dyn CoordinationStore>,
    outbox: Arc<Outbox>,
    pool: Arc<RelayPool>,
    lease_ttl: Duration,
    fanout: usize,
}

impl SettlementGuard {
    pub fn new(
        ledger: String,
        store: Arc<dyn CoordinationStore>,
        outbox: Arc<Outbox>,
        pool: Arc<RelayPool>,
    ) -> Self {
        Self {
            ledger,
            store,
            outbox,
            pool,
            lease_ttl: DEFAULT_LEASE_TTL,
            fanout: DEFAULT_RECEIPT_FANOUT,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Consume the backend's invoice stream until it ends, settling each
    /// update in its own task.
    pub async fn run(self: Arc<Self>, backend: Arc<dyn PaymentBackend>) -> Result<()> {
        let mut updates = backend.subscribe_invoices().await?;
        info!("listening for settlements");
        while let Some(invoice) = updates.recv().await {
            let guard = self.clone();
            tokio::spawn(async move {
                match guard.settle(&invoice).await {
                    Ok(outcome) => debug!(hash = %invoice.payment_hash, ?outcome, "settlement processed"),
                    Err(e) => error!(hash = %invoice.payment_hash, error = %e, "settlement failed"),
                }
            });
        }
        warn!("invoice stream ended");
        Ok(())
    }

    pub async fn settle(&self, invoice: &Invoice) -> Result<SettlementOutcome> {
        if invoice.state != InvoiceState::Settled {
            return Ok(SettlementOutcome::Ignored);
        }
        let pr_hash = hash_payment_request(&invoice.payment_request);
        let store = self.store.as_ref();
        if !acquire_lease(store, &pr_hash, self.lease_ttl).await? {
            debug!(pr_hash, "settlement already in progress");
            return Ok(SettlementOutcome::InProgress);
        }
        let result = self.credit(&pr_hash, invoice).await;
        if !matches!(result, Ok(SettlementOutcome::Credited { .. })) {
            release_lease(store, &pr_hash).await?;
        }
        result
    }

    async fn credit(&self, pr_hash: &str, invoice: &Invoice) -> Result<SettlementOutcome> {
        let store = self.store.as_ref();
        let fields = store
            .hmget(pr_hash, &["pubkey", "zapRequest", "comment", HANDLED_FIELD, RECEIPT_FIELD])
            .await?;
        let [pubkey, zap_request, comment, handled, sent_receipt]: [Option<String>; 5] =
            fields.try_into().unwrap_or_default();

        let Some(pubkey) = pubkey else {
            info!(pr_hash, "invoice not generated by this service");
            return Ok(SettlementOutcome::Unknown);
        };
        if handled.as_deref() == Some("true") {
            debug!(pr_hash, "settlement already handled");
            return Ok(SettlementOutcome::AlreadyHandled);
        }

        let receipt_id = match (sent_receipt, zap_request) {
            (Some(id), _) => {
                debug!(pr_hash, receipt = %id, "zap receipt already sent");
                Some(id)
            }
            (None, Some(json)) => {
                let id = self.publish_zap_receipt(&json, invoice).await;
                if let Some(id) = &id {
                    store.hset(pr_hash, RECEIPT_FIELD, id).await?;
                }
                id
            }
            (None, None) => None,
        };

        let amount = if invoice.amount_paid_msat > 0 {
            invoice.amount_paid_msat
        } else {
            invoice.amount_msat
        };
        let inbound = self
            .outbox
            .publish(inbound_tx(&self.ledger, &pubkey, amount, comment.as_deref()))
            .await?;
        store.hset(pr_hash, HANDLED_FIELD, "true").await?;
        store.hset(pr_hash, PAID_FIELD, "true").await?;
        info!(pr_hash, inbound = %inbound.id, amount, "credited settlement");
        Ok(SettlementOutcome::Credited {
            inbound_id: inbound.id,
            receipt_id,
        })
    }

    /// Publish a zap receipt to the durable set and a sample of the relays
    /// listed in the zap request. Failures never block the credit; the id is
    /// returned once at least one relay took the receipt.
    async fn publish_zap_receipt(&self, zap_request_json: &str, invoice: &Invoice) -> Option<String> {
        let request: Event = match serde_json::from_str(zap_request_json) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "unreadable zap request");
                return None;
            }
        };
        if request.kind != KIND_ZAP_REQUEST {
            warn!(kind = request.kind, "zap request has the wrong kind");
            return None;
        }
        let receipt = match self.outbox.sign(zap_receipt(&request, zap_request_json, invoice)) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "cannot sign zap receipt");
                return None;
            }
        };
        let mut delivered = match self.outbox.publish(receipt.clone()).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "could not publish zap receipt to durable relays");
                false
            }
        };
        let targets = self.receipt_targets(&request);
        if !targets.is_empty() {
            let conns = self.pool.connections(&targets).await;
            let report = self.outbox.publish_to(receipt.clone(), &conns).await;
            debug!(
                receipt = %receipt.id,
                accepted = report.accepted.len(),
                "zap receipt fanned out"
            );
            delivered |= !report.accepted.is_empty();
        }
        delivered.then_some(receipt.id)
    }

    /// Up to `fanout` random relays from the zap request, skipping hosts of
    /// the durable set and unparsable URLs.
    fn receipt_targets(&self, request: &Event) -> Vec<String> {
        let durable_hosts: HashSet<String> = self
            .outbox
            .durable_urls()
            .iter()
            .filter_map(|u| Url::parse(u).ok()?.host_str().map(str::to_string))
            .collect();
        let mut relays: Vec<String> = zap_relays(request)
            .into_iter()
            .filter(|r| {
                Url::parse(r)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| !durable_hosts.contains(h)))
                    .unwrap_or(false)
            })
            .collect();
        relays.shuffle(&mut rand::thread_rng());
        relays.truncate(self.fanout);
        relays
    }
}

/// Issue an invoice crediting `pubkey` once settled, recording the fields
/// [`SettlementGuard`] reads back under the invoice's `prHash`.
pub async fn issue_invoice(
    backend: &dyn PaymentBackend,
    store: &dyn CoordinationStore,
    pubkey: &str,
    amount_msat: u128,
    comment: Option<&str>,
) -> Result<Invoice> {
    if pubkey.len() != 64 || !pubkey.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        bail!("pubkey must be 64 lowercase hex characters");
    }
    if amount_msat == 0 {
        bail!("amount must be positive");
    }
    let invoice = backend
        .generate_invoice(amount_msat, comment.unwrap_or_default())
        .await?;
    let pr_hash = hash_payment_request(&invoice.payment_request);
    store.hset(&pr_hash, "pubkey", pubkey).await?;
    if let Some(comment) = comment {
        store.hset(&pr_hash, "comment", comment).await?;
    }
    info!(pr_hash, amount_msat, "issued invoice");
    Ok(invoice)
}

/// Settlement view of one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceStatus {
    pub settled: bool,
    /// Hex preimage, only once settled.
    pub preimage: Option<String>,
    #[serde(rename = "pr")]
    pub payment_request: String,
}

/// An invoice counts as settled once the backend says so or the ledger was
/// already credited for it.
pub async fn invoice_status(
    backend: &dyn PaymentBackend,
    store: &dyn CoordinationStore,
    payment_hash: &str,
) -> Result<InvoiceStatus> {
    let invoice = backend.get_invoice(payment_hash).await?;
    let pr_hash = hash_payment_request(&invoice.payment_request);
    let paid = store.hget(&pr_hash, PAID_FIELD).await?.as_deref() == Some("true");
    let settled = paid || invoice.state == InvoiceState::Settled;
    Ok(InvoiceStatus {
        settled,
        preimage: invoice.preimage.filter(|_| settled),
        payment_request: invoice.payment_request,
    })
}
