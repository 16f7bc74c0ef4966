//! Turns `internal-transaction-ok` acknowledgements into outbound Lightning
//! payments, or into reversals when the payment cannot be made.
//!
//! Every acknowledgement is decided exactly once. The decision is recorded by
//! the handled marker under the acknowledgement id; while it is being made the
//! acknowledgement lease `a:<ackId>` keeps concurrent deliveries out.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::{
    event::{Event, Keys},
    invoice::amount_msat,
    ledger::{outbound_tx, revert_tx, start_amount},
    lightning::{PayError, PaymentBackend, PaymentOutcome},
    nip04,
    outbox::Outbox,
    relay::EventFetcher,
    store::{acquire_lease, is_handled, mark_handled, release_lease, CoordinationStore},
    subscriptions::EventHandler,
};

pub const DEFAULT_PAY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    MissingTarget,
    MissingParent,
    SelfOriginated,
    StartNotFound,
    /// Declared or invoiced amount cannot be read.
    UnreadableAmount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    MissingInvoice,
    AmountMismatch,
    PaymentFailed(String),
}

/// How an acknowledgement was decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Already decided, or being decided by another task.
    Duplicate,
    Discarded(DiscardReason),
    Completed { outbound_id: String },
    Reverted { reversal_id: String, reason: RevertReason },
}

pub struct TransactionMachine {
    keys: Keys,
    ledger: String,
    store: Arc<dyn CoordinationStore>,
    fetcher: Arc<dyn EventFetcher>,
    backend: Arc<dyn PaymentBackend>,
    outbox: Arc<Outbox>,
    pay_timeout: Duration,
    lease_ttl: Duration,
}

impl TransactionMachine {
    pub fn new(
        ledger: String,
        store: Arc<dyn CoordinationStore>,
        fetcher: Arc<dyn EventFetcher>,
        backend: Arc<dyn PaymentBackend>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            keys: outbox.keys().clone(),
            ledger,
            store,
            fetcher,
            backend,
            outbox,
            pay_timeout: DEFAULT_PAY_TIMEOUT,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_pay_timeout(mut self, timeout: Duration) -> Self {
        self.pay_timeout = timeout;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Decide the fate of one acknowledgement.
    ///
    /// Store, relay and publish failures are returned as errors and leave the
    /// acknowledgement undecided so a later delivery can retry it.
    pub async fn handle(&self, ack: &Event) -> Result<Outcome> {
        let store = self.store.as_ref();
        if is_handled(store, &ack.id).await? {
            debug!(ack = %ack.id, "already handled");
            return Ok(Outcome::Duplicate);
        }
        if !acquire_lease(store, &ack.id, self.lease_ttl).await? {
            debug!(ack = %ack.id, "acknowledgement in progress elsewhere");
            return Ok(Outcome::Duplicate);
        }
        // The previous holder may have finished between the check and the lease.
        let result = match is_handled(store, &ack.id).await {
            Ok(true) => Ok(Outcome::Duplicate),
            Ok(false) => self.decide(ack).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = release_lease(store, &ack.id).await {
            error!(ack = %ack.id, error = %e, outcome = ?result.as_ref().ok(), "failed to release ack lease");
        }
        result
    }

    async fn decide(&self, ack: &Event) -> Result<Outcome> {
        let Some(target) = ack.nth_tag("p", 1) else {
            warn!(ack = %ack.id, "no target found");
            return self.discard(ack, DiscardReason::MissingTarget).await;
        };
        let Some(start_id) = ack.first_tag("e") else {
            warn!(ack = %ack.id, "no starting event found");
            return self.discard(ack, DiscardReason::MissingParent).await;
        };
        if target == self.keys.public_hex() {
            debug!(ack = %ack.id, "originated by this service");
            return self.discard(ack, DiscardReason::SelfOriginated).await;
        }

        let Some(start) = self.fetcher.fetch_event(start_id).await? else {
            warn!(ack = %ack.id, start = start_id, "start event not found");
            return self.discard(ack, DiscardReason::StartNotFound).await;
        };

        let Some(declared) = start_amount(&start.content) else {
            warn!(start = %start.id, "start amount unreadable");
            return self.discard(ack, DiscardReason::UnreadableAmount).await;
        };
        let Some(bolt11) = start.first_tag("bolt11") else {
            warn!(start = %start.id, "transaction without invoice");
            return self.revert(ack, &start, RevertReason::MissingInvoice).await;
        };
        let invoiced = match amount_msat(bolt11) {
            Ok(msat) => msat,
            Err(e) => {
                warn!(start = %start.id, error = %e, "invoice amount unreadable");
                return self.discard(ack, DiscardReason::UnreadableAmount).await;
            }
        };
        if declared != invoiced {
            warn!(start = %start.id, declared, invoiced, "content and invoice amounts differ");
            return self.revert(ack, &start, RevertReason::AmountMismatch).await;
        }

        match self.pay(bolt11).await {
            Ok(paid) => {
                info!(start = %start.id, hash = %paid.payment_hash, "paid invoice");
                let preimage = nip04::encrypt(self.keys.secret(), target, &paid.preimage)?;
                let outbound = self
                    .outbox
                    .publish(outbound_tx(&self.ledger, &start, preimage))
                    .await?;
                mark_handled(self.store.as_ref(), &ack.id).await?;
                Ok(Outcome::Completed {
                    outbound_id: outbound.id,
                })
            }
            Err(e) => {
                warn!(start = %start.id, error = %e, "failed paying invoice, reverting");
                self.revert(ack, &start, RevertReason::PaymentFailed(e.to_string()))
                    .await
            }
        }
    }

    /// Pay `bolt11` unless an earlier attempt already succeeded.
    async fn pay(&self, bolt11: &str) -> Result<PaymentOutcome, PayError> {
        match tokio::time::timeout(self.pay_timeout, self.backend.lookup_payment(bolt11)).await {
            Ok(Ok(Some(previous))) => {
                info!(hash = %previous.payment_hash, "invoice already paid, reusing preimage");
                return Ok(previous);
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!(error = %e, "payment lookup failed"),
            Err(_) => warn!(bolt11, "payment lookup timed out"),
        }
        tokio::time::timeout(self.pay_timeout, self.backend.pay_invoice(bolt11))
            .await
            .map_err(|_| PayError::Timeout)?
    }

    async fn discard(&self, ack: &Event, reason: DiscardReason) -> Result<Outcome> {
        mark_handled(self.store.as_ref(), &ack.id).await?;
        Ok(Outcome::Discarded(reason))
    }

    async fn revert(&self, ack: &Event, start: &Event, reason: RevertReason) -> Result<Outcome> {
        let reversal = self.outbox.publish(revert_tx(&self.ledger, start)).await?;
        mark_handled(self.store.as_ref(), &ack.id).await?;
        info!(start = %start.id, reversal = %reversal.id, ?reason, "reverted transaction");
        Ok(Outcome::Reverted {
            reversal_id: reversal.id,
            reason,
        })
    }
}

#[async_trait]
impl EventHandler for TransactionMachine {
    async fn handle(&self, event: Event) -> Result<()> {
        let outcome = TransactionMachine::handle(self, &event).await?;
        debug!(ack = %event.id, ?outcome, "acknowledgement decided");
        Ok(())
    }
}
