//! Signs service events and publishes them to the durable relay set or an
//! explicit set of third-party relays.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    event::{Event, Keys},
    relay::{RelayHandle, RelaySet},
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to sign event: {0}")]
    Sign(String),
    #[error("no durable relay reachable")]
    NoRelays,
    #[error("no durable relay accepted event {0}")]
    Rejected(String),
}

/// Relays the service owns and publishes its ledger events to.
#[async_trait]
pub trait DurableRelays: Send + Sync {
    async fn handles(&self) -> Vec<Arc<dyn RelayHandle>>;
    fn urls(&self) -> Vec<String>;
}

#[async_trait]
impl DurableRelays for RelaySet {
    async fn handles(&self) -> Vec<Arc<dyn RelayHandle>> {
        RelaySet::handles(self).await
    }

    fn urls(&self) -> Vec<String> {
        RelaySet::urls(self).to_vec()
    }
}

/// Outcome of a fan-out to an explicit relay set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub accepted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct Outbox {
    keys: Keys,
    durable: Arc<dyn DurableRelays>,
}

impl Outbox {
    pub fn new(keys: Keys, durable: Arc<dyn DurableRelays>) -> Self {
        Self { keys, durable }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// URLs of the durable set.
    pub fn durable_urls(&self) -> Vec<String> {
        self.durable.urls()
    }

    /// Sign `event` with the service identity unless it already carries a
    /// signature.
    pub fn sign(&self, event: Event) -> Result<Event, PublishError> {
        if event.is_signed() {
            return Ok(event);
        }
        self.keys
            .sign(event)
            .map_err(|e| PublishError::Sign(e.to_string()))
    }

    /// Publish to the durable set. Succeeds when at least one durable relay
    /// accepts; returns the signed event.
    pub async fn publish(&self, event: Event) -> Result<Event, PublishError> {
        let event = self.sign(event)?;
        let relays = self.durable.handles().await;
        if relays.is_empty() {
            return Err(PublishError::NoRelays);
        }
        let report = fan_out(&event, &relays).await;
        if report.accepted.is_empty() {
            return Err(PublishError::Rejected(event.id));
        }
        info!(id = %event.id, kind = event.kind, relays = report.accepted.len(), "published");
        Ok(event)
    }

    /// Publish to an explicit relay set. Failures are logged and reported,
    /// never fatal.
    pub async fn publish_to(&self, event: Event, relays: &[Arc<dyn RelayHandle>]) -> PublishReport {
        let event = match self.sign(event) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "cannot publish unsigned event");
                return PublishReport::default();
            }
        };
        let report = fan_out(&event, relays).await;
        debug!(
            id = %event.id,
            accepted = report.accepted.len(),
            failed = report.failed.len(),
            "fan-out finished"
        );
        report
    }
}

async fn fan_out(event: &Event, relays: &[Arc<dyn RelayHandle>]) -> PublishReport {
    let results = join_all(relays.iter().map(|r| r.publish(event))).await;
    let mut report = PublishReport {
        event_id: event.id.clone(),
        ..PublishReport::default()
    };
    for (relay, res) in relays.iter().zip(results) {
        match res {
            Ok(()) => report.accepted.push(relay.url().to_string()),
            Err(e) => {
                warn!(relay = relay.url(), id = %event.id, error = %e, "publish failed");
                report.failed.push((relay.url().to_string(), e.to_string()));
            }
        }
    }
    report
}
