//! Static table of relay subscriptions and the loop that keeps them alive.
//!
//! Each read relay gets its own session task. A session resubscribes every
//! registered filter from its replay watermark, hands each event to its
//! handler in a separate task, and advances the watermark once the handler
//! succeeds. Dropped connections are retried after a pause.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    event::{Event, KIND_REGULAR},
    ledger::TX_OK,
    relay::{Filter, RelaySet, SubscriptionItem},
    replay::ReplayTracker,
};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Logical subscriptions; the name doubles as the watermark key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    InternalTransactionOk,
}

impl SubscriptionKey {
    pub const ALL: [SubscriptionKey; 1] = [SubscriptionKey::InternalTransactionOk];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKey::InternalTransactionOk => "internal-transaction-ok",
        }
    }
}

/// Acknowledgements addressed to the service.
pub fn ack_filter(service_pubkey: &str) -> Filter {
    Filter::default()
        .kinds([KIND_REGULAR])
        .tag("p", [service_pubkey])
        .tag("t", [TX_OK])
}

pub struct Registration {
    pub key: SubscriptionKey,
    /// Filter without the `since` bound, which is filled in per session.
    pub filter: Filter,
    pub handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<Arc<Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, key: SubscriptionKey, filter: Filter, handler: Arc<dyn EventHandler>) -> Self {
        self.entries.push(Arc::new(Registration {
            key,
            filter,
            handler,
        }));
        self
    }

    pub fn entries(&self) -> &[Arc<Registration>] {
        &self.entries
    }
}

pub struct SubscriptionRunner {
    relays: Arc<RelaySet>,
    tracker: Arc<ReplayTracker>,
    registry: Arc<Registry>,
    retry: Duration,
}

impl SubscriptionRunner {
    pub fn new(relays: Arc<RelaySet>, tracker: Arc<ReplayTracker>, registry: Registry) -> Self {
        Self {
            relays,
            tracker,
            registry: Arc::new(registry),
            retry: RETRY_DELAY,
        }
    }

    /// Run a session loop per read relay. Never returns under normal
    /// operation.
    pub async fn run(self: Arc<Self>) {
        let urls = self.relays.urls().to_vec();
        join_all(urls.into_iter().map(|url| {
            let runner = self.clone();
            async move { runner.relay_loop(url).await }
        }))
        .await;
    }

    async fn relay_loop(&self, url: String) {
        loop {
            match self.session(&url).await {
                Ok(()) => info!(relay = %url, "relay session ended"),
                Err(e) => warn!(relay = %url, error = %e, "relay session failed"),
            }
            tokio::time::sleep(self.retry).await;
        }
    }

    /// Subscribe every registration on `url` and pump events until the
    /// connection drops.
    async fn session(&self, url: &str) -> Result<()> {
        let conn = self.relays.connection(url).await?;
        let mut pumps = JoinSet::new();
        for reg in self.registry.entries() {
            let mut filter = reg.filter.clone();
            filter.since = self.tracker.resume_since(reg.key.as_str()).await?;
            let since = filter.since;
            let mut sub = conn.subscribe(reg.key.as_str(), filter)?;
            debug!(relay = url, key = reg.key.as_str(), sub = sub.id(), ?since, "subscribed");
            let reg = reg.clone();
            let tracker = self.tracker.clone();
            let relay = url.to_string();
            pumps.spawn(async move {
                while let Some(item) = sub.next().await {
                    match item {
                        SubscriptionItem::Event(ev) => dispatch(tracker.clone(), reg.clone(), ev),
                        SubscriptionItem::EndOfStored => {
                            debug!(relay = %relay, sub = sub.id(), "caught up")
                        }
                    }
                }
                debug!(relay = %relay, sub = sub.id(), "subscription closed");
            });
        }
        while pumps.join_next().await.is_some() {}
        Ok(())
    }
}

/// Handle one event in its own task; the watermark only moves on success.
fn dispatch(tracker: Arc<ReplayTracker>, reg: Arc<Registration>, ev: Event) {
    tokio::spawn(async move {
        let id = ev.id.clone();
        let created_at = ev.created_at;
        match reg.handler.handle(ev).await {
            Ok(()) => {
                if let Err(e) = tracker.mark_processed(reg.key.as_str(), created_at).await {
                    warn!(event = %id, error = %e, "failed to advance watermark");
                }
            }
            Err(e) => error!(event = %id, key = reg.key.as_str(), error = %e, "handler failed"),
        }
    });
}
