//! Ephemeral connections to third-party relays, used to fan out zap receipts.
//!
//! Each URL owns a slot guarded by an async mutex, so probing, reuse and
//! eviction of one relay never interleave. A watcher task per connection
//! evicts it after `idle_ttl` without use, or as soon as the transport closes.
//! A slot with no connection is forgotten once its reachability verdict
//! expires, so the table only holds relays seen within `reachability_ttl`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::relay::{RelayConnection, RelayHandle};

pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REACHABILITY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// NIP-11 relay information document, reduced to the fields that decide
/// whether an anonymous publish can succeed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RelayInfo {
    #[serde(default)]
    pub limitation: Option<Limitation>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Limitation {
    #[serde(default)]
    pub min_pow_difficulty: Option<u32>,
    #[serde(default)]
    pub auth_required: Option<bool>,
    #[serde(default)]
    pub payment_required: Option<bool>,
    #[serde(default)]
    pub restricted_writes: Option<bool>,
}

impl RelayInfo {
    pub fn requires_authorization(&self) -> bool {
        let Some(l) = &self.limitation else {
            return false;
        };
        l.min_pow_difficulty.unwrap_or(0) > 0
            || l.auth_required.unwrap_or(false)
            || l.payment_required.unwrap_or(false)
            || l.restricted_writes.unwrap_or(false)
    }
}

/// Fetches a relay's information document.
#[async_trait]
pub trait InfoProbe: Send + Sync {
    async fn info(&self, url: &str) -> Result<RelayInfo>;
}

/// Opens relay connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayHandle>>;
}

/// NIP-11 probe over HTTP(S).
pub struct Nip11Probe {
    client: reqwest::Client,
}

impl Nip11Probe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Map a relay URL onto the HTTP(S) URL serving its information document.
fn info_url(relay: &str) -> Result<Url> {
    let mut url = Url::parse(relay)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(anyhow!("unsupported relay scheme {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot rewrite scheme of {relay}"))?;
    Ok(url)
}

#[async_trait]
impl InfoProbe for Nip11Probe {
    async fn info(&self, url: &str) -> Result<RelayInfo> {
        let resp = self
            .client
            .get(info_url(url)?)
            .header(reqwest::header::ACCEPT, "application/nostr+json")
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Connects over WebSocket, optionally through a SOCKS5 proxy.
pub struct WsConnector {
    tor_socks: Option<String>,
}

impl WsConnector {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self { tor_socks }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayHandle>> {
        let conn = RelayConnection::connect(url, self.tor_socks.as_deref()).await?;
        Ok(conn as Arc<dyn RelayHandle>)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub idle_ttl: Duration,
    pub reachability_ttl: Duration,
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_IDLE_TTL,
            reachability_ttl: DEFAULT_REACHABILITY_TTL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<dyn RelayHandle>>,
    /// Bumped for every new connection so stale watchers leave the slot alone.
    generation: u64,
    idle_deadline: Option<Instant>,
    /// Cached `requires_authorization` and when it was decided.
    reachability: Option<(bool, Instant)>,
    /// A reaper task is waiting to forget this slot.
    reaping: bool,
}

type SlotRef = Arc<tokio::sync::Mutex<Slot>>;
type SlotMap = Arc<Mutex<HashMap<String, SlotRef>>>;

pub struct RelayPool {
    probe: Arc<dyn InfoProbe>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: SlotMap,
}

impl RelayPool {
    pub fn new(probe: Arc<dyn InfoProbe>, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            probe,
            connector,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, url: &str) -> SlotRef {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(url.to_string()).or_default().clone()
    }

    /// Live connections to every usable relay among `urls`. Relays that
    /// require authorization or fail to connect are skipped.
    pub async fn connections(&self, urls: &[String]) -> Vec<Arc<dyn RelayHandle>> {
        join_all(urls.iter().map(|url| self.connection(url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn connection(&self, url: &str) -> Option<Arc<dyn RelayHandle>> {
        let slot_ref = self.slot(url);
        let mut slot = slot_ref.lock().await;
        let conn = self.checkout(url, &slot_ref, &mut slot).await;
        if slot.conn.is_none() && !slot.reaping {
            slot.reaping = true;
            tokio::spawn(reap(
                self.slots.clone(),
                url.to_string(),
                slot_ref.clone(),
                self.config.reachability_ttl,
            ));
        }
        conn
    }

    async fn checkout(&self, url: &str, slot_ref: &SlotRef, slot: &mut Slot) -> Option<Arc<dyn RelayHandle>> {
        if self.requires_authorization(url, slot).await {
            debug!(relay = url, "skipping relay that requires authorization");
            return None;
        }

        if let Some(conn) = slot.conn.clone().filter(|c| c.is_connected()) {
            slot.idle_deadline = Some(Instant::now() + self.config.idle_ttl);
            return Some(conn);
        }

        match self.connector.connect(url).await {
            Ok(conn) => {
                slot.generation += 1;
                slot.conn = Some(conn.clone());
                slot.idle_deadline = Some(Instant::now() + self.config.idle_ttl);
                tokio::spawn(watch_idle(
                    self.slots.clone(),
                    url.to_string(),
                    slot_ref.clone(),
                    conn.clone(),
                    slot.generation,
                    self.config.reachability_ttl,
                ));
                debug!(relay = url, "pooled new connection");
                Some(conn)
            }
            Err(e) => {
                slot.conn = None;
                warn!(relay = url, error = %e, "connect failed");
                None
            }
        }
    }

    /// Cached reachability classification, probing on a miss. Any probe
    /// failure counts as requiring authorization.
    async fn requires_authorization(&self, url: &str, slot: &mut Slot) -> bool {
        if let Some((blocked, at)) = slot.reachability {
            if at.elapsed() < self.config.reachability_ttl {
                return blocked;
            }
        }
        let blocked = match tokio::time::timeout(self.config.probe_timeout, self.probe.info(url)).await {
            Ok(Ok(info)) => info.requires_authorization(),
            Ok(Err(e)) => {
                debug!(relay = url, error = %e, "info probe failed");
                true
            }
            Err(_) => {
                debug!(relay = url, "info probe timed out");
                true
            }
        };
        slot.reachability = Some((blocked, Instant::now()));
        blocked
    }

    /// Number of pooled connections that are currently open.
    pub async fn live_count(&self) -> usize {
        let slots: Vec<_> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.values().cloned().collect()
        };
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.conn.as_ref().is_some_and(|c| c.is_connected()) {
                live += 1;
            }
        }
        live
    }
}

/// Evict `conn` from its slot once idle past its deadline or closed, then
/// reap the slot unless a reaper is already waiting on it.
async fn watch_idle(
    slots: SlotMap,
    url: String,
    slot_ref: SlotRef,
    conn: Arc<dyn RelayHandle>,
    generation: u64,
    reachability_ttl: Duration,
) {
    loop {
        let deadline = {
            let slot = slot_ref.lock().await;
            if slot.generation != generation {
                return;
            }
            match slot.idle_deadline {
                Some(d) => d,
                None => return,
            }
        };
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let mut slot = slot_ref.lock().await;
                if slot.generation != generation {
                    return;
                }
                if slot.idle_deadline.is_some_and(|d| Instant::now() < d) {
                    continue;
                }
                slot.conn = None;
                slot.idle_deadline = None;
                // Disconnect under the slot lock so a concurrent request waits
                // for the teardown and then opens a fresh connection.
                conn.disconnect().await;
                info!(relay = %url, "evicted idle relay connection");
                if slot.reaping {
                    return;
                }
                slot.reaping = true;
                break;
            }
            _ = conn.closed() => {
                let mut slot = slot_ref.lock().await;
                if slot.generation != generation {
                    return;
                }
                slot.conn = None;
                slot.idle_deadline = None;
                debug!(relay = %url, "relay connection closed");
                if slot.reaping {
                    return;
                }
                slot.reaping = true;
                break;
            }
        }
    }
    reap(slots, url, slot_ref, reachability_ttl).await;
}

/// Forget `url`'s slot once it holds no connection and its reachability
/// verdict has expired. Gives up while a connection is pooled; the watcher of
/// that connection reaps again after teardown.
async fn reap(slots: SlotMap, url: String, slot_ref: SlotRef, reachability_ttl: Duration) {
    loop {
        let wake = {
            let mut slot = slot_ref.lock().await;
            if slot.conn.is_some() {
                slot.reaping = false;
                return;
            }
            let reachability = slot.reachability;
            match reachability {
                Some((_, at)) if at.elapsed() < reachability_ttl => at + reachability_ttl,
                _ => {
                    if !forget(&slots, &url, &slot_ref) {
                        // A request holds the slot and reaps after itself.
                        slot.reaping = false;
                    }
                    return;
                }
            }
        };
        tokio::time::sleep_until(wake).await;
    }
}

/// Remove `slot_ref` from the table if nobody but the table and the caller
/// holds it. New holders go through the table lock, so the count is stable
/// while it is held.
fn forget(slots: &SlotMap, url: &str, slot_ref: &SlotRef) -> bool {
    let mut map = slots.lock().unwrap_or_else(|e| e.into_inner());
    let ours = map.get(url).is_some_and(|s| Arc::ptr_eq(s, slot_ref));
    if ours && Arc::strong_count(slot_ref) == 2 {
        map.remove(url);
        debug!(relay = url, "forgot relay");
        true
    } else {
        false
    }
}
