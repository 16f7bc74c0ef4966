//! NIP-01 relay client: long-lived subscriptions, one-shot fetches and
//! publishing with `OK` acknowledgements.
//!
//! Each [`RelayConnection`] owns its WebSocket inside a background task; the
//! handle talks to it over a command channel so subscriptions, fetches and
//! publishes can be issued concurrently from any task.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot, watch, Mutex},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::event::{verify_event, Event};

/// How long a publish waits for the relay's `OK`.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a fetch waits for the stored event before giving up.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription filter sent with `REQ`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag filters keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u32>,
}

impl Filter {
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Convert into the JSON object carried by a `REQ` message.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let strings = |v: &[String]| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = self.ids.as_deref().filter(|v| !v.is_empty()) {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = self.authors.as_deref().filter(|v| !v.is_empty()) {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = self.kinds.as_deref().filter(|v| !v.is_empty()) {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let key = if tag.starts_with('#') {
                tag.clone()
            } else {
                format!("#{tag}")
            };
            map.insert(key, strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }
}

/// Items delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(Event),
    /// The relay finished sending stored events; live events follow.
    EndOfStored,
}

/// Connection surface used by the outbox and the relay pool.
#[async_trait]
pub trait RelayHandle: Send + Sync {
    fn url(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// Submit an event and wait for the relay to accept it.
    async fn publish(&self, event: &Event) -> Result<()>;
    async fn disconnect(&self);
    /// Resolve once the underlying transport is gone.
    async fn closed(&self);
}

/// Source of previously published events.
#[async_trait]
pub trait EventFetcher: Send + Sync {
    async fn fetch_event(&self, id: &str) -> Result<Option<Event>>;
}

enum Command {
    Subscribe {
        id: String,
        filter: Filter,
        items: mpsc::UnboundedSender<SubscriptionItem>,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        event: Event,
        ack: oneshot::Sender<Result<(), String>>,
    },
    Disconnect,
}

/// Handle to a live relay connection.
pub struct RelayConnection {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
    next_sub: AtomicU64,
}

/// Live subscription; dropping it sends `CLOSE` to the relay.
pub struct Subscription {
    id: String,
    items: mpsc::UnboundedReceiver<SubscriptionItem>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next item, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.items.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe {
            id: self.id.clone(),
        });
    }
}

impl RelayConnection {
    /// Open a WebSocket to `url`, optionally through a SOCKS5 proxy.
    /// `wss` relays are verified against the bundled web PKI roots.
    pub async fn connect(url: &str, tor_socks: Option<&str>) -> Result<Arc<Self>> {
        Self::connect_with(url, tor_socks, None).await
    }

    /// Like [`RelayConnection::connect`] with an explicit TLS connector.
    pub async fn connect_with(
        url: &str,
        tor_socks: Option<&str>,
        tls: Option<Connector>,
    ) -> Result<Arc<Self>> {
        let ws = connect_ws(url, tor_socks, tls).await?;
        let (commands, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(run_connection(url.to_string(), ws, rx, closed_tx));
        debug!(relay = url, "connected");
        Ok(Arc::new(Self {
            url: url.to_string(),
            commands,
            closed,
            next_sub: AtomicU64::new(0),
        }))
    }

    /// Issue `REQ` with `filter`. The subscription keeps delivering live
    /// events after [`SubscriptionItem::EndOfStored`].
    pub fn subscribe(&self, prefix: &str, filter: Filter) -> Result<Subscription> {
        let n = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let id = format!("{prefix}-{n}");
        let (items, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Subscribe {
                id: id.clone(),
                filter,
                items,
            })
            .map_err(|_| anyhow!("relay {} connection closed", self.url))?;
        Ok(Subscription {
            id,
            items: rx,
            commands: self.commands.clone(),
        })
    }

    /// Fetch a single event by id; `None` when the relay reports end of stored
    /// events without it.
    pub async fn fetch(&self, id: &str, wait: Duration) -> Result<Option<Event>> {
        let filter = Filter {
            ids: Some(vec![id.to_string()]),
            limit: Some(1),
            ..Filter::default()
        };
        let mut sub = self.subscribe("fetch", filter)?;
        let found = tokio::time::timeout(wait, async {
            while let Some(item) = sub.next().await {
                match item {
                    SubscriptionItem::Event(ev) if ev.id == id => return Some(ev),
                    SubscriptionItem::Event(_) => {}
                    SubscriptionItem::EndOfStored => return None,
                }
            }
            None
        })
        .await
        .map_err(|_| anyhow!("fetch from {} timed out", self.url))?;
        Ok(found)
    }
}

#[async_trait]
impl RelayHandle for RelayConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                event: event.clone(),
                ack,
            })
            .map_err(|_| anyhow!("relay {} connection closed", self.url))?;
        match tokio::time::timeout(PUBLISH_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => bail!("relay {} rejected event: {reason}", self.url),
            Ok(Err(_)) => bail!("relay {} connection closed", self.url),
            Err(_) => bail!("relay {} did not acknowledge in time", self.url),
        }
    }

    async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
        self.closed().await;
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

async fn run_connection(
    url: String,
    mut ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    closed: watch::Sender<bool>,
) {
    let mut subs: HashMap<String, mpsc::UnboundedSender<SubscriptionItem>> = HashMap::new();
    let mut pending: HashMap<String, oneshot::Sender<Result<(), String>>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Subscribe { id, filter, items }) => {
                    let req = json!(["REQ", id, Value::Object(filter.to_json())]);
                    if let Err(e) = ws.send(Message::Text(req.to_string())).await {
                        warn!(relay = %url, error = %e, "subscribe failed");
                        break;
                    }
                    subs.insert(id, items);
                }
                Some(Command::Unsubscribe { id }) => {
                    if subs.remove(&id).is_some() {
                        let close = json!(["CLOSE", id]);
                        if ws.send(Message::Text(close.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Command::Publish { event, ack }) => {
                    let msg = json!(["EVENT", event]);
                    match ws.send(Message::Text(msg.to_string())).await {
                        Ok(()) => {
                            pending.insert(event.id, ack);
                        }
                        Err(e) => {
                            let _ = ack.send(Err(e.to_string()));
                            break;
                        }
                    }
                }
                Some(Command::Disconnect) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(txt))) => dispatch(&url, &txt, &mut subs, &mut pending),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(relay = %url, error = %e, "transport error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    for (_, ack) in pending.drain() {
        let _ = ack.send(Err("connection closed".into()));
    }
    let _ = closed.send(true);
    debug!(relay = %url, "connection closed");
}

/// Route one relay message to its subscription or pending publish.
fn dispatch(
    url: &str,
    txt: &str,
    subs: &mut HashMap<String, mpsc::UnboundedSender<SubscriptionItem>>,
    pending: &mut HashMap<String, oneshot::Sender<Result<(), String>>>,
) {
    let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) else {
        return;
    };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") if arr.len() >= 3 => {
            let Some(sub) = arr[1].as_str() else { return };
            let ev = match serde_json::from_value::<Event>(arr[2].clone()) {
                Ok(ev) => ev,
                Err(e) => {
                    debug!(relay = url, error = %e, "unparsable event");
                    return;
                }
            };
            if let Err(e) = verify_event(&ev) {
                warn!(relay = url, id = %ev.id, error = %e, "dropping event with bad signature");
                return;
            }
            let gone = subs
                .get(sub)
                .is_some_and(|tx| tx.send(SubscriptionItem::Event(ev)).is_err());
            if gone {
                subs.remove(sub);
            }
        }
        Some("EOSE") => {
            if let Some(tx) = arr.get(1).and_then(Value::as_str).and_then(|s| subs.get(s)) {
                let _ = tx.send(SubscriptionItem::EndOfStored);
            }
        }
        Some("OK") if arr.len() >= 3 => {
            let id = arr[1].as_str().unwrap_or_default();
            let accepted = arr[2].as_bool().unwrap_or(false);
            let reason = arr.get(3).and_then(Value::as_str).unwrap_or_default();
            if let Some(ack) = pending.remove(id) {
                let _ = ack.send(if accepted {
                    Ok(())
                } else {
                    Err(reason.to_string())
                });
            }
        }
        Some("CLOSED") => {
            if let Some(sub) = arr.get(1).and_then(Value::as_str) {
                let reason = arr.get(2).and_then(Value::as_str).unwrap_or_default();
                warn!(relay = url, sub, reason, "subscription closed by relay");
                subs.remove(sub);
            }
        }
        Some("NOTICE") => {
            let notice = arr.get(1).and_then(Value::as_str).unwrap_or_default();
            warn!(relay = url, notice, "relay notice");
        }
        _ => {}
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. TLS is
/// layered over the proxied or direct stream for `wss` URLs.
async fn connect_ws(relay: &str, tor_socks: Option<&str>, tls: Option<Connector>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls_with_config(req, stream, None, tls).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Fixed set of relays the service owns (read set or durable write set),
/// reconnected lazily when a connection drops.
pub struct RelaySet {
    urls: Vec<String>,
    tor_socks: Option<String>,
    live: Mutex<HashMap<String, Arc<RelayConnection>>>,
}

impl RelaySet {
    pub fn new(urls: Vec<String>, tor_socks: Option<String>) -> Self {
        Self {
            urls,
            tor_socks,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Live connection to `url`, reconnecting if the previous one dropped.
    pub async fn connection(&self, url: &str) -> Result<Arc<RelayConnection>> {
        let mut live = self.live.lock().await;
        if let Some(conn) = live.get(url).filter(|c| c.is_connected()) {
            return Ok(conn.clone());
        }
        let conn = RelayConnection::connect(url, self.tor_socks.as_deref()).await?;
        live.insert(url.to_string(), conn.clone());
        Ok(conn)
    }

    /// Connections to every reachable relay of the set; failures are logged.
    pub async fn connections(&self) -> Vec<Arc<RelayConnection>> {
        let mut out = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            match self.connection(url).await {
                Ok(conn) => out.push(conn),
                Err(e) => warn!(relay = %url, error = %e, "relay unreachable"),
            }
        }
        out
    }

    /// Same as [`RelaySet::connections`] but as publish handles.
    pub async fn handles(&self) -> Vec<Arc<dyn RelayHandle>> {
        self.connections()
            .await
            .into_iter()
            .map(|c| c as Arc<dyn RelayHandle>)
            .collect()
    }
}

#[async_trait]
impl EventFetcher for RelaySet {
    async fn fetch_event(&self, id: &str) -> Result<Option<Event>> {
        let conns = self.connections().await;
        if conns.is_empty() {
            bail!("no read relay reachable");
        }
        let results = join_all(conns.iter().map(|c| c.fetch(id, FETCH_TIMEOUT))).await;
        let mut errors = 0;
        for res in results {
            match res {
                Ok(Some(ev)) => return Ok(Some(ev)),
                Ok(None) => {}
                Err(e) => {
                    debug!(id, error = %e, "fetch failed");
                    errors += 1;
                }
            }
        }
        if errors == conns.len() {
            bail!("every read relay failed to answer for {id}");
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{tests::test_keys, Tag, KIND_REGULAR};
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    type Published = mpsc::UnboundedSender<Event>;
    type Requests = mpsc::UnboundedSender<Value>;

    /// Minimal in-process relay: answers `REQ` with `stored` events matching
    /// requested ids (or all of them), then `EOSE`; accepts every `EVENT` and
    /// reports it on `published`.
    pub(crate) async fn spawn_fake_relay(
        stored: Vec<Event>,
    ) -> (String, mpsc::UnboundedReceiver<Event>, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(relay_session(stream, stored.clone(), pub_tx.clone(), req_tx.clone()));
            }
        });
        (format!("ws://{addr}"), pub_rx, req_rx)
    }

    /// Same relay behind TLS with a self-signed `localhost` certificate. The
    /// returned connector trusts only that certificate.
    async fn spawn_tls_relay(stored: Vec<Event>) -> (String, Connector, mpsc::UnboundedReceiver<Event>) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let (req_tx, _) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let (stored, pub_tx, req_tx) = (stored.clone(), pub_tx.clone(), req_tx.clone());
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(tcp).await {
                        relay_session(tls, stored, pub_tx, req_tx).await;
                    }
                });
            }
        });

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (
            format!("wss://localhost:{port}"),
            Connector::Rustls(Arc::new(client)),
            pub_rx,
        )
    }

    async fn relay_session<S>(stream: S, stored: Vec<Event>, pub_tx: Published, req_tx: Requests)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Ok(mut ws) = accept_async(stream).await else { return };
        while let Some(Ok(msg)) = ws.next().await {
            let TMsg::Text(txt) = msg else { continue };
            let val: Value = serde_json::from_str(&txt).unwrap();
            match val[0].as_str() {
                Some("REQ") => {
                    let sub = val[1].as_str().unwrap().to_string();
                    let _ = req_tx.send(val[2].clone());
                    let ids: Option<Vec<String>> = val[2]["ids"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect());
                    for ev in &stored {
                        if ids.as_ref().map_or(true, |ids| ids.contains(&ev.id)) {
                            let msg = json!(["EVENT", sub, ev]);
                            ws.send(TMsg::Text(msg.to_string())).await.unwrap();
                        }
                    }
                    let eose = json!(["EOSE", sub]);
                    ws.send(TMsg::Text(eose.to_string())).await.unwrap();
                }
                Some("EVENT") => {
                    let ev: Event = serde_json::from_value(val[1].clone()).unwrap();
                    let ok = json!(["OK", ev.id, true, ""]);
                    let _ = pub_tx.send(ev);
                    ws.send(TMsg::Text(ok.to_string())).await.unwrap();
                }
                _ => {}
            }
        }
    }

    fn signed(content: &str) -> Event {
        test_keys(7)
            .sign(Event::unsigned(KIND_REGULAR, content, vec![Tag::new("t", "x")]))
            .unwrap()
    }

    #[test]
    fn filter_to_json_fields() {
        let filter = Filter {
            since: Some(5),
            limit: Some(3),
            ..Filter::default()
        }
        .kinds([1112])
        .tag("p", ["svc"])
        .tag("#t", ["internal-transaction-ok"]);
        let json = Value::Object(filter.to_json());
        assert_eq!(json["kinds"], json!([1112]));
        assert_eq!(json["#p"], json!(["svc"]));
        assert_eq!(json["#t"], json!(["internal-transaction-ok"]));
        assert_eq!(json["since"], json!(5));
        assert_eq!(json["limit"], json!(3));
        assert!(json.get("authors").is_none());
    }

    #[test]
    fn filter_without_since_omits_bound() {
        let json = Filter::default().kinds([1112]).to_json();
        assert!(!json.contains_key("since"));
    }

    #[tokio::test]
    async fn publish_waits_for_ok() {
        let (url, mut published, _) = spawn_fake_relay(vec![]).await;
        let conn = RelayConnection::connect(&url, None).await.unwrap();
        let ev = signed("hi");
        conn.publish(&ev).await.unwrap();
        assert_eq!(published.recv().await.unwrap().id, ev.id);
    }

    #[tokio::test]
    async fn wss_relay_negotiates_tls() {
        let ev = signed("over tls");
        let (url, tls, mut published) = spawn_tls_relay(vec![ev.clone()]).await;
        let conn = RelayConnection::connect_with(&url, None, Some(tls)).await.unwrap();
        assert_eq!(conn.fetch(&ev.id, Duration::from_secs(5)).await.unwrap(), Some(ev));
        let fresh = signed("published over tls");
        conn.publish(&fresh).await.unwrap();
        assert_eq!(published.recv().await.unwrap().id, fresh.id);
    }

    #[tokio::test]
    async fn wss_to_plaintext_server_fails() {
        let (_, tls, _) = spawn_tls_relay(vec![]).await;
        let (url, _, _) = spawn_fake_relay(vec![]).await;
        let wss = url.replacen("ws://", "wss://", 1);
        assert!(RelayConnection::connect_with(&wss, None, Some(tls)).await.is_err());
    }

    #[tokio::test]
    async fn fetch_returns_stored_event_or_none() {
        let ev = signed("stored");
        let (url, _, _) = spawn_fake_relay(vec![ev.clone()]).await;
        let conn = RelayConnection::connect(&url, None).await.unwrap();
        let got = conn.fetch(&ev.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, Some(ev));
        let missing = conn.fetch(&"00".repeat(32), Duration::from_secs(5)).await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn subscription_stays_open_after_eose() {
        let ev = signed("backlog");
        let (url, _, mut reqs) = spawn_fake_relay(vec![ev.clone()]).await;
        let conn = RelayConnection::connect(&url, None).await.unwrap();
        let mut sub = conn.subscribe("ok", Filter::default().kinds([1112])).unwrap();
        let second = conn.subscribe("ok", Filter::default()).unwrap();
        assert!(sub.id().starts_with("ok-"));
        assert_ne!(sub.id(), second.id());
        drop(second);
        assert_eq!(sub.next().await, Some(SubscriptionItem::Event(ev)));
        assert_eq!(sub.next().await, Some(SubscriptionItem::EndOfStored));
        assert_eq!(reqs.recv().await.unwrap()["kinds"], json!([1112]));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn forged_events_are_dropped() {
        let mut forged = signed("real");
        forged.content = "forged".into();
        let (url, _, _) = spawn_fake_relay(vec![forged.clone()]).await;
        let conn = RelayConnection::connect(&url, None).await.unwrap();
        let got = conn.fetch(&forged.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn disconnect_marks_handle_closed() {
        let (url, _, _) = spawn_fake_relay(vec![]).await;
        let conn = RelayConnection::connect(&url, None).await.unwrap();
        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert!(conn.publish(&signed("late")).await.is_err());
    }

    #[tokio::test]
    async fn relay_set_fetch_errors_when_nothing_reachable() {
        let set = RelaySet::new(vec!["ws://127.0.0.1:9".into()], None);
        assert!(set.fetch_event("abc").await.is_err());
    }
}
