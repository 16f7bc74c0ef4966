//! Nostr event model, signing and the tag helpers used to walk transaction
//! threads.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Regular ledger events (transaction starts, acknowledgements, outbounds).
pub const KIND_REGULAR: u32 = 1112;
/// NIP-57 zap request.
pub const KIND_ZAP_REQUEST: u32 = 9734;
/// NIP-57 zap receipt.
pub const KIND_ZAP_RECEIPT: u32 = 9735;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The bridge relies on:
///
/// - `p` – participant public key (ledger first, counterpart second)
/// - `e` – causal reference to another event id
/// - `t` – transaction type such as `internal-transaction-ok`
/// - `bolt11` – encoded Lightning invoice
/// - `preimage` – proof of payment, encrypted to the counterpart
///
/// Keys are not unique; an event commonly carries two `p` tags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a two element tag such as `["e", "<id>"]`.
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Tag(vec![name.to_string(), value.into()])
    }

    /// Tag name, the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// An event whose `sig` is empty is treated as unsigned; [`Keys::sign`] fills
/// in `pubkey`, `id` and `sig`.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "8d55...",
///   "kind": 1112,
///   "created_at": 1700000000,
///   "tags": [["p", "c07b..."], ["p", "20cf..."], ["t", "internal-transaction-ok"]],
///   "content": "{\"tokens\":{\"BTC\":\"332000\"}}",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `1112` or `9735`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags; names may repeat.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Start an unsigned event authored "now".
    pub fn unsigned(kind: u32, content: impl Into<String>, tags: Vec<Tag>) -> Self {
        Event {
            id: String::new(),
            pubkey: String::new(),
            kind,
            created_at: now_secs(),
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.sig.is_empty() && !self.id.is_empty()
    }

    /// Value of the `n`-th (zero based) tag named `name`.
    pub fn nth_tag(&self, name: &str, n: usize) -> Option<&str> {
        self.nth_full_tag(name, n).and_then(Tag::value)
    }

    /// Value of the first tag named `name`.
    pub fn first_tag(&self, name: &str) -> Option<&str> {
        self.nth_tag(name, 0)
    }

    /// The full `n`-th tag named `name`, extra elements included.
    pub fn nth_full_tag(&self, name: &str, n: usize) -> Option<&Tag> {
        self.tags.iter().filter(|t| t.name() == Some(name)).nth(n)
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Service identity used to sign outgoing events.
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    keypair: Keypair,
    public_hex: String,
}

impl Keys {
    /// Load keys from a hex encoded 32 byte secret.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())?;
        let secret = SecretKey::from_slice(&bytes)?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let public_hex = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            secret,
            keypair,
            public_hex,
        })
    }

    /// Hex x-only public key.
    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Stamp `ev` with this identity, compute its id and sign it.
    pub fn sign(&self, mut ev: Event) -> Result<Event> {
        ev.pubkey = self.public_hex.clone();
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_hex)
            .finish_non_exhaustive()
    }
}
