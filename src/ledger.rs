//! Builders for the events the bridge emits into ledger transaction threads.
//!
//! Threads are linked through tags only:
//!
//! ```text
//! start  [p ledger] [p receiver] [t internal-transaction-start] [bolt11 ..]
//!   ack  [p ledger] [p target]   [e start] [t internal-transaction-ok]
//!   out  [p ledger] [p receiver] [e start] [t outbound-transaction-start] [preimage ..]
//!   rev  [p ledger] [p author]   [e start] [t internal-transaction-start]
//! ```

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    event::{Event, Tag, KIND_REGULAR, KIND_ZAP_RECEIPT},
    lightning::Invoice,
};

pub const TX_START: &str = "internal-transaction-start";
pub const TX_OK: &str = "internal-transaction-ok";
pub const OUTBOUND_START: &str = "outbound-transaction-start";
pub const INBOUND_START: &str = "inbound-transaction-start";
pub const REVERT_MEMO: &str = "Revert failed outbound";

/// Declared amount of a start event, `tokens.BTC` as a string or integer of
/// millisatoshi.
pub fn start_amount(content: &str) -> Option<u128> {
    let value: Value = serde_json::from_str(content).ok()?;
    match &value["tokens"]["BTC"] {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}

/// Pubkey credited when `start` is reverted: the NIP-26 delegator when the
/// event carries a valid delegation, the author otherwise.
pub fn credited_party(start: &Event) -> &str {
    start
        .nth_full_tag("delegation", 0)
        .filter(|tag| valid_delegation(&start.pubkey, tag))
        .and_then(Tag::value)
        .unwrap_or(&start.pubkey)
}

/// Check `["delegation", delegator, conditions, sig]` against the delegatee.
fn valid_delegation(delegatee: &str, tag: &Tag) -> bool {
    let [_, delegator, conditions, sig] = tag.0.as_slice() else {
        return false;
    };
    let token = format!("nostr:delegation:{delegatee}:{conditions}");
    let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
    let check = || -> Option<()> {
        let sig = Signature::from_slice(&hex::decode(sig).ok()?).ok()?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(delegator).ok()?).ok()?;
        let msg = Message::from_digest_slice(&digest).ok()?;
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .ok()
    };
    check().is_some()
}

/// Outbound event completing `start` after a successful payment. Content is
/// copied verbatim.
pub fn outbound_tx(ledger: &str, start: &Event, encrypted_preimage: String) -> Event {
    let mut tags = vec![Tag::new("p", ledger)];
    if let Some(receiver) = start.nth_tag("p", 1) {
        tags.push(Tag::new("p", receiver));
    }
    tags.push(Tag::new("e", start.id.clone()));
    tags.push(Tag::new("t", OUTBOUND_START));
    tags.push(Tag::new("preimage", encrypted_preimage));
    Event::unsigned(KIND_REGULAR, start.content.clone(), tags)
}

/// Compensating transaction returning the funds of a failed outbound `start`.
pub fn revert_tx(ledger: &str, start: &Event) -> Event {
    let mut content: Map<String, Value> = serde_json::from_str(&start.content).unwrap_or_default();
    content.insert("memo".into(), Value::String(REVERT_MEMO.into()));
    let tags = vec![
        Tag::new("p", ledger),
        Tag::new("p", credited_party(start)),
        Tag::new("e", start.id.clone()),
        Tag::new("t", TX_START),
    ];
    Event::unsigned(KIND_REGULAR, Value::Object(content).to_string(), tags)
}

/// Credit `pubkey` with a settled incoming payment.
pub fn inbound_tx(ledger: &str, pubkey: &str, amount_msat: u128, comment: Option<&str>) -> Event {
    let mut content = json!({ "tokens": { "BTC": amount_msat.to_string() } });
    if let Some(memo) = comment {
        content["memo"] = Value::String(memo.to_string());
    }
    let tags = vec![
        Tag::new("p", ledger),
        Tag::new("p", pubkey),
        Tag::new("t", INBOUND_START),
    ];
    Event::unsigned(KIND_REGULAR, content.to_string(), tags)
}

/// NIP-57 zap receipt for a settled `invoice` paid against `zap_request`.
pub fn zap_receipt(zap_request: &Event, zap_request_json: &str, invoice: &Invoice) -> Event {
    let mut tags = Vec::new();
    for name in ["p", "e", "a"] {
        if let Some(v) = zap_request.first_tag(name) {
            tags.push(Tag::new(name, v));
        }
    }
    tags.push(Tag::new("P", zap_request.pubkey.clone()));
    tags.push(Tag::new("bolt11", invoice.payment_request.clone()));
    tags.push(Tag::new("description", zap_request_json));
    if let Some(preimage) = &invoice.preimage {
        tags.push(Tag::new("preimage", preimage.clone()));
    }
    Event::unsigned(KIND_ZAP_RECEIPT, "", tags)
}

/// Relays a zap request asks its receipt to be sent to.
pub fn zap_relays(zap_request: &Event) -> Vec<String> {
    zap_request
        .nth_full_tag("relays", 0)
        .map(|t| t.0.iter().skip(1).cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{tests::test_keys, KIND_ZAP_REQUEST},
        lightning::InvoiceState,
    };
    use secp256k1::Keypair;

    fn start(content: &str) -> Event {
        test_keys(20)
            .sign(Event::unsigned(
                KIND_REGULAR,
                content,
                vec![
                    Tag::new("p", "ledger"),
                    Tag::new("p", "receiver"),
                    Tag::new("t", TX_START),
                    Tag::new("bolt11", "lnbc3320n1x"),
                ],
            ))
            .unwrap()
    }

    #[test]
    fn amount_accepts_string_or_integer() {
        assert_eq!(start_amount(r#"{"tokens":{"BTC":"332000"}}"#), Some(332_000));
        assert_eq!(start_amount(r#"{"tokens":{"BTC":332000}}"#), Some(332_000));
        assert_eq!(start_amount(r#"{"tokens":{"BTC":"3.5"}}"#), None);
        assert_eq!(start_amount(r#"{"tokens":{}}"#), None);
        assert_eq!(start_amount("not json"), None);
    }

    #[test]
    fn outbound_copies_content_and_links_start() {
        let s = start(r#"{"tokens":{"BTC":"332000"}}"#);
        let out = outbound_tx("ledger", &s, "enc?iv=x".into());
        assert_eq!(out.content, s.content);
        let names: Vec<_> = out.tags.iter().map(|t| (t.name().unwrap(), t.value().unwrap())).collect();
        assert_eq!(
            names,
            vec![
                ("p", "ledger"),
                ("p", "receiver"),
                ("e", s.id.as_str()),
                ("t", OUTBOUND_START),
                ("preimage", "enc?iv=x"),
            ]
        );
    }

    #[test]
    fn revert_credits_author_with_memo() {
        let s = start(r#"{"tokens":{"BTC":"332000"},"memo":"coffee"}"#);
        let rev = revert_tx("ledger", &s);
        let content: Value = serde_json::from_str(&rev.content).unwrap();
        assert_eq!(content["memo"], REVERT_MEMO);
        assert_eq!(content["tokens"]["BTC"], "332000");
        assert_eq!(rev.nth_tag("p", 1), Some(s.pubkey.as_str()));
        assert_eq!(rev.first_tag("e"), Some(s.id.as_str()));
        assert_eq!(rev.first_tag("t"), Some(TX_START));
    }

    #[test]
    fn revert_credits_valid_delegator() {
        let delegator = test_keys(21);
        let delegatee = test_keys(20);
        let conditions = "kind=1112";
        let token = format!("nostr:delegation:{}:{conditions}", delegatee.public_hex());
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, delegator.secret());
        let sig = secp.sign_schnorr(&Message::from_digest_slice(&digest).unwrap(), &keypair);
        let tag = Tag(vec![
            "delegation".into(),
            delegator.public_hex().into(),
            conditions.into(),
            hex::encode(sig.as_ref()),
        ]);
        let delegated = delegatee
            .sign(Event::unsigned(KIND_REGULAR, "{}", vec![tag.clone()]))
            .unwrap();
        assert_eq!(credited_party(&delegated), delegator.public_hex());

        let mut forged = tag;
        forged.0[2] = "kind=1".into();
        let bad = delegatee
            .sign(Event::unsigned(KIND_REGULAR, "{}", vec![forged]))
            .unwrap();
        assert_eq!(credited_party(&bad), delegatee.public_hex());
    }

    #[test]
    fn inbound_carries_amount_and_memo() {
        let ev = inbound_tx("ledger", "alice", 21_000, Some("thanks"));
        let content: Value = serde_json::from_str(&ev.content).unwrap();
        assert_eq!(content, json!({"tokens":{"BTC":"21000"},"memo":"thanks"}));
        assert_eq!(ev.first_tag("t"), Some(INBOUND_START));
        assert_eq!(ev.nth_tag("p", 1), Some("alice"));
        let bare = inbound_tx("ledger", "alice", 1, None);
        assert!(!bare.content.contains("memo"));
    }

    #[test]
    fn zap_receipt_follows_request() {
        let request = test_keys(22)
            .sign(Event::unsigned(
                KIND_ZAP_REQUEST,
                "",
                vec![
                    Tag::new("p", "recipient"),
                    Tag::new("e", "note"),
                    Tag(vec!["relays".into(), "wss://a".into(), "wss://b".into()]),
                ],
            ))
            .unwrap();
        let json = serde_json::to_string(&request).unwrap();
        let invoice = Invoice {
            payment_hash: "aa".into(),
            payment_request: "lnbc10n1zap".into(),
            memo: String::new(),
            amount_msat: 1_000,
            amount_paid_msat: 1_000,
            state: InvoiceState::Settled,
            preimage: Some("ff".into()),
        };
        let receipt = zap_receipt(&request, &json, &invoice);
        assert_eq!(receipt.kind, KIND_ZAP_RECEIPT);
        assert_eq!(receipt.first_tag("p"), Some("recipient"));
        assert_eq!(receipt.first_tag("e"), Some("note"));
        assert_eq!(receipt.first_tag("P"), Some(request.pubkey.as_str()));
        assert_eq!(receipt.first_tag("bolt11"), Some("lnbc10n1zap"));
        assert_eq!(receipt.first_tag("description"), Some(json.as_str()));
        assert_eq!(receipt.first_tag("preimage"), Some("ff"));
        assert_eq!(zap_relays(&request), vec!["wss://a", "wss://b"]);
    }
}
