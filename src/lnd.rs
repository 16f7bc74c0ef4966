//! LND REST client.
//!
//! Every request carries the hex macaroon in `Grpc-Metadata-macaroon`.
//! Streaming endpoints (`/v2/router/send`, `/v2/router/track`,
//! `/v1/invoices/subscribe`) answer with newline delimited JSON objects of the
//! form `{"result": {...}}` or `{"error": {...}}`.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::lightning::{Invoice, InvoiceState, PayError, PaymentBackend, PaymentOutcome};

#[derive(Debug, Clone)]
pub struct LndConfig {
    /// Base URL of the REST listener, e.g. `https://127.0.0.1:8080`.
    pub host: String,
    pub macaroon_hex: String,
    /// PEM certificate to trust in addition to the system roots.
    pub cert_path: Option<PathBuf>,
    pub pay_timeout: Duration,
    pub fee_limit_msat: u64,
}

pub struct LndClient {
    http: reqwest::Client,
    config: LndConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LndInvoice {
    memo: String,
    r_preimage: String,
    r_hash: String,
    value_msat: String,
    amt_paid_msat: String,
    state: String,
    payment_request: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LndPayment {
    payment_hash: String,
    payment_preimage: String,
    status: String,
    failure_reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PayReq {
    payment_hash: String,
}

/// LND encodes 64-bit integers as JSON strings; missing means zero.
fn parse_msat(s: &str) -> u128 {
    s.parse().unwrap_or_default()
}

/// Bytes fields arrive base64 encoded; hand them out as hex.
fn b64_to_hex(s: &str) -> String {
    STANDARD.decode(s).map(hex::encode).unwrap_or_default()
}

impl LndInvoice {
    fn into_invoice(self) -> Result<Invoice, PayError> {
        let state = InvoiceState::parse(&self.state)
            .ok_or_else(|| PayError::Backend(format!("unknown invoice state `{}`", self.state)))?;
        let preimage = Some(b64_to_hex(&self.r_preimage))
            .filter(|p| !p.is_empty() && state == InvoiceState::Settled);
        Ok(Invoice {
            payment_hash: b64_to_hex(&self.r_hash),
            payment_request: self.payment_request,
            memo: self.memo,
            amount_msat: parse_msat(&self.value_msat),
            amount_paid_msat: parse_msat(&self.amt_paid_msat),
            state,
            preimage,
        })
    }
}

impl LndClient {
    pub fn new(config: LndConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(path) = &config.cert_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read LND certificate {}", path.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Grpc-Metadata-macaroon",
            reqwest::header::HeaderValue::from_str(&config.macaroon_hex)
                .context("macaroon is not a valid header value")?,
        );
        let http = builder.default_headers(headers).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    /// Read streamed payment updates until one reaches a final status.
    async fn first_final_payment<S, B>(mut lines: JsonLines<S>) -> Result<Option<LndPayment>, PayError>
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        while let Some(line) = lines.next_value().await? {
            if let Some(err) = line.get("error") {
                return Err(PayError::Failed(err["message"].as_str().unwrap_or("unknown").to_string()));
            }
            let payment: LndPayment = serde_json::from_value(line["result"].clone())
                .map_err(|e| PayError::Backend(e.to_string()))?;
            match payment.status.as_str() {
                "SUCCEEDED" | "FAILED" => return Ok(Some(payment)),
                other => debug!(status = other, "payment in flight"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PaymentBackend for LndClient {
    async fn generate_invoice(&self, amount_msat: u128, memo: &str) -> Result<Invoice, PayError> {
        let body = json!({ "value_msat": amount_msat.to_string(), "memo": memo });
        let resp: AddInvoiceResponse = self
            .http
            .post(self.url("/v1/invoices"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(Invoice {
            payment_hash: b64_to_hex(&resp.r_hash),
            payment_request: resp.payment_request,
            memo: memo.to_string(),
            amount_msat,
            amount_paid_msat: 0,
            state: InvoiceState::Open,
            preimage: None,
        })
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<PaymentOutcome, PayError> {
        let body = json!({
            "payment_request": payment_request,
            "timeout_seconds": self.config.pay_timeout.as_secs(),
            "fee_limit_msat": self.config.fee_limit_msat.to_string(),
            "allow_self_payment": true,
            "no_inflight_updates": true,
        });
        let resp = self
            .http
            .post(self.url("/v2/router/send"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let payment = Self::first_final_payment(JsonLines::new(Box::pin(resp.bytes_stream())))
            .await?
            .ok_or_else(|| PayError::Failed("payment stream ended without a result".into()))?;
        if payment.status != "SUCCEEDED" {
            return Err(PayError::Failed(payment.failure_reason));
        }
        Ok(PaymentOutcome {
            payment_hash: payment.payment_hash,
            preimage: payment.payment_preimage,
        })
    }

    async fn lookup_payment(&self, payment_request: &str) -> Result<Option<PaymentOutcome>, PayError> {
        let decoded: PayReq = self
            .http
            .get(self.url(&format!("/v1/payreq/{payment_request}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let resp = self
            .http
            .get(self.url(&format!(
                "/v2/router/track/{}?no_inflight_updates=true",
                decoded.payment_hash
            )))
            .timeout(self.config.pay_timeout)
            .send()
            .await?;
        // LND answers with an error when the payment was never attempted.
        if !resp.status().is_success() {
            return Ok(None);
        }
        match Self::first_final_payment(JsonLines::new(Box::pin(resp.bytes_stream()))).await {
            Ok(Some(p)) if p.status == "SUCCEEDED" => Ok(Some(PaymentOutcome {
                payment_hash: p.payment_hash,
                preimage: p.payment_preimage,
            })),
            Ok(_) | Err(PayError::Failed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_invoice(&self, payment_hash: &str) -> Result<Invoice, PayError> {
        let inv: LndInvoice = self
            .http
            .get(self.url(&format!("/v1/invoice/{payment_hash}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        inv.into_invoice()
    }

    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<Invoice>, PayError> {
        let resp = self
            .http
            .get(self.url("/v1/invoices/subscribe"))
            .send()
            .await?
            .error_for_status()?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = JsonLines::new(Box::pin(resp.bytes_stream()));
            loop {
                let line = match lines.next_value().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "invoice stream failed");
                        break;
                    }
                };
                let inv = serde_json::from_value::<LndInvoice>(line["result"].clone())
                    .map_err(|e| PayError::Backend(e.to_string()))
                    .and_then(LndInvoice::into_invoice);
                match inv {
                    Ok(inv) => {
                        if tx.send(inv).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping unreadable invoice update"),
                }
            }
            debug!("invoice stream closed");
        });
        Ok(rx)
    }
}

/// Splits a byte stream into newline delimited JSON values.
struct JsonLines<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S, B> JsonLines<S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn next_value(&mut self) -> Result<Option<Value>, PayError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return serde_json::from_slice(&line)
                    .map(Some)
                    .map_err(|e| PayError::Backend(e.to_string()));
            }
            match self.stream.next().await {
                Some(chunk) => self.buf.extend_from_slice(chunk?.as_ref()),
                None if self.buf.iter().all(u8::is_ascii_whitespace) => return Ok(None),
                None => {
                    let rest = std::mem::take(&mut self.buf);
                    return serde_json::from_slice(&rest)
                        .map(Some)
                        .map_err(|e| PayError::Backend(e.to_string()));
                }
            }
        }
    }
}
