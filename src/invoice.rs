//! BOLT11 amount decoding and the payment request hash used as the
//! settlement key.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvoiceError {
    #[error("invoice has no bech32 separator")]
    MissingSeparator,
    #[error("invoice is not a lightning payment request")]
    NotLightning,
    #[error("invoice does not encode an amount")]
    NoAmount,
    #[error("invalid invoice amount `{0}`")]
    InvalidAmount(String),
}

/// Decode the amount of a BOLT11 payment request in millisatoshi.
///
/// The amount lives in the human readable part, `ln<currency><amount><multiplier>`,
/// where the multiplier is one of `m`, `u`, `n`, `p` or absent for whole
/// bitcoin. Pico amounts must land on a whole millisatoshi.
pub fn amount_msat(payment_request: &str) -> Result<u128, InvoiceError> {
    let lower = payment_request.trim().to_ascii_lowercase();
    let sep = lower.rfind('1').ok_or(InvoiceError::MissingSeparator)?;
    let hrp = lower[..sep]
        .strip_prefix("ln")
        .ok_or(InvoiceError::NotLightning)?;
    let start = hrp
        .find(|c: char| c.is_ascii_digit())
        .ok_or(InvoiceError::NoAmount)?;
    let amount_part = &hrp[start..];
    let (digits, multiplier) = match amount_part.chars().last() {
        Some(c @ ('m' | 'u' | 'n' | 'p')) => (&amount_part[..amount_part.len() - 1], Some(c)),
        _ => (amount_part, None),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(InvoiceError::InvalidAmount(amount_part.to_string()));
    }
    let value: u128 = digits
        .parse()
        .map_err(|_| InvoiceError::InvalidAmount(amount_part.to_string()))?;
    let msat = match multiplier {
        None => value.checked_mul(100_000_000_000),
        Some('m') => value.checked_mul(100_000_000),
        Some('u') => value.checked_mul(100_000),
        Some('n') => value.checked_mul(100),
        Some('p') if value % 10 == 0 => Some(value / 10),
        _ => None,
    };
    msat.ok_or_else(|| InvoiceError::InvalidAmount(amount_part.to_string()))
}

/// Case-insensitive SHA-256 of a payment request, hex encoded.
///
/// This is the key under which invoice metadata, the handled flag and the
/// settlement lease are stored.
pub fn hash_payment_request(payment_request: &str) -> String {
    hex::encode(Sha256::digest(payment_request.to_lowercase().as_bytes()))
}
