//! Donation fingerprints.
//!
//! A fingerprint is `0x` followed by the lower-case hex Keccak-256 digest of
//! the donation's canonical summary:
//!
//! ```text
//! {"donationId":"…","donorId":"…","causeId":"…","amount":500,"createdAt":"2024-01-01T00:00:00.000Z"}
//! ```
//!
//! Field order is fixed. Strings are JSON-escaped, `amount` is written as the
//! shortest decimal that round-trips (no exponent, no trailing `.0`) and
//! `createdAt` is UTC with millisecond precision. Anyone holding the five
//! immutable fields can recompute the digest and compare it with the stored
//! or on-chain value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sha3::{Digest, Keccak256};

use crate::models::Donation;

/// 256-bit donation fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Recompute the fingerprint of `donation` and compare it to `self`.
    pub fn verify(&self, donation: &Donation) -> bool {
        fingerprint(donation) == *self
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint must start with 0x")]
    MissingPrefix,
    #[error("fingerprint must be 64 hex characters, got {0}")]
    Length(usize),
    #[error("fingerprint is not lower-case hex")]
    NotHex,
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").ok_or(FingerprintError::MissingPrefix)?;
        if digits.len() != 64 {
            return Err(FingerprintError::Length(digits.len()));
        }
        if digits.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(FingerprintError::NotHex);
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(digits, &mut out).map_err(|_| FingerprintError::NotHex)?;
        Ok(Fingerprint(out))
    }
}

/// Fingerprint of a donation's immutable fields.
pub fn fingerprint(donation: &Donation) -> Fingerprint {
    digest(&canonical_summary(
        &donation.id,
        &donation.donor_id,
        &donation.cause_id,
        donation.amount,
        &donation.created_at,
    ))
}

pub fn canonical_summary(
    donation_id: &str,
    donor_id: &str,
    cause_id: &str,
    amount: f64,
    created_at: &DateTime<Utc>,
) -> String {
    format!(
        r#"{{"donationId":{},"donorId":{},"causeId":{},"amount":{},"createdAt":{}}}"#,
        json_string(donation_id),
        json_string(donor_id),
        json_string(cause_id),
        canonical_amount(amount),
        json_string(&created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    )
}

/// `500.0` → `500`, `12.5` → `12.5`, `0.1` → `0.1`.
///
/// `f64`'s `Display` already prints the shortest round-trip form without an
/// exponent and drops the fractional part of integral values.
pub fn canonical_amount(amount: f64) -> String {
    if amount == 0.0 {
        // Normalise -0.
        return "0".to_string();
    }
    format!("{amount}")
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

fn digest(summary: &str) -> Fingerprint {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(summary.as_bytes()));
    Fingerprint(out)
}
