//! Donation and cause records, their stored row shapes, and the HTTP bodies
//! built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SettlementError;
use crate::hasher::Fingerprint;

/// Payment gateway status of a donation.
///
/// ```text
/// PENDING ──► SUCCESS
///    └──────► FAILED
/// ```
///
/// `SUCCESS` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Pending,
    Success,
    Failed,
}

impl GatewayStatus {
    /// Identifier stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Gateway sub-record of a donation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub order_id: String,
    pub status: GatewayStatus,
    /// Raw confirmation payload, set by the call that made the status terminal.
    pub raw_response: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Donation {
    pub id: String,
    pub donor_id: String,
    pub cause_id: String,
    pub amount: f64,
    pub gateway: GatewayRecord,
    pub hash: Option<Fingerprint>,
    pub ledger_tx: Option<String>,
    /// Whether the amount has been added to the cause total.
    pub aggregated: bool,
    pub created_at: DateTime<Utc>,
}

/// A donation as stored in / read from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DonationRow {
    pub id: String,
    pub donor_id: String,
    pub cause_id: String,
    pub amount: f64,
    pub order_id: String,
    pub status: String,
    pub raw_response: Option<String>,
    pub hash: Option<String>,
    pub ledger_tx: Option<String>,
    pub aggregated: bool,
    pub created_at: i64,
}

impl TryFrom<DonationRow> for Donation {
    type Error = SettlementError;

    fn try_from(row: DonationRow) -> Result<Self, Self::Error> {
        let status = GatewayStatus::parse(&row.status).ok_or_else(|| {
            SettlementError::Corrupt(format!("donation {}: status {:?}", row.id, row.status))
        })?;
        let raw_response = row
            .raw_response
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        let hash = row
            .hash
            .as_deref()
            .map(str::parse::<Fingerprint>)
            .transpose()
            .map_err(|e| SettlementError::Corrupt(format!("donation {}: {e}", row.id)))?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(row.created_at).ok_or_else(|| {
            SettlementError::Corrupt(format!("donation {}: created_at {}", row.id, row.created_at))
        })?;

        Ok(Donation {
            id: row.id,
            donor_id: row.donor_id,
            cause_id: row.cause_id,
            amount: row.amount,
            gateway: GatewayRecord {
                order_id: row.order_id,
                status,
                raw_response,
            },
            hash,
            ledger_tx: row.ledger_tx,
            aggregated: row.aggregated,
            created_at,
        })
    }
}

/// A cause as stored in the database. Owned by the cause service; this
/// crate only ever raises `current_amount`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Cause {
    pub id: String,
    pub title: String,
    pub required_amount: f64,
    pub current_amount: f64,
    pub created_at: i64,
}

/// Minimal cause projection embedded in donation responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CauseSummary {
    pub id: String,
    pub title: String,
    pub required_amount: f64,
    pub current_amount: f64,
}

impl From<Cause> for CauseSummary {
    fn from(cause: Cause) -> Self {
        CauseSummary {
            id: cause.id,
            title: cause.title,
            required_amount: cause.required_amount,
            current_amount: cause.current_amount,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Operation inputs / outputs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    #[serde(default)]
    pub cause_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub donation_id: String,
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub donation_id: Option<String>,
    /// Absent means the gateway reported nothing usable; treated as `FAILED`.
    #[serde(default)]
    pub status: Option<GatewayStatus>,
    #[serde(default, alias = "txDetails")]
    pub confirmation_payload: Option<Value>,
}

/// Donation as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationView {
    pub donation_id: String,
    pub cause_id: String,
    pub cause: Option<CauseSummary>,
    pub amount: f64,
    pub order_id: String,
    pub status: GatewayStatus,
    pub created_at: DateTime<Utc>,
    pub hash: Option<String>,
    pub ledger_tx: Option<String>,
}

impl DonationView {
    pub fn new(donation: Donation, cause: Option<Cause>) -> Self {
        DonationView {
            donation_id: donation.id,
            cause_id: donation.cause_id,
            cause: cause.map(CauseSummary::from),
            amount: donation.amount,
            order_id: donation.gateway.order_id,
            status: donation.gateway.status,
            created_at: donation.created_at,
            hash: donation.hash.map(|h| h.to_string()),
            ledger_tx: donation.ledger_tx,
        }
    }
}
