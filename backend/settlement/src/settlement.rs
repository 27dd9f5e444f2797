//! Donation state machine — payment intents and gateway verification.
//!
//! ## Lifecycle
//!
//! ```text
//! create_intent ──► PENDING ──verify(SUCCESS)──► SUCCESS (hash, aggregated, maybe anchored)
//!                      └──────verify(FAILED)───► FAILED
//! ```
//!
//! `SUCCESS` and `FAILED` are terminal. Moving a terminal donation into the
//! other terminal state is rejected with [`SettlementError::Conflict`];
//! repeating the state it already has is accepted and changes nothing.
//!
//! ## Settlement order
//!
//! For a donation moving to `SUCCESS`:
//!
//! 1. fingerprint the immutable fields and commit `SUCCESS` + hash + payload
//!    in one conditional update (only the first caller wins),
//! 2. the winner adds the amount to the cause total,
//! 3. an anchoring task is spawned; verify waits for it at most
//!    `inline_wait` and otherwise answers without a ledger reference.
//!
//! Aggregation and ledger failures are logged and never reach the caller.
//! The donation counts as settled once its hash is stored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{Result, SettlementError};
use crate::funds::{self, Aggregation};
use crate::hasher;
use crate::ledger::LedgerMirror;
use crate::models::{CreateIntentRequest, Donation, GatewayRecord, GatewayStatus, Intent, VerifyRequest};

#[derive(Clone)]
pub struct Settlement {
    pool: SqlitePool,
    ledger: LedgerMirror,
    inline_wait: Duration,
    /// Donations with an anchoring task running in this process.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Settlement {
    pub fn new(pool: SqlitePool, ledger: LedgerMirror, inline_wait: Duration) -> Self {
        Self {
            pool,
            ledger,
            inline_wait,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn ledger(&self) -> &LedgerMirror {
        &self.ledger
    }

    // ─────────────────────────────────────────────────────
    // Intent
    // ─────────────────────────────────────────────────────

    /// Record a `PENDING` donation for `donor_id` and hand back the ids the
    /// payment gateway needs.
    pub async fn create_intent(&self, donor_id: &str, request: CreateIntentRequest) -> Result<Intent> {
        if donor_id.trim().is_empty() {
            return Err(SettlementError::Unauthenticated);
        }
        let (cause_id, amount) = match (request.cause_id, request.amount) {
            (Some(cause_id), Some(amount)) if !cause_id.trim().is_empty() => (cause_id, amount),
            _ => {
                return Err(SettlementError::Validation(
                    "causeId and amount required".to_string(),
                ))
            }
        };
        if !amount.is_finite() || amount <= 0.0 {
            return Err(SettlementError::Validation(
                "amount must be a positive number".to_string(),
            ));
        }
        if db::find_cause(&self.pool, &cause_id).await?.is_none() {
            return Err(SettlementError::NotFound("Cause"));
        }

        // Millisecond precision so the stored value is exactly what gets fingerprinted.
        let created_at = Utc::now().trunc_subsecs(3);
        let donation = Donation {
            id: Uuid::new_v4().to_string(),
            donor_id: donor_id.to_string(),
            cause_id,
            amount,
            gateway: GatewayRecord {
                order_id: new_order_id(&created_at),
                status: GatewayStatus::Pending,
                raw_response: None,
            },
            hash: None,
            ledger_tx: None,
            aggregated: false,
            created_at,
        };
        db::insert_donation(&self.pool, &donation).await?;

        info!(
            donation_id = %donation.id,
            order_id = %donation.gateway.order_id,
            cause_id = %donation.cause_id,
            amount,
            "Donation intent created"
        );
        Ok(Intent {
            donation_id: donation.id,
            order_id: donation.gateway.order_id,
        })
    }

    // ─────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────

    /// Apply the gateway's verdict to a donation and return its settled state.
    pub async fn verify(&self, request: VerifyRequest) -> Result<Donation> {
        let donation_id = request
            .donation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SettlementError::Validation("donationId required".to_string()))?;
        let status = request.status.unwrap_or(GatewayStatus::Failed);
        if !status.is_terminal() {
            return Err(SettlementError::Validation(
                "status must be SUCCESS or FAILED".to_string(),
            ));
        }
        let payload = request
            .confirmation_payload
            .unwrap_or_else(|| Value::Object(Default::default()));

        let donation = self.load(&donation_id).await?;
        if status == GatewayStatus::Success {
            self.settle(donation, payload).await
        } else {
            self.fail(donation, payload).await
        }
    }

    async fn settle(&self, donation: Donation, payload: Value) -> Result<Donation> {
        let donation = match donation.gateway.status {
            GatewayStatus::Failed => return Err(terminal_conflict(&donation)),
            GatewayStatus::Success => {
                debug!(donation_id = %donation.id, "Donation already settled");
                donation
            }
            GatewayStatus::Pending => {
                let hash = hasher::fingerprint(&donation);
                if db::claim_success(&self.pool, &donation.id, &hash, &payload).await? {
                    info!(donation_id = %donation.id, %hash, "Donation settled");
                    self.aggregate(&donation).await;
                }
                // Either this call or a concurrent one made the transition.
                let current = self.load(&donation.id).await?;
                if current.gateway.status != GatewayStatus::Success {
                    return Err(terminal_conflict(&current));
                }
                current
            }
        };

        Ok(self.anchor_inline(donation).await)
    }

    async fn fail(&self, donation: Donation, payload: Value) -> Result<Donation> {
        match donation.gateway.status {
            GatewayStatus::Failed => return Ok(donation),
            GatewayStatus::Success => return Err(terminal_conflict(&donation)),
            GatewayStatus::Pending => {}
        }

        if db::mark_failed(&self.pool, &donation.id, &payload).await? {
            info!(donation_id = %donation.id, "Donation payment failed");
        }
        let current = self.load(&donation.id).await?;
        match current.gateway.status {
            GatewayStatus::Failed => Ok(current),
            _ => Err(terminal_conflict(&current)),
        }
    }

    async fn aggregate(&self, donation: &Donation) {
        match funds::aggregate(&self.pool, &donation.id, &donation.cause_id, donation.amount).await
        {
            Ok(Aggregation::Applied) => {}
            Ok(Aggregation::AlreadyApplied) => {
                debug!(donation_id = %donation.id, "Cause total already includes donation")
            }
            Err(e) => error!(
                donation_id = %donation.id,
                cause_id = %donation.cause_id,
                "Fund aggregation failed; left for reconciliation: {e}"
            ),
        }
    }

    async fn load(&self, donation_id: &str) -> Result<Donation> {
        db::find_donation(&self.pool, donation_id)
            .await?
            .ok_or(SettlementError::NotFound("Donation"))
    }

    // ─────────────────────────────────────────────────────
    // Anchoring
    // ─────────────────────────────────────────────────────

    /// Start anchoring and wait for it at most `inline_wait`.
    async fn anchor_inline(&self, mut donation: Donation) -> Donation {
        let Some(mut handle) = self.spawn_anchor(&donation) else {
            return donation;
        };

        match tokio::time::timeout(self.inline_wait, &mut handle).await {
            Ok(Ok(Some(ledger_tx))) => donation.ledger_tx = Some(ledger_tx),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(donation_id = %donation.id, "Anchoring task aborted: {e}"),
            Err(_) => debug!(
                donation_id = %donation.id,
                "Anchoring still in flight; responding without ledger reference"
            ),
        }
        donation
    }

    /// Spawn a detached task that anchors `donation` and stores the reference.
    ///
    /// Returns `None` when there is nothing to do: no hash yet, a reference is
    /// already stored, the ledger is unavailable, or this process is already
    /// anchoring the donation. The task yields the reference it stored.
    pub fn spawn_anchor(&self, donation: &Donation) -> Option<JoinHandle<Option<String>>> {
        let hash = donation.hash?;
        if donation.ledger_tx.is_some() || !self.ledger.is_available() {
            return None;
        }
        let guard = InFlight::claim(&self.in_flight, &donation.id)?;

        let pool = self.pool.clone();
        let ledger = self.ledger.clone();
        let donation_id = donation.id.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let ledger_tx = ledger.mirror(&donation_id, &hash).await?;
            match db::set_ledger_tx(&pool, &donation_id, &ledger_tx).await {
                Ok(true) => Some(ledger_tx),
                Ok(false) => {
                    debug!(%donation_id, "Ledger reference already stored; keeping it");
                    None
                }
                Err(e) => {
                    warn!(%donation_id, %ledger_tx, "Failed to store ledger reference: {e}");
                    None
                }
            }
        }))
    }
}

/// Membership in the in-flight set, released on drop.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    donation_id: String,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, donation_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(donation_id.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            donation_id: donation_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.donation_id);
    }
}

fn terminal_conflict(donation: &Donation) -> SettlementError {
    SettlementError::Conflict(format!(
        "Donation is already {} and cannot change state",
        donation.gateway.status.as_str()
    ))
}

/// `order_<created-at millis>_<12 random hex digits>`.
fn new_order_id(created_at: &DateTime<Utc>) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("order_{}_{}", created_at.timestamp_millis(), &token[..12])
}
