//! Long-running background task that repairs settled donations whose
//! follow-up steps did not complete during verify.
//!
//! Each sweep:
//!
//! * re-runs fund aggregation for `SUCCESS` donations that are not yet
//!   counted in their cause total (the aggregation step is exactly-once, so
//!   racing a verify call is harmless). The scan resumes where the previous
//!   sweep stopped and wraps around at the end, so donations that keep
//!   failing cannot starve the rest;
//! * re-submits fingerprints of `SUCCESS` donations that have no ledger
//!   reference, when the ledger is available. Stored fingerprints are checked
//!   against the donation's immutable fields first and mismatches are never
//!   anchored.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::Result;
use crate::funds::{self, Aggregation};
use crate::settlement::Settlement;

pub struct ReconcilerState {
    pub settlement: Settlement,
    pub interval: Duration,
    pub batch: u32,
}

/// Position of the aggregation scan between sweeps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepCursor {
    after: Option<(i64, String)>,
}

impl SweepCursor {
    fn position(&self) -> Option<(i64, &str)> {
        self.after.as_ref().map(|(millis, id)| (*millis, id.as_str()))
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub aggregated: usize,
    pub anchored: usize,
}

/// Run sweeps every `interval` until `shutdown` is cancelled.
pub async fn run(state: ReconcilerState, shutdown: CancellationToken) {
    info!(
        interval_secs = state.interval.as_secs(),
        batch = state.batch,
        ledger_available = state.settlement.ledger().is_available(),
        "Reconciler starting"
    );

    let mut cursor = SweepCursor::default();
    loop {
        match sweep_once(&state.settlement, state.batch, &mut cursor).await {
            Ok(sweep) if sweep != Sweep::default() => info!(
                aggregated = sweep.aggregated,
                anchored = sweep.anchored,
                "Reconciler sweep repaired donations"
            ),
            Ok(_) => {}
            Err(e) => error!("Reconciler sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(state.interval) => {}
        }
    }

    info!("Reconciler stopped");
}

/// Perform a single sweep, advancing `cursor` through the aggregation backlog.
pub async fn sweep_once(
    settlement: &Settlement,
    batch: u32,
    cursor: &mut SweepCursor,
) -> Result<Sweep> {
    let pool = settlement.pool();
    let mut sweep = Sweep::default();

    let page = db::unaggregated_donations(pool, cursor.position(), batch).await?;
    cursor.after = match page.last() {
        Some(last) if page.len() >= batch as usize => {
            Some((last.created_at.timestamp_millis(), last.id.clone()))
        }
        _ => None,
    };

    for donation in page {
        match funds::aggregate(pool, &donation.id, &donation.cause_id, donation.amount).await {
            Ok(Aggregation::Applied) => sweep.aggregated += 1,
            Ok(Aggregation::AlreadyApplied) => {}
            Err(e) => warn!(donation_id = %donation.id, "Aggregation retry failed: {e}"),
        }
    }

    if !settlement.ledger().is_available() {
        return Ok(sweep);
    }

    let mut tasks = Vec::new();
    for donation in db::unanchored_donations(pool, batch).await? {
        let Some(hash) = donation.hash else { continue };
        if !hash.verify(&donation) {
            error!(
                donation_id = %donation.id,
                %hash,
                "Stored fingerprint does not match donation fields; not anchoring"
            );
            continue;
        }
        if let Some(task) = settlement.spawn_anchor(&donation) {
            tasks.push(task);
        }
    }

    for task in tasks {
        if let Ok(Some(_)) = task.await {
            sweep.anchored += 1;
        }
    }
    Ok(sweep)
}
