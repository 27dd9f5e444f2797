//! Fund aggregation — adds a settled donation's amount to its cause total.
//!
//! The donation's `aggregated` flag and the cause increment change together
//! in one transaction, and the flag flip is conditional. Whichever caller
//! flips it (the verify path or a reconciler sweep) is the only one that adds
//! the amount; every other caller sees zero rows and adds nothing.

use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::{Result, SettlementError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// The amount was added by this call.
    Applied,
    /// Another call already added it, or the donation is not settled.
    AlreadyApplied,
}

/// Add `amount` to `cause_id`'s running total on behalf of `donation_id`.
pub async fn aggregate(
    pool: &SqlitePool,
    donation_id: &str,
    cause_id: &str,
    amount: f64,
) -> Result<Aggregation> {
    // The first statement is a write, so SQLite takes the write lock up front
    // and concurrent aggregations queue on the busy timeout instead of failing
    // a lock upgrade.
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE donations
        SET    aggregated = 1
        WHERE  id = ?1 AND cause_id = ?2 AND status = 'SUCCESS' AND aggregated = 0
        "#,
    )
    .bind(donation_id)
    .bind(cause_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        tx.rollback().await?;
        debug!(donation_id, "Aggregation already applied");
        return Ok(Aggregation::AlreadyApplied);
    }

    let updated = sqlx::query(
        r#"
        UPDATE causes
        SET    current_amount = current_amount + ?2
        WHERE  id = ?1
        "#,
    )
    .bind(cause_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Err(SettlementError::NotFound("Cause"));
    }

    tx.commit().await?;
    debug!(donation_id, cause_id, amount, "Cause total increased");
    Ok(Aggregation::Applied)
}
