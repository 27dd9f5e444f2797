//! Database layer — pool setup, migrations, and donation / cause queries.
//!
//! Every state change on a donation is a single conditional `UPDATE` whose
//! `WHERE` clause encodes the transition it is allowed to make. Callers learn
//! whether they won the transition from `rows_affected`, never from a prior
//! read.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::Result;
use crate::hasher::Fingerprint;
use crate::models::{Cause, Donation, DonationRow, GatewayStatus};

const DONATION_COLUMNS: &str = "id, donor_id, cause_id, amount, order_id, status, raw_response, \
                                hash, ledger_tx, aggregated, created_at";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Causes
// ─────────────────────────────────────────────────────────

/// Insert a cause unless one with the same id exists. Returns `true` on insert.
pub async fn insert_cause(pool: &SqlitePool, cause: &Cause) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO causes (id, title, required_amount, current_amount, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&cause.id)
    .bind(&cause.title)
    .bind(cause.required_amount)
    .bind(cause.current_amount)
    .bind(cause.created_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub async fn find_cause(pool: &SqlitePool, cause_id: &str) -> Result<Option<Cause>> {
    let cause = sqlx::query_as::<_, Cause>(
        r#"
        SELECT id, title, required_amount, current_amount, created_at
        FROM   causes
        WHERE  id = ?1
        "#,
    )
    .bind(cause_id)
    .fetch_optional(pool)
    .await?;
    Ok(cause)
}

/// Sum of all settled donations for a cause. `causes.current_amount`
/// converges to this value.
pub async fn settled_total(pool: &SqlitePool, cause_id: &str) -> Result<f64> {
    let (total,): (f64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0.0)
        FROM   donations
        WHERE  cause_id = ?1 AND status = 'SUCCESS'
        "#,
    )
    .bind(cause_id)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

// ─────────────────────────────────────────────────────────
// Donation writes
// ─────────────────────────────────────────────────────────

pub async fn insert_donation(pool: &SqlitePool, donation: &Donation) -> Result<()> {
    let raw_response = donation
        .gateway
        .raw_response
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO donations
            (id, donor_id, cause_id, amount, order_id, status, raw_response,
             hash, ledger_tx, aggregated, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&donation.id)
    .bind(&donation.donor_id)
    .bind(&donation.cause_id)
    .bind(donation.amount)
    .bind(&donation.gateway.order_id)
    .bind(donation.gateway.status.as_str())
    .bind(raw_response)
    .bind(donation.hash.map(|h| h.to_string()))
    .bind(&donation.ledger_tx)
    .bind(donation.aggregated)
    .bind(donation.created_at.timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

/// `PENDING → SUCCESS`: record the payload and the fingerprint in one step.
///
/// Only succeeds while the donation is still `PENDING` with no hash, so of
/// any number of concurrent callers exactly one gets `true`.
pub async fn claim_success(
    pool: &SqlitePool,
    donation_id: &str,
    hash: &Fingerprint,
    raw_response: &serde_json::Value,
) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'SUCCESS', hash = ?2, raw_response = ?3
        WHERE  id = ?1 AND status = 'PENDING' AND hash IS NULL
        "#,
    )
    .bind(donation_id)
    .bind(hash.to_string())
    .bind(serde_json::to_string(raw_response)?)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

/// `PENDING → FAILED`.
pub async fn mark_failed(
    pool: &SqlitePool,
    donation_id: &str,
    raw_response: &serde_json::Value,
) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE donations
        SET    status = ?2, raw_response = ?3
        WHERE  id = ?1 AND status = 'PENDING'
        "#,
    )
    .bind(donation_id)
    .bind(GatewayStatus::Failed.as_str())
    .bind(serde_json::to_string(raw_response)?)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

/// Store the ledger reference unless one is already present.
pub async fn set_ledger_tx(pool: &SqlitePool, donation_id: &str, ledger_tx: &str) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE donations
        SET    ledger_tx = ?2
        WHERE  id = ?1 AND ledger_tx IS NULL
        "#,
    )
    .bind(donation_id)
    .bind(ledger_tx)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

// ─────────────────────────────────────────────────────────
// Donation reads
// ─────────────────────────────────────────────────────────

pub async fn find_donation(pool: &SqlitePool, donation_id: &str) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"
    ))
    .bind(donation_id)
    .fetch_optional(pool)
    .await?;
    row.map(Donation::try_from).transpose()
}

/// All donations made by `donor_id`, newest first.
pub async fn donations_for_donor(pool: &SqlitePool, donor_id: &str) -> Result<Vec<Donation>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE donor_id = ?1 \
         ORDER BY created_at DESC, id DESC"
    ))
    .bind(donor_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}

/// Settled donations that still lack a ledger reference, oldest first.
pub async fn unanchored_donations(pool: &SqlitePool, limit: u32) -> Result<Vec<Donation>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations \
         WHERE status = 'SUCCESS' AND hash IS NOT NULL AND ledger_tx IS NULL \
         ORDER BY created_at ASC LIMIT ?1"
    ))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}

/// Settled donations whose amount never reached the cause total, ordered by
/// `(created_at, id)` and starting strictly after `after` when given.
pub async fn unaggregated_donations(
    pool: &SqlitePool,
    after: Option<(i64, &str)>,
    limit: u32,
) -> Result<Vec<Donation>> {
    let (after_ms, after_id) = after.unzip();
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations \
         WHERE status = 'SUCCESS' AND aggregated = 0 \
           AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND id > ?3)) \
         ORDER BY created_at ASC, id ASC LIMIT ?1"
    ))
    .bind(i64::from(limit))
    .bind(after_ms)
    .bind(after_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing;
    use super::*;
    use crate::models::GatewayRecord;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn pending(id: &str, cause_id: &str, amount: f64) -> Donation {
        Donation {
            id: id.to_string(),
            donor_id: "donor-1".into(),
            cause_id: cause_id.to_string(),
            amount,
            gateway: GatewayRecord {
                order_id: format!("order_{id}"),
                status: GatewayStatus::Pending,
                raw_response: None,
            },
            hash: None,
            ledger_tx: None,
            aggregated: false,
            created_at: DateTime::<Utc>::from_timestamp_millis(1_704_067_200_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn donation_round_trips_through_store() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        let donation = pending("d1", "c1", 12.5);
        insert_donation(&pool, &donation).await.unwrap();

        let loaded = find_donation(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(loaded, donation);
        assert!(find_donation(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn donation_requires_existing_cause() {
        let (_dir, pool) = testing::pool().await;
        let err = insert_donation(&pool, &pending("d1", "nope", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::errors::SettlementError::Database(_)));
    }

    #[tokio::test]
    async fn success_can_be_claimed_once() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        let donation = pending("d1", "c1", 500.0);
        insert_donation(&pool, &donation).await.unwrap();
        let hash = crate::hasher::fingerprint(&donation);

        assert!(claim_success(&pool, "d1", &hash, &json!({"n": 1})).await.unwrap());
        assert!(!claim_success(&pool, "d1", &hash, &json!({"n": 2})).await.unwrap());
        assert!(!mark_failed(&pool, "d1", &json!({})).await.unwrap());

        let loaded = find_donation(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(loaded.gateway.status, GatewayStatus::Success);
        assert_eq!(loaded.hash, Some(hash));
        assert_eq!(loaded.gateway.raw_response, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn failed_donation_cannot_be_claimed() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        let donation = pending("d1", "c1", 500.0);
        insert_donation(&pool, &donation).await.unwrap();

        assert!(mark_failed(&pool, "d1", &json!({"reason": "declined"})).await.unwrap());
        let hash = crate::hasher::fingerprint(&donation);
        assert!(!claim_success(&pool, "d1", &hash, &json!({})).await.unwrap());

        let loaded = find_donation(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(loaded.gateway.status, GatewayStatus::Failed);
        assert!(loaded.hash.is_none());
    }

    #[tokio::test]
    async fn ledger_reference_is_never_overwritten() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        insert_donation(&pool, &pending("d1", "c1", 1.0)).await.unwrap();

        assert!(set_ledger_tx(&pool, "d1", "0xaaa").await.unwrap());
        assert!(!set_ledger_tx(&pool, "d1", "0xbbb").await.unwrap());
        let loaded = find_donation(&pool, "d1").await.unwrap().unwrap();
        assert_eq!(loaded.ledger_tx.as_deref(), Some("0xaaa"));
    }

    #[tokio::test]
    async fn sweeps_only_pick_settled_donations() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        for id in ["d1", "d2", "d3"] {
            insert_donation(&pool, &pending(id, "c1", 10.0)).await.unwrap();
        }
        let settled = pending("d1", "c1", 10.0);
        claim_success(&pool, "d1", &crate::hasher::fingerprint(&settled), &json!({}))
            .await
            .unwrap();
        mark_failed(&pool, "d2", &json!({})).await.unwrap();

        let unanchored = unanchored_donations(&pool, 10).await.unwrap();
        assert_eq!(unanchored.len(), 1);
        assert_eq!(unanchored[0].id, "d1");

        let unaggregated = unaggregated_donations(&pool, None, 10).await.unwrap();
        assert_eq!(unaggregated.len(), 1);
        assert_eq!(settled_total(&pool, "c1").await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn unaggregated_scan_resumes_after_cursor() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        for (id, millis) in [("d1", 1_000), ("d2", 1_000), ("d3", 2_000)] {
            let mut donation = pending(id, "c1", 10.0);
            donation.created_at = DateTime::<Utc>::from_timestamp_millis(millis).unwrap();
            insert_donation(&pool, &donation).await.unwrap();
            claim_success(&pool, id, &crate::hasher::fingerprint(&donation), &json!({}))
                .await
                .unwrap();
        }

        let first = unaggregated_donations(&pool, None, 1).await.unwrap();
        assert_eq!(first[0].id, "d1");

        let rest = unaggregated_donations(&pool, Some((1_000, "d1")), 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["d2", "d3"]);

        assert!(unaggregated_donations(&pool, Some((2_000, "d3")), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn donor_history_is_newest_first() {
        let (_dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        let mut older = pending("d1", "c1", 1.0);
        older.created_at = DateTime::<Utc>::from_timestamp_millis(1_000).unwrap();
        let newer = pending("d2", "c1", 2.0);
        insert_donation(&pool, &older).await.unwrap();
        insert_donation(&pool, &newer).await.unwrap();

        let history = donations_for_donor(&pool, "donor-1").await.unwrap();
        let ids: Vec<_> = history.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["d2", "d1"]);
        assert!(donations_for_donor(&pool, "someone-else").await.unwrap().is_empty());
    }
}
