//! Donation settlement service — entry point.
//!
//! Serves the intent / verify REST API over SQLite, mirrors settled donation
//! fingerprints to the on-chain DonationRegistry when configured, and runs a
//! background reconciler that finishes any settlement follow-up a verify call
//! left incomplete.

mod api;
mod config;
mod db;
mod errors;
mod funds;
mod hasher;
mod ledger;
mod models;
mod reconciler;
mod settlement;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use ledger::LedgerMirror;
use models::Cause;
use reconciler::ReconcilerState;
use settlement::Settlement;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    if config.seed_demo_causes {
        seed_demo_causes(&pool).await?;
    }

    let ledger = LedgerMirror::from_config(config.ledger.as_ref(), config.ledger_timeout).await;
    let settlement = Settlement::new(pool, ledger, config.ledger_inline_wait);

    // ─── Background reconciler ────────────────────────────
    let shutdown = CancellationToken::new();
    let reconciler = tokio::spawn(reconciler::run(
        ReconcilerState {
            settlement: settlement.clone(),
            interval: config.reconcile_interval,
            batch: config.reconcile_batch,
        },
        shutdown.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(api::ApiState { settlement }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    reconciler.await?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// Insert a few causes for local development. Existing rows are left alone.
async fn seed_demo_causes(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    let now = Utc::now().timestamp_millis();
    let demo = [
        ("demo-clean-water", "Clean water wells", 5_000.0),
        ("demo-school-meals", "School meal programme", 12_000.0),
        ("demo-flood-relief", "Flood relief kits", 8_500.0),
    ];

    let mut inserted = 0;
    for (id, title, required_amount) in demo {
        let cause = Cause {
            id: id.to_string(),
            title: title.to_string(),
            required_amount,
            current_amount: 0.0,
            created_at: now,
        };
        if db::insert_cause(pool, &cause).await? {
            inserted += 1;
        }
    }
    info!(inserted, "Demo causes seeded");
    Ok(())
}
