//! Axum REST API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::db;
use crate::errors::{Result, SettlementError};
use crate::models::{
    Cause, CauseSummary, CreateIntentRequest, Donation, DonationView, Intent, VerifyRequest,
};
use crate::settlement::Settlement;

/// Header through which the session layer hands over the authenticated donor.
pub const DONOR_HEADER: &str = "x-donor-id";

#[derive(Clone)]
pub struct ApiState {
    pub settlement: Settlement,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/donations/create", post(create_intent))
        .route("/api/donations/verify", post(verify))
        .route("/api/donations/my", get(my_donations))
        .route("/api/donations/:id", get(get_donation))
        .route("/api/causes/:id", get(get_cause))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ledger: &'static str,
}

#[derive(Serialize)]
pub struct IntentResponse {
    pub success: bool,
    #[serde(flatten)]
    pub intent: Intent,
}

#[derive(Serialize)]
pub struct DonationResponse {
    pub success: bool,
    pub message: &'static str,
    pub donation: DonationView,
}

#[derive(Serialize)]
pub struct DonationsResponse {
    pub success: bool,
    pub count: usize,
    pub donations: Vec<DonationView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CauseResponse {
    pub success: bool,
    pub cause: CauseSummary,
    /// Sum of settled donations; `cause.currentAmount` converges to it.
    pub settled_amount: f64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status.is_server_error() {
            error!("Request failed: {self}");
            if self.is_retryable() {
                "Storage temporarily unavailable, please retry".to_string()
            } else {
                "Server error".to_string()
            }
        } else {
            self.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                success: false,
                message,
            }),
        )
            .into_response()
    }
}

/// Donor identity supplied by the upstream session layer.
pub struct AuthenticatedDonor(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedDonor {
    type Rejection = SettlementError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .headers
            .get(DONOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
            .ok_or(SettlementError::Unauthenticated)
    }
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|e| SettlementError::Validation(e.body_text()))
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ledger: if state.settlement.ledger().is_available() {
            "available"
        } else {
            "unavailable"
        },
    })
}

/// `POST /api/donations/create`
///
/// Creates a `PENDING` donation for the authenticated donor.
pub async fn create_intent(
    State(state): State<Arc<ApiState>>,
    AuthenticatedDonor(donor_id): AuthenticatedDonor,
    payload: std::result::Result<Json<CreateIntentRequest>, JsonRejection>,
) -> Result<Json<IntentResponse>> {
    let intent = state
        .settlement
        .create_intent(&donor_id, body(payload)?)
        .await?;
    Ok(Json(IntentResponse {
        success: true,
        intent,
    }))
}

/// `POST /api/donations/verify`
///
/// Payment gateway callback. Applies the verdict and returns the settled
/// donation, including its fingerprint and (when already available) the
/// ledger reference.
pub async fn verify(
    State(state): State<Arc<ApiState>>,
    payload: std::result::Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<DonationResponse>> {
    let donation = state.settlement.verify(body(payload)?).await?;
    let cause = db::find_cause(state.settlement.pool(), &donation.cause_id).await?;
    let message = match donation.hash {
        Some(_) => "Donation verified",
        None => "Donation marked as failed",
    };
    Ok(Json(DonationResponse {
        success: true,
        message,
        donation: DonationView::new(donation, cause),
    }))
}

/// `GET /api/donations/my`
///
/// The authenticated donor's donations, newest first.
pub async fn my_donations(
    State(state): State<Arc<ApiState>>,
    AuthenticatedDonor(donor_id): AuthenticatedDonor,
) -> Result<Json<DonationsResponse>> {
    let pool = state.settlement.pool();
    let donations = db::donations_for_donor(pool, &donor_id).await?;
    let views = with_causes(pool, donations).await?;
    Ok(Json(DonationsResponse {
        success: true,
        count: views.len(),
        donations: views,
    }))
}

/// `GET /api/donations/:id`
pub async fn get_donation(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<String>,
) -> Result<Json<DonationResponse>> {
    let pool = state.settlement.pool();
    let donation = db::find_donation(pool, &donation_id)
        .await?
        .ok_or(SettlementError::NotFound("Donation"))?;
    let cause = db::find_cause(pool, &donation.cause_id).await?;
    Ok(Json(DonationResponse {
        success: true,
        message: "Donation found",
        donation: DonationView::new(donation, cause),
    }))
}

/// `GET /api/causes/:id`
pub async fn get_cause(
    State(state): State<Arc<ApiState>>,
    Path(cause_id): Path<String>,
) -> Result<Json<CauseResponse>> {
    let pool = state.settlement.pool();
    let cause = db::find_cause(pool, &cause_id)
        .await?
        .ok_or(SettlementError::NotFound("Cause"))?;
    let settled_amount = db::settled_total(pool, &cause_id).await?;
    Ok(Json(CauseResponse {
        success: true,
        cause: cause.into(),
        settled_amount,
    }))
}

/// Attach cause summaries, loading each cause once.
async fn with_causes(pool: &sqlx::SqlitePool, donations: Vec<Donation>) -> Result<Vec<DonationView>> {
    let mut causes: HashMap<String, Option<Cause>> = HashMap::new();
    let mut views = Vec::with_capacity(donations.len());
    for donation in donations {
        if !causes.contains_key(&donation.cause_id) {
            let cause = db::find_cause(pool, &donation.cause_id).await?;
            causes.insert(donation.cause_id.clone(), cause);
        }
        let cause = causes.get(&donation.cause_id).cloned().flatten();
        views.push(DonationView::new(donation, cause));
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use crate::ledger::LedgerMirror;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    async fn app() -> (TempDir, Router) {
        let (dir, pool) = testing::pool().await;
        testing::cause(&pool, "c1", 1000.0).await;
        let settlement = Settlement::new(pool, LedgerMirror::Unavailable, Duration::from_millis(50));
        (dir, router(Arc::new(ApiState { settlement })))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, donor: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(donor) = donor {
            builder = builder.header(DONOR_HEADER, donor);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, donor: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(donor) = donor {
            builder = builder.header(DONOR_HEADER, donor);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ledger_availability() {
        let (_dir, app) = app().await;
        let (status, body) = call(&app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ledger"], "unavailable");
    }

    #[tokio::test]
    async fn intent_then_verify_settles_donation() {
        let (_dir, app) = app().await;

        let (status, intent) = call(
            &app,
            post_json(
                "/api/donations/create",
                Some("D1"),
                json!({ "causeId": "c1", "amount": 500 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(intent["success"], true);
        let donation_id = intent["donationId"].as_str().unwrap().to_string();
        assert!(intent["orderId"].as_str().unwrap().starts_with("order_"));

        let (status, verified) = call(
            &app,
            post_json(
                "/api/donations/verify",
                None,
                json!({
                    "donationId": donation_id,
                    "status": "SUCCESS",
                    "txDetails": { "mock": true }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let donation = &verified["donation"];
        assert_eq!(donation["status"], "SUCCESS");
        assert_eq!(donation["amount"], 500.0);
        let hash = donation["hash"].as_str().unwrap();
        assert!(hash.starts_with("0x"));
        assert_eq!(hash.len(), 66);
        assert!(donation["ledgerTx"].is_null());
        assert_eq!(donation["cause"]["currentAmount"], 500.0);
        assert_eq!(donation["cause"]["requiredAmount"], 1000.0);

        let (status, cause) = call(&app, get("/api/causes/c1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cause["settledAmount"], 500.0);
        assert_eq!(cause["cause"]["currentAmount"], 500.0);

        let (status, history) = call(&app, get("/api/donations/my", Some("D1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 1);
        assert_eq!(history["donations"][0]["hash"], hash);

        let (status, single) =
            call(&app, get(&format!("/api/donations/{donation_id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(single["donation"]["hash"], hash);
    }

    #[tokio::test]
    async fn intent_requires_donor_identity() {
        let (_dir, app) = app().await;
        let (status, body) = call(
            &app,
            post_json("/api/donations/create", None, json!({ "causeId": "c1", "amount": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (_dir, app) = app().await;

        let (status, body) = call(
            &app,
            post_json("/api/donations/create", Some("D1"), json!({ "causeId": "c1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "causeId and amount required");

        let (status, _) = call(
            &app,
            post_json(
                "/api/donations/create",
                Some("D1"),
                json!({ "causeId": "missing", "amount": 5 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            post_json(
                "/api/donations/verify",
                None,
                json!({ "donationId": "missing", "status": "SUCCESS" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Donation not found");

        let (status, _) = call(
            &app,
            post_json("/api/donations/verify", None, json!({ "donationId": 7 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_then_success_is_conflict() {
        let (_dir, app) = app().await;
        let (_, intent) = call(
            &app,
            post_json(
                "/api/donations/create",
                Some("D1"),
                json!({ "causeId": "c1", "amount": 20 }),
            ),
        )
        .await;
        let donation_id = intent["donationId"].as_str().unwrap();

        let (status, failed) = call(
            &app,
            post_json(
                "/api/donations/verify",
                None,
                json!({ "donationId": donation_id, "status": "FAILED" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(failed["message"], "Donation marked as failed");
        assert!(failed["donation"]["hash"].is_null());

        let (status, body) = call(
            &app,
            post_json(
                "/api/donations/verify",
                None,
                json!({ "donationId": donation_id, "status": "SUCCESS" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, cause) = call(&app, get("/api/causes/c1", None)).await;
        assert_eq!(cause["cause"]["currentAmount"], 0.0);
    }
}
