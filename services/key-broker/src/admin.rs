//! Admin API for key provisioning
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is not meant to be
//! exposed beyond the host or cluster.
//!
//! Endpoints:
//! - `GET /admin/keys` lists keys (redacted) with usage and reset date
//! - `POST /admin/keys` provisions a key: `{"key": "..."}`
//! - `POST /admin/reset-check` runs the monthly reset check now
//! - `GET /admin/pool` returns the pool health summary

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::{PoolManager, ResetOutcome};
use key_store::StoreError;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<PoolManager>,
}

impl AdminState {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(add_key))
        .route("/admin/reset-check", post(reset_check))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/keys: list every key with its usage.
///
/// Never exposes full keys; each is shown as a fingerprint of its last four
/// characters.
async fn list_keys(State(state): State<AdminState>) -> impl IntoResponse {
    match state.pool.records().await {
        Ok(records) => {
            let keys: Vec<serde_json::Value> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "key": common::redact(&r.identifier),
                        "usage_count": r.usage_count,
                        "last_reset": r.last_reset.map(|d| d.to_string()),
                    })
                })
                .collect();
            json_response(StatusCode::OK, serde_json::json!({ "keys": keys }))
        }
        Err(e) => {
            warn!(error = %e, "failed to list keys");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": format!("failed to list keys: {e}") }),
            )
        }
    }
}

/// Request body for the provisioning endpoint.
#[derive(Deserialize)]
struct AddKeyRequest {
    key: String,
}

/// POST /admin/keys: add a key to the pool.
///
/// 201 when the key is new, 200 when it was already provisioned (its usage
/// count is left alone), 400 for a blank key, 503 when the store fails.
async fn add_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddKeyRequest>,
) -> impl IntoResponse {
    let fingerprint = common::redact(body.key.trim());
    match state.pool.add_key(&body.key).await {
        Ok(true) => {
            info!(key = %fingerprint, "key provisioned via admin API");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "key": fingerprint, "status": "added" }),
            )
        }
        Ok(false) => json_response(
            StatusCode::OK,
            serde_json::json!({ "key": fingerprint, "status": "exists" }),
        ),
        Err(key_pool::Error::Store(StoreError::Invalid(msg))) => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": msg }),
        ),
        Err(e) => {
            warn!(key = %fingerprint, error = %e, "failed to provision key");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": format!("failed to provision key: {e}") }),
            )
        }
    }
}

/// POST /admin/reset-check: run the monthly reset check immediately.
///
/// Useful after a long-running broker crosses a month boundary with the
/// default startup-only reset policy.
async fn reset_check(State(state): State<AdminState>) -> impl IntoResponse {
    match state.pool.check_reset().await {
        Ok(outcome) => {
            let mut body = serde_json::json!({ "outcome": outcome.label() });
            match outcome {
                ResetOutcome::Reset { date, records } => {
                    info!(%date, records, "usage reset via admin API");
                    body["date"] = serde_json::Value::String(date.to_string());
                    body["records"] = serde_json::Value::from(records);
                }
                ResetOutcome::AlreadyReset(date) => {
                    body["date"] = serde_json::Value::String(date.to_string());
                }
                ResetOutcome::NotDue => {}
            }
            json_response(StatusCode::OK, body)
        }
        Err(e) => {
            warn!(error = %e, "reset check via admin API failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": format!("reset check failed: {e}") }),
            )
        }
    }
}

/// GET /admin/pool: pool status summary (same shape as the health endpoint).
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.pool.health().await)
}
