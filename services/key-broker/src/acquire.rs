//! Key acquisition endpoint
//!
//! `POST /v1/keys/acquire` hands the caller one key from the pool. The
//! response says whether it came from the pool or the fallback; when neither
//! has a key the caller gets a 503 and should skip or fail its search.

use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::PoolManager;
use tracing::{info, warn};

use crate::metrics;

/// Acquire one key and build the JSON response.
pub async fn acquire_key(pool: &PoolManager, request_id: String) -> Response {
    let start = Instant::now();

    let (status, body) = match pool.acquire().await {
        Some(acquired) => {
            info!(
                request_id = %request_id,
                source = acquired.source.label(),
                key = %common::redact(&acquired.key),
                "key issued"
            );
            (
                StatusCode::OK,
                serde_json::json!({
                    "key": acquired.key,
                    "source": acquired.source.label(),
                    "request_id": request_id,
                }),
            )
        }
        None => {
            warn!(request_id = %request_id, "no credential available");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": {
                        "type": "no_credential_available",
                        "message": "key pool is empty or unreachable and no fallback key is configured",
                    },
                    "request_id": request_id,
                }),
            )
        }
    };

    metrics::record_request("acquire", status.as_u16(), start.elapsed().as_secs_f64());

    (
        status,
        [
            (axum::http::header::CONTENT_TYPE, "application/json"),
            (axum::http::header::CACHE_CONTROL, "no-store"),
        ],
        body.to_string(),
    )
        .into_response()
}
