//! Route handlers for the inbound signal API (spec.md §6 "Inbound signal
//! HTTP API"). Grounded on the teacher's `web-api::handlers`
//! extractor-and-`StatusCode`-on-`Result` pattern, generalized from the
//! bot-registry handlers to the signal store.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use hedge_store::Store;
use serde::{Deserialize, Serialize};

use crate::ApiState;

#[derive(Deserialize)]
pub struct SignalRequest {
    pub timestamp: i64,
    pub state: String,
}

#[derive(Serialize)]
pub struct SignalResponse {
    pub success: bool,
    pub market_start: i64,
}

#[derive(Serialize)]
pub struct SignalRowResponse {
    pub market_start: i64,
    pub timestamp: i64,
    pub state: String,
    pub received_at: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
}

impl From<hedge_store::SignalRow> for SignalRowResponse {
    fn from(row: hedge_store::SignalRow) -> Self {
        Self {
            market_start: row.market_start,
            timestamp: row.timestamp,
            state: row.state,
            received_at: row.received_at,
        }
    }
}

fn check_api_key(expected: Option<&str>, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// `POST /api/signal` (spec.md §6). 400 on a missing/mistyped body is
/// produced by axum's `Json` extractor rejecting before this handler runs.
pub async fn post_signal(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<SignalRequest>,
) -> Result<Json<SignalResponse>, StatusCode> {
    check_api_key(state.api_key.as_deref(), &headers)?;

    let market_start = state
        .store
        .insert_signal(req.timestamp, &req.state)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "insert_signal failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(SignalResponse {
        success: true,
        market_start,
    }))
}

/// `GET /api/signal/latest` (spec.md §6).
pub async fn latest_signal(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Option<SignalRowResponse>>, StatusCode> {
    let row = state.store.latest_signal().await.map_err(|e| {
        tracing::error!(error = %e, "latest_signal failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(row.map(SignalRowResponse::from)))
}

/// `GET /api/signal/{market_start}` (spec.md §6).
pub async fn signal_for_market(
    State(state): State<Arc<ApiState>>,
    Path(market_start): Path<i64>,
) -> Result<Json<Option<SignalRowResponse>>, StatusCode> {
    let row = state
        .store
        .get_signal_for_market(market_start)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "get_signal_for_market failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(row.map(SignalRowResponse::from)))
}

/// `GET /api/health` (spec.md §6).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_key_is_allowed_when_none_configured() {
        let headers = HeaderMap::new();
        assert!(check_api_key(None, &headers).is_ok());
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert_eq!(check_api_key(Some("secret"), &headers), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn matching_key_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("secret"));
        assert!(check_api_key(Some("secret"), &headers).is_ok());
    }

    #[tokio::test]
    async fn signal_round_trips_through_handlers() {
        let store = Store::open_in_memory().await.unwrap();
        let state = Arc::new(ApiState { store: Arc::new(store), api_key: None });

        let resp = post_signal(
            State(state.clone()),
            HeaderMap::new(),
            Json(SignalRequest { timestamp: 1_700_000_100, state: "T1ENTRY".to_string() }),
        )
        .await
        .unwrap();
        assert!(resp.0.success);

        let fetched = signal_for_market(State(state.clone()), Path(resp.0.market_start)).await.unwrap();
        assert_eq!(fetched.0.unwrap().state, "T1ENTRY");

        let latest = latest_signal(State(state)).await.unwrap();
        assert_eq!(latest.0.unwrap().market_start, resp.0.market_start);
    }
}
