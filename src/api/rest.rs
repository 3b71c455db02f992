// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only view of the pipeline for dashboards.  All endpoints live under
// `/api/v1/` and never write either store.
//
// CORS is configured permissively; the API exposes market data only.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::types::{Candle, IndicatorSnapshot};

/// Candles returned when `limit` is not given.
const DEFAULT_CANDLE_LIMIT: usize = 500;
/// Upper bound on `limit`.
const MAX_CANDLE_LIMIT: usize = 5_000;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/candles/:symbol", get(candles))
        .route("/api/v1/latest/:symbol", get(latest))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health())
}

// =============================================================================
// Symbols
// =============================================================================

#[derive(Serialize)]
struct SymbolsResponse {
    symbols: Vec<String>,
    candle_sec: u64,
}

async fn symbols(State(state): State<Arc<AppState>>) -> Json<SymbolsResponse> {
    Json(SymbolsResponse {
        symbols: state.config.symbols.clone(),
        candle_sec: state.config.candle_sec,
    })
}

// =============================================================================
// Candle history
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct CandlesQuery {
    limit: Option<usize>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandlesQuery>,
) -> Result<Json<Vec<Candle>>, ApiError> {
    let symbol = symbol.to_lowercase();
    let limit = query.limit.unwrap_or(DEFAULT_CANDLE_LIMIT).clamp(1, MAX_CANDLE_LIMIT);

    state
        .store
        .read_recent(&symbol, limit)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(symbol = %symbol, error = %e, "candle history read failed");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "candle store unavailable")
        })
}

// =============================================================================
// Latest indicators
// =============================================================================

async fn latest(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<IndicatorSnapshot>, ApiError> {
    let symbol = symbol.to_lowercase();
    match state.cache.get(&symbol).await {
        Ok(Some(snapshot)) => Ok(Json(snapshot)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no indicator snapshot for {symbol}"),
        )),
        Err(e) => {
            warn!(symbol = %symbol, error = %format!("{e:#}"), "latest cache read failed");
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "latest cache unavailable"))
        }
    }
}
