use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::error::MarketDataError;
use crate::historical::HistoricalAggregator;
use crate::model::Bar;

/// Smallest timeframe the historical route accepts.
pub const MIN_TIMEFRAME_MS: i64 = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<HistoricalAggregator>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad_request: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<MarketDataError> for ApiError {
    fn from(e: MarketDataError) -> Self {
        match e {
            MarketDataError::Config(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Validated path parameters of a historical request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalQuery {
    pub from_ms: i64,
    pub to_ms: i64,
    pub timeframe_secs: i64,
    pub markets: Vec<String>,
}

/// Parse `/{from}/{to}/{timeframeMs}[/{markets}]` segments. `markets` is a
/// `+`-joined list of `EXCHANGE:PAIR` tokens.
pub fn parse_historical_params(
    from: &str,
    to: &str,
    timeframe_ms: &str,
    markets: Option<&str>,
) -> Result<HistoricalQuery, ApiError> {
    let number = |name: &str, raw: &str| -> Result<i64, ApiError> {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| ApiError::BadRequest(format!("{name} must be an integer, got {raw:?}")))
    };
    let from_ms = number("from", from)?;
    let to_ms = number("to", to)?;
    let timeframe_ms = number("timeframe", timeframe_ms)?;

    if timeframe_ms < MIN_TIMEFRAME_MS {
        return Err(ApiError::BadRequest(format!(
            "timeframe must be at least {MIN_TIMEFRAME_MS}ms, got {timeframe_ms}"
        )));
    }
    if from_ms > to_ms {
        return Err(ApiError::BadRequest(format!(
            "from ({from_ms}) must not be after to ({to_ms})"
        )));
    }

    let markets = markets
        .map(|raw| {
            raw.split(['+', ' '])
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(HistoricalQuery {
        from_ms,
        to_ms,
        timeframe_secs: timeframe_ms / 1_000,
        markets,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalResponse {
    pub from: i64,
    pub to: i64,
    pub data: Vec<Bar>,
    pub initial_prices: std::collections::BTreeMap<String, f64>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/historical/{from}/{to}/{timeframe}", get(historical_all))
        .route(
            "/historical/{from}/{to}/{timeframe}/{markets}",
            get(historical_markets),
        )
}

pub fn app(state: AppState) -> Router {
    routes().with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn historical_all(
    State(state): State<AppState>,
    Path((from, to, timeframe)): Path<(String, String, String)>,
) -> Result<Json<HistoricalResponse>, ApiError> {
    let query = parse_historical_params(&from, &to, &timeframe, None)?;
    run_historical(&state, query).await
}

async fn historical_markets(
    State(state): State<AppState>,
    Path((from, to, timeframe, markets)): Path<(String, String, String, String)>,
) -> Result<Json<HistoricalResponse>, ApiError> {
    let query = parse_historical_params(&from, &to, &timeframe, Some(&markets))?;
    run_historical(&state, query).await
}

async fn run_historical(
    state: &AppState,
    query: HistoricalQuery,
) -> Result<Json<HistoricalResponse>, ApiError> {
    tracing::info!(
        from = query.from_ms,
        to = query.to_ms,
        timeframe_secs = query.timeframe_secs,
        markets = query.markets.len(),
        "Historical request"
    );
    let series = state
        .aggregator
        .aggregate(&query.markets, query.from_ms, query.to_ms, query.timeframe_secs)
        .await?;
    Ok(Json(HistoricalResponse {
        from: query.from_ms,
        to: query.to_ms,
        data: series.bars,
        initial_prices: series.initial_prices,
    }))
}
