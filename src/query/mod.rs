//! REST query layer over the store and the hub's aggregator: `/health`,
//! `/symbols`, `/candles`, `/orderbook`, `/price`. Every handler converts
//! its `QueryError` into an HTTP response per `crate::error`'s
//! `IntoResponse` impl — no stack traces ever reach a client.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::aggregator::parse_timeframe_minutes;
use crate::error::{QueryError, QueryResult};
use crate::hub::Hub;
use crate::model::Candle;
use crate::store::PgStore;

const MIN_LIMIT: i64 = 1;
const MAX_LIMIT: i64 = 5000;
const DEFAULT_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgStore>,
    pub hub: Hub,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/symbols", get(symbols))
        .route("/candles", get(candles))
        .route("/orderbook", get(orderbook))
        .route("/price", get(price))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.store.health().await.is_ok();
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": Utc::now().timestamp_millis(),
        "database": if healthy { "ok" } else { "unavailable" },
    }))
}

async fn symbols(State(state): State<AppState>) -> QueryResult<impl IntoResponse> {
    let symbols = state.store.get_symbols().await?;
    Ok(Json(json!({ "symbols": symbols })))
}

#[derive(Debug, Deserialize)]
struct CandlesQuery {
    symbol: String,
    timeframe: String,
    limit: Option<i64>,
    start_date: Option<String>,
}

async fn candles(
    State(state): State<AppState>,
    Query(query): Query<CandlesQuery>,
) -> QueryResult<impl IntoResponse> {
    let timeframe_minutes = parse_timeframe_minutes(&query.timeframe)
        .ok_or_else(|| QueryError::BadRequest(format!("unknown timeframe: {}", query.timeframe)))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
        return Err(QueryError::BadRequest(format!(
            "limit must be between {MIN_LIMIT} and {MAX_LIMIT}"
        )));
    }

    let start_ms = query.start_date.as_deref().map(parse_iso8601_ms).transpose()?;
    let symbol = query.symbol.to_uppercase();

    let candles = state
        .store
        .get_candles(&symbol, timeframe_minutes, start_ms, limit)
        .await?;
    Ok(Json(candles))
}

#[derive(Debug, Deserialize)]
struct OrderbookQuery {
    symbol: String,
    levels: Option<u32>,
}

async fn orderbook(
    State(state): State<AppState>,
    Query(query): Query<OrderbookQuery>,
) -> QueryResult<impl IntoResponse> {
    let levels = query.levels.unwrap_or(20);
    if !matches!(levels, 5 | 10 | 20) {
        return Err(QueryError::BadRequest(format!("unsupported levels: {levels}")));
    }

    let symbol = query.symbol.to_uppercase();
    let snapshot = state
        .store
        .get_orderbook_latest(&symbol, levels as usize)
        .await?
        .ok_or(QueryError::NotFound)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    symbol: String,
    timeframe: String,
}

#[derive(Debug, Serialize)]
struct PriceResponse {
    symbol: String,
    timeframe: String,
    current_price: Decimal,
    previous_price: Decimal,
    change_absolute: Decimal,
    change_percent: Decimal,
    trend: &'static str,
    timestamp: i64,
    volume: Decimal,
}

async fn price(
    State(state): State<AppState>,
    Query(query): Query<PriceQuery>,
) -> QueryResult<impl IntoResponse> {
    let timeframe_minutes = parse_timeframe_minutes(&query.timeframe)
        .ok_or_else(|| QueryError::BadRequest(format!("unknown timeframe: {}", query.timeframe)))?;
    let symbol = query.symbol.to_uppercase();

    let (current, previous) = match state.hub.current_partial(&symbol, timeframe_minutes).await {
        Some(partial) => {
            let previous = state
                .store
                .get_latest_candles(&symbol, timeframe_minutes, 1)
                .await?
                .into_iter()
                .next();
            (Some(partial), previous)
        }
        None => {
            let mut recent = state
                .store
                .get_latest_candles(&symbol, timeframe_minutes, 2)
                .await?;
            let current = recent.pop();
            let previous = recent.pop();
            (current, previous)
        }
    };

    let current = current.ok_or(QueryError::NotFound)?;
    // A symbol with exactly one closed candle and no in-progress partial
    // has no prior bar to compare against: report zero change rather than
    // failing the request.
    let previous = previous.unwrap_or_else(|| current.clone());

    Ok(Json(price_response(&symbol, &query.timeframe, &current, &previous)))
}

fn price_response(symbol: &str, timeframe_label: &str, current: &Candle, previous: &Candle) -> PriceResponse {
    let change_absolute = (current.close - previous.close).round_dp(2);
    let change_percent = if previous.close.is_zero() {
        Decimal::ZERO
    } else {
        ((current.close - previous.close) / previous.close * Decimal::ONE_HUNDRED).round_dp(2)
    };
    let trend = if change_absolute > Decimal::ZERO {
        "up"
    } else if change_absolute < Decimal::ZERO {
        "down"
    } else {
        "neutral"
    };

    PriceResponse {
        symbol: symbol.to_string(),
        timeframe: timeframe_label.to_string(),
        current_price: current.close,
        previous_price: previous.close,
        change_absolute,
        change_percent,
        trend,
        timestamp: current.timestamp,
        volume: current.volume,
    }
}

fn parse_iso8601_ms(raw: &str) -> QueryResult<i64> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| QueryError::BadRequest(format!("invalid start_date: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: &str, volume: &str, timestamp: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            open_time: timestamp,
            close_time: timestamp + 59_999,
            open: close.parse().unwrap(),
            high: close.parse().unwrap(),
            low: close.parse().unwrap(),
            close: close.parse().unwrap(),
            volume: volume.parse().unwrap(),
            quote_volume: volume.parse().unwrap(),
            trades: 1,
            taker_buy_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            timestamp,
        }
    }

    #[test]
    fn price_endpoint_matches_documented_scenario() {
        let current = candle("105654.78", "10", 1_000);
        let previous = candle("105200.45", "8", 0);
        let response = price_response("BTCUSDT", "1H", &current, &previous);

        assert_eq!(response.trend, "up");
        assert_eq!(response.change_absolute.to_string(), "454.33");
        assert_eq!(response.change_percent.to_string(), "0.43");
    }

    #[test]
    fn neutral_trend_on_unchanged_close() {
        let current = candle("100", "1", 60_000);
        let previous = candle("100", "1", 0);
        let response = price_response("ETHUSDT", "5", &current, &previous);
        assert_eq!(response.trend, "neutral");
        assert_eq!(response.change_absolute, Decimal::ZERO);
    }

    #[test]
    fn rejects_start_date_that_is_not_rfc3339() {
        assert!(parse_iso8601_ms("not-a-date").is_err());
    }

    #[test]
    fn parses_valid_start_date() {
        assert_eq!(parse_iso8601_ms("2025-01-01T00:00:00Z").unwrap(), 1_735_689_600_000);
    }
}
