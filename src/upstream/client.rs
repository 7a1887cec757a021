//! HTTP client for the upstream exchange's public market-data endpoints.
//!
//! Exposes `fetch_klines`/`fetch_depth` with exponential backoff on 429 and
//! 5xx/network failures; other 4xx responses are treated as fatal for that
//! call. One [`UpstreamClient`] (and its single [`RateLimiter`]) is shared
//! across every symbol's collector, bounding the *aggregate* request rate
//! below the upstream API's account-wide quota; per-symbol pacing is
//! already enforced upstream of this client by each collector's own ticker
//! interval (`REALTIME_INTERVAL`/`ORDERBOOK_UPDATE_INTERVAL`).

use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::config::RetryConfig;
use crate::decimal;
use crate::error::IngestError;
use crate::model::PriceLevel;

use super::rate_limiter::RateLimiter;
use super::types::{RawDepthResponse, RawKline};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed kline, still carrying raw decimal strings upstream can express
/// in scientific notation; `normalize_or_zero` is applied by the caller once
/// the field is known not to matter to identity (volume/trade counts),
/// while price fields fail the whole row on invalid input.
#[derive(Debug, Clone)]
pub struct ParsedKline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: rust_decimal::Decimal,
    pub high: rust_decimal::Decimal,
    pub low: rust_decimal::Decimal,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
    pub quote_volume: rust_decimal::Decimal,
    pub trades: i64,
    pub taker_buy_volume: rust_decimal::Decimal,
    pub taker_buy_quote_volume: rust_decimal::Decimal,
}

pub struct UpstreamClient {
    http: Client,
    base_url: String,
    retry: RetryConfig,
    rate_limiter: RateLimiter,
}

impl UpstreamClient {
    pub fn new(base_url: String, retry: RetryConfig) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("marketdata-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build upstream HTTP client");

        Self {
            http,
            base_url,
            retry,
            rate_limiter: RateLimiter::new(),
        }
    }

    /// `GET /api/v3/klines`, at most 1000 rows per call.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<ParsedKline>, IngestError> {
        let url = format!(
            "{}/api/v3/klines?symbol={symbol}&interval=1m&startTime={start_ms}&endTime={end_ms}&limit={limit}",
            self.base_url
        );

        let raw: Vec<RawKline> = self
            .get_with_retry(&url, self.retry.max_retries_klines)
            .await?;

        let mut klines = Vec::with_capacity(raw.len());
        for row in &raw {
            if let Some(kline) = parse_kline(row)? {
                klines.push(kline);
            }
        }
        Ok(klines)
    }

    /// `GET /api/v3/depth`.
    pub async fn fetch_depth(
        &self,
        symbol: &str,
        levels: u32,
    ) -> Result<(i64, Vec<PriceLevel>, Vec<PriceLevel>), IngestError> {
        let url = format!("{}/api/v3/depth?symbol={symbol}&limit={levels}", self.base_url);

        let raw: RawDepthResponse = self
            .get_with_retry(&url, self.retry.max_retries_depth)
            .await?;

        let bids = raw.bids.iter().map(|[p, q]| parse_level(p, q)).collect();
        let asks = raw.asks.iter().map(|[p, q]| parse_level(p, q)).collect();
        Ok((raw.last_update_id, bids, asks))
    }

    async fn get_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        max_retries: u32,
    ) -> Result<T, IngestError> {
        let mut attempt = 0;

        loop {
            self.rate_limiter.wait().await.ok();

            let response = self.http.get(url).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|err| IngestError::UpstreamUnavailable(err.to_string()));
                    }

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempt >= max_retries {
                        return Err(IngestError::UpstreamUnavailable(format!(
                            "upstream returned HTTP {status} for {url}"
                        )));
                    }

                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        status = %status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt >= max_retries {
                        return Err(IngestError::UpstreamUnavailable(err.to_string()));
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(error = %err, attempt, "retrying upstream request after network error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `RETRY_DELAY * 2^attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.retry
                .retry_delay_ms
                .saturating_mul(1u64 << attempt.min(16)),
        )
    }
}

fn parse_level(price: &str, qty: &str) -> PriceLevel {
    PriceLevel {
        price: decimal::normalize_or_zero(price),
        quantity: decimal::normalize_or_zero(qty),
    }
}

/// Parses one upstream kline row. Structural problems (too few fields, a
/// non-numeric open/close time or trade count) are `InvalidNumber`/shape
/// errors that fail the whole call — they mean upstream sent something
/// that isn't a kline at all. A malformed *price* string, by contrast,
/// never surfaces per 4.A's `InvalidNumber` contract: it's substituted with
/// zero, and if the resulting bar fails the OHLC invariant the row is
/// dropped (logged, not propagated) rather than poisoning the whole batch.
fn parse_kline(row: &RawKline) -> Result<Option<ParsedKline>, IngestError> {
    if row.len() < 11 {
        return Err(IngestError::UpstreamUnavailable(
            "kline row has fewer than 11 fields".to_string(),
        ));
    }

    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| IngestError::UpstreamUnavailable("missing open time".to_string()))?;
    let close_time = row[6]
        .as_i64()
        .ok_or_else(|| IngestError::UpstreamUnavailable("missing close time".to_string()))?;
    let trades = row[8]
        .as_i64()
        .ok_or_else(|| IngestError::UpstreamUnavailable("missing trade count".to_string()))?;

    let kline = ParsedKline {
        open_time,
        close_time,
        open: field_decimal(row, 1),
        high: field_decimal(row, 2),
        low: field_decimal(row, 3),
        close: field_decimal(row, 4),
        volume: field_decimal(row, 5),
        quote_volume: field_decimal(row, 7),
        trades,
        taker_buy_volume: field_decimal(row, 9),
        taker_buy_quote_volume: field_decimal(row, 10),
    };

    if kline.low > kline.open.min(kline.close) || kline.open.max(kline.close) > kline.high || kline.low > kline.high {
        tracing::warn!(open_time, "dropping kline row that fails the OHLC invariant after normalization");
        return Ok(None);
    }

    Ok(Some(kline))
}

/// Never fails: an unparseable or non-string price field is substituted
/// with zero and a warning is logged, per 4.A's `InvalidNumber` contract.
fn field_decimal(row: &RawKline, index: usize) -> rust_decimal::Decimal {
    match row[index].as_str() {
        Some(text) => decimal::normalize_or_zero(text),
        None => {
            tracing::warn!(index, "kline price field is not a string, substituting zero");
            rust_decimal::Decimal::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_row() -> RawKline {
        vec![
            json!(1_700_000_000_000i64),
            json!("100.5"),
            json!("103.0"),
            json!("99.0"),
            json!("102.0"),
            json!("5E-8"),
            json!(1_700_000_059_999i64),
            json!("10.0"),
            json!(42),
            json!("2.0"),
            json!("4.0"),
            json!("0"),
        ]
    }

    #[test]
    fn parses_kline_row_with_scientific_notation_volume() {
        let parsed = parse_kline(&sample_row()).unwrap().expect("valid row");
        assert_eq!(parsed.volume.to_string(), "0.00000005");
        assert_eq!(parsed.trades, 42);
    }

    #[test]
    fn rejects_short_rows() {
        assert!(parse_kline(&vec![json!(1)]).is_err());
    }

    #[test]
    fn substitutes_zero_for_unparseable_non_ohlc_field_and_keeps_the_row() {
        let mut row = sample_row();
        row[5] = json!("not-a-number"); // volume: doesn't participate in the OHLC invariant
        let parsed = parse_kline(&row).unwrap().expect("OHLC invariant still holds");
        assert_eq!(parsed.volume, rust_decimal::Decimal::ZERO);
        assert_eq!(parsed.open.to_string(), "100.50000000");
    }

    #[test]
    fn drops_row_that_fails_ohlc_invariant_after_zero_substitution() {
        let mut row = sample_row();
        row[1] = json!("not-a-number"); // open substituted to 0, which falls below low=99
        let parsed = parse_kline(&row).unwrap();
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![sample_row()]))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(
            server.uri(),
            RetryConfig {
                retry_delay_ms: 1,
                max_retries_klines: 5,
                max_retries_depth: 3,
            },
        );

        let result = client
            .fetch_klines("BTCUSDT", 0, 60_000, 1000)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn fatal_on_non_retryable_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(
            server.uri(),
            RetryConfig {
                retry_delay_ms: 1,
                max_retries_klines: 5,
                max_retries_depth: 3,
            },
        );

        let result = client.fetch_klines("BTCUSDT", 0, 60_000, 1000).await;
        assert!(result.is_err());
    }
}
