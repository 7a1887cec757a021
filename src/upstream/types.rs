//! Wire shapes for the upstream exchange REST API.

use serde::Deserialize;

/// One row of `GET /api/v3/klines`:
/// `[openTime, o, h, l, c, vol, closeTime, quoteVol, trades, takerBuyBase, takerBuyQuote, ignored]`.
pub type RawKline = Vec<serde_json::Value>;

#[derive(Debug, Deserialize)]
pub struct RawDepthResponse {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}
