//! Documents the schema [`super::PgStore`] assumes already exists.
//!
//! SQL schema bootstrap tooling is out of scope for this crate; an operator
//! runs their own migration against [`DDL`] (or an equivalent) before this
//! process connects.

pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    open_time BIGINT NOT NULL,
    close_time BIGINT NOT NULL,
    open NUMERIC NOT NULL,
    high NUMERIC NOT NULL,
    low NUMERIC NOT NULL,
    close NUMERIC NOT NULL,
    volume NUMERIC NOT NULL,
    quote_volume NUMERIC NOT NULL,
    trades BIGINT NOT NULL,
    taker_buy_volume NUMERIC NOT NULL,
    taker_buy_quote_volume NUMERIC NOT NULL,
    PRIMARY KEY (symbol, timestamp)
);

CREATE TABLE IF NOT EXISTS orderbook_data (
    symbol TEXT NOT NULL,
    timestamp BIGINT NOT NULL,
    last_update_id BIGINT NOT NULL,
    bids JSONB NOT NULL,
    asks JSONB NOT NULL,
    PRIMARY KEY (symbol, timestamp)
);

CREATE TABLE IF NOT EXISTS collector_state (
    symbol TEXT PRIMARY KEY,
    last_timestamp BIGINT NOT NULL,
    is_realtime BOOLEAN NOT NULL,
    last_updated TIMESTAMPTZ NOT NULL
);
"#;
