use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Errors raised while fetching or normalizing upstream market data.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid numeric value: {0}")]
    InvalidNumber(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] BrokerError),
}

/// Errors raised by the time-series store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("pool acquire timed out")]
    PoolTimeout,
}

/// Errors raised by the pub/sub broker adapter.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while establishing or servicing a WebSocket connection.
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),

    #[error("unknown data kind: {0}")]
    UnknownKind(String),
}

/// Errors surfaced by the HTTP query layer, mapped directly to response codes.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("store unavailable")]
    Store(#[from] StoreError),
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            QueryError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            QueryError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            QueryError::Store(err) => {
                tracing::error!(error = %err, "query layer store failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
pub type QueryResult<T> = std::result::Result<T, QueryError>;
