use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type covering the gateway and the analytics pipeline.
///
/// Token rejections are not represented here: the middleware never maps
/// them to distinct HTTP responses (every rejected token degrades
/// uniformly to re-authentication), so they are carried as
/// `token::RejectReason` on the decision event instead. Only a token that
/// cannot be minted or decoded at all surfaces as `MalformedToken`.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Token Errors =====
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    // ===== Broker & Pipeline Errors =====
    #[error("Broker unavailable: {0}")]
    Broker(String),

    #[error("Graph write failure: {0}")]
    GraphWrite(String),

    #[error("Consumer failed to parse message: {0}")]
    ConsumerParse(String),

    // ===== Infrastructure Errors =====
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Graph database error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedToken(_) => StatusCode::UNAUTHORIZED,
            AppError::Broker(_)
            | AppError::Redis(_)
            | AppError::Neo4j(_)
            | AppError::GraphWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConsumerParse(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::MalformedToken(_) => "MALFORMED_TOKEN",
            AppError::Broker(_) | AppError::Redis(_) => "BROKER_ERROR",
            AppError::GraphWrite(_) | AppError::Neo4j(_) => "GRAPH_ERROR",
            AppError::ConsumerParse(_) => "CONSUMER_PARSE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        AppError::Broker(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, error_code = %self.error_code(), "Server error occurred");
        } else {
            tracing::debug!(error = %self, error_code = %self.error_code(), "Client error occurred");
        }

        // Never expose internal details for server errors
        let body = if status.is_server_error() {
            json!({
                "error": "Internal server error",
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        } else {
            json!({
                "error": self.to_string(),
                "error_code": self.error_code(),
                "status": status.as_u16(),
            })
        };

        (status, axum::Json(body)).into_response()
    }
}
