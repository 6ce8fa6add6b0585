use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    UnauthorizedCaller(String),

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no channel available for model '{0}'")]
    AllChannelsUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// 稳定的错误类别标识，用于日志与对外响应
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UnauthorizedCaller(_) => "unauthorized_caller",
            GatewayError::QuotaExhausted(_) => "quota_exhausted",
            GatewayError::UnknownModel(_) => "unknown_model",
            GatewayError::AllChannelsUnavailable(_) => "all_channels_unavailable",
            GatewayError::Backend(_) | GatewayError::Http(_) => "backend_failure",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Json(_) => "json_error",
            GatewayError::Db(_) => "database_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Config(_) => "config_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnauthorizedCaller(_) => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UnknownModel(_) => StatusCode::NOT_FOUND,
            GatewayError::AllChannelsUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Backend(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            // 客户端主动断开，沿用 nginx 的 499 习惯
            GatewayError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            GatewayError::Json(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Db(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
