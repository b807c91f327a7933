use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::bot_manager::BotManagerError;
use crate::bots::config_schema::ConfigError;
use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Every REST error collapses to one of these kinds; the HTTP status
/// mapping lives entirely in `status_code` below (§6's status table).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadInput(String),
    #[error("{0}")]
    BadConfig(String),
    #[error("{0}")]
    BadCron(String),
    #[error("bad credentials")]
    BadCredentials,
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadInput(_) => "BadInput",
            ApiError::BadConfig(_) => "BadConfig",
            ApiError::BadCron(_) => "BadCron",
            ApiError::BadCredentials => "BadCredentials",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Duplicate(_) => "Duplicate",
            ApiError::Gateway(_) => "GatewayError",
            ApiError::Internal(_) => "Internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadInput(_) | ApiError::BadConfig(_) | ApiError::BadCron(_) => StatusCode::BAD_REQUEST,
            ApiError::BadCredentials | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Duplicate(_) => StatusCode::CONFLICT,
            ApiError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error_kind: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(msg) => ApiError::Duplicate(msg),
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Other(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Gateway(other.to_string()),
        }
    }
}

impl From<BotManagerError> for ApiError {
    fn from(e: BotManagerError) -> Self {
        match e {
            BotManagerError::UnknownType(t) => ApiError::BadConfig(format!("unknown bot type: {t}")),
            BotManagerError::BadConfig(msg) => ApiError::BadConfig(msg),
            BotManagerError::Store(e) => e.into(),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        ApiError::BadConfig(e.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::BadCredentials => ApiError::BadCredentials,
            AuthError::Token(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}
