//! Application error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tr_core::auth::{AuthError, StoreError};
use tracing::{error, warn};

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// HTTP-facing errors. Bodies are short plain-text messages.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("API key required")]
    ApiKeyRequired,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("user already exists")]
    Conflict,

    #[error("upstream auth error: {0}")]
    Upstream(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::ApiKeyRequired => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Upstream(detail) => {
                warn!(detail = %detail, "OAuth2 provider call failed");
                "upstream auth error".to_string()
            }
            AppError::Internal(detail) => {
                error!(detail = %detail, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired
            | AuthError::InvalidApiKey
            | AuthError::ApiKeyExpired => AppError::Unauthorized,
            AuthError::Forbidden => AppError::Forbidden,
            AuthError::ApiKeyNotFound | AuthError::UserNotFound => AppError::NotFound,
            e @ (AuthError::UnknownProvider(_)
            | AuthError::OAuth2StateMismatch
            | AuthError::ProviderDenied(_)) => AppError::BadRequest(e.to_string()),
            AuthError::CodeInvalid(_) => {
                AppError::BadRequest("OAuth2 authorization code invalid".into())
            }
            AuthError::Validation(msg) => AppError::BadRequest(msg),
            AuthError::TokenExchange(msg) => AppError::Upstream(msg),
            AuthError::Conflict(_) => AppError::Conflict,
            AuthError::Store(StoreError::Timeout { .. }) => AppError::Timeout,
            AuthError::Store(e) => AppError::Internal(e.to_string()),
            AuthError::Internal(msg) => AppError::Internal(msg),
        }
    }
}
