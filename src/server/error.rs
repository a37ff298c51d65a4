//! Uniform error envelope (§7): a closed error-kind set mapped to HTTP status, surfaced as
//! `{error: {code, message}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("authentication required")]
    AuthMissing,
    #[error("invalid or expired token")]
    AuthInvalidToken,
    #[error("user account is disabled")]
    AuthDisabledUser,
    #[error("missing required scope: {required_scope}")]
    PermissionDenied { required_scope: String },
    #[error("rate limited")]
    RateLimited { retry_after: f64 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("cluster cannot run this model: short by {shortfall_gb:.1} GB")]
    ClusterInsufficient { shortfall_gb: f64 },
    #[error("backend unavailable")]
    BackendUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalidToken => "auth_invalid_token",
            Self::AuthDisabledUser => "auth_disabled_user",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::ClusterInsufficient { .. } => "cluster_insufficient",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthDisabledUser | Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotLoaded | Self::ClusterInsufficient { .. } | Self::BackendUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = if let Self::RateLimited { retry_after } = &self {
            Some(*retry_after)
        } else {
            None
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&format!("{}", retry_after.ceil() as u64)) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
