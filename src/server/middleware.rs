//! Auth/rate-limit/audit helpers shared by every handler (§5 ordering: auth → rate-limit →
//! action). Implemented as plain functions handlers call in sequence rather than as an
//! `axum::middleware::from_fn` stack, since scope requirements vary per route.

use super::error::CoreError;
use super::state::ServerState;
use crate::audit::{AuditAction, AuditSeverity};
use crate::auth::{AuthError, TokenData};
use crate::permissions::PermissionChecker;
use axum::http::HeaderMap;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "x-api-key")
}

/// Authenticates a request per §4.3's precedence (bearer wins over API key). Returns
/// `auth_missing` if neither credential is present.
pub fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<TokenData, CoreError> {
    if let Some(token) = bearer_token(headers) {
        return state.auth.verify_access_token(token).map_err(map_auth_error);
    }
    if let Some(key) = api_key(headers) {
        let scopes = state.auth.validate_api_key(key).map_err(map_auth_error)?;
        return Ok(TokenData {
            username: "api-key".to_string(),
            scopes,
            auth_type: "api_key".to_string(),
        });
    }
    Err(CoreError::AuthMissing)
}

fn map_auth_error(e: AuthError) -> CoreError {
    match e {
        AuthError::Missing => CoreError::AuthMissing,
        AuthError::InvalidToken => CoreError::AuthInvalidToken,
        AuthError::DisabledUser => CoreError::AuthDisabledUser,
    }
}

pub fn require_scope(token: &TokenData, scope: &str) -> Result<(), CoreError> {
    let checker = PermissionChecker::new(&token.scopes);
    if checker.has_scope(scope) {
        Ok(())
    } else {
        Err(CoreError::PermissionDenied {
            required_scope: scope.to_string(),
        })
    }
}

pub fn client_id(state: &ServerState, headers: &HeaderMap, peer_addr: &str) -> String {
    let forwarded = header_str(headers, "x-forwarded-for");
    crate::ratelimit::client_id(api_key(headers), bearer_token(headers), forwarded, peer_addr)
}

/// The `X-RateLimit-*` header triplet for the bucket a request drew from (§6 scenario S5).
pub struct RateLimitHeaders {
    pub limit: f64,
    pub remaining: f64,
    pub reset: f64,
}

/// Applies admission control for one request and returns the header values to attach on
/// success. Every authenticated route calls this uniformly (§4.4: the limiter applies
/// per-client across all authenticated routes, not just the chat/skills paths).
pub fn check_rate_limit(state: &ServerState, client_id: &str, path: &str) -> Result<RateLimitHeaders, CoreError> {
    state.rate_limiter.check_rate_limit(client_id, path).map_err(|retry_after| {
        state.audit.log_action(AuditAction::RateLimitExceeded, AuditSeverity::Warning, false, None);
        CoreError::RateLimited { retry_after }
    })?;
    let (limit, remaining, reset) = state.rate_limiter.limit_info(client_id, path);
    Ok(RateLimitHeaders { limit, remaining, reset })
}

/// Attaches `X-RateLimit-Limit`/`X-RateLimit-Remaining`/`X-RateLimit-Reset` to a response,
/// shared by every handler so the triplet is consistent across routes.
pub fn apply_rate_limit_headers(mut response: axum::response::Response, headers: &RateLimitHeaders) -> axum::response::Response {
    let h = response.headers_mut();
    if let Ok(v) = axum::http::HeaderValue::from_str(&format!("{}", headers.limit.floor().max(0.0) as i64)) {
        h.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(&format!("{}", headers.remaining.floor().max(0.0) as i64)) {
        h.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(&format!("{}", headers.reset.ceil().max(0.0) as i64)) {
        h.insert("X-RateLimit-Reset", v);
    }
    response
}
