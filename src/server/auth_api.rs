//! Password login, token introspection, and API-key CRUD (§4.8 auth endpoints).

use super::error::CoreError;
use super::middleware::{apply_rate_limit_headers, authenticate, check_rate_limit, client_id};
use super::state::ServerState;
use crate::audit::{AuditAction, AuditSeverity};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
}

pub async fn login(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<axum::response::Response, CoreError> {
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/auth/login")?;

    let user = state.auth.get_user(&req.username).ok_or(CoreError::AuthInvalidToken)?;
    if user.disabled {
        return Err(CoreError::AuthDisabledUser);
    }
    if !state.auth.verify_password(&req.password, &user.password_hash) {
        state.audit.log_action(AuditAction::AuthLoginFailure, AuditSeverity::Warning, false, Some(&req.username));
        return Err(CoreError::AuthInvalidToken);
    }
    let token = state
        .auth
        .create_access_token(&user.username, &user.scopes, "password")
        .map_err(|e| CoreError::Internal(e.to_string()))?;
    state.audit.log_action(AuditAction::AuthLoginSuccess, AuditSeverity::Info, true, Some(&req.username));
    let response = Json(LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    })
    .into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

#[derive(Debug, Serialize)]
pub struct IntrospectResponse {
    pub username: String,
    pub scopes: Vec<String>,
    pub auth_type: String,
}

/// Token introspection: returns the decoded claims for the bearer token presented.
pub async fn introspect(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/auth/me")?;
    let response = Json(IntrospectResponse {
        username: token.username,
        scopes: token.scopes,
        auth_type: token.auth_type,
    })
    .into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub scopes: Vec<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub key: String,
    pub key_id: String,
}

pub async fn create_api_key(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/auth/keys")?;

    let (raw, record) = state.auth.issue_api_key(&token.username, req.scopes, req.name);
    state.audit.log_action(AuditAction::ApiKeyCreated, AuditSeverity::Info, true, Some(&token.username));
    let response = Json(CreateApiKeyResponse {
        key: raw,
        key_id: record.key_id,
    })
    .into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

pub async fn list_api_keys(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/auth/keys")?;
    let keys = state.auth.list_api_keys(&token.username);
    let response = Json(serde_json::json!({ "keys": keys })).into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

pub async fn revoke_api_key(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/auth/keys")?;

    if !state.auth.revoke_api_key(&key_id) {
        return Err(CoreError::NotFound(format!("api key '{key_id}'")));
    }
    state.audit.log_action(AuditAction::ApiKeyRevoked, AuditSeverity::Info, true, Some(&token.username));
    let response = Json(serde_json::json!({"revoked": true})).into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}
