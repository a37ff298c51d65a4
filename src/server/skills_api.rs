use super::error::CoreError;
use super::middleware::{apply_rate_limit_headers, authenticate, check_rate_limit, client_id, require_scope};
use super::state::ServerState;
use crate::audit::{AuditAction, AuditSeverity};
use crate::permissions::{PermissionChecker, READ, TOOL_CALL};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// `GET /v1/skills` (§4.8): authenticated, scope `read`.
pub async fn list_skills(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/skills")?;

    let checker = PermissionChecker::new(&token.scopes);
    let summaries: Vec<serde_json::Value> = state
        .skills
        .list()
        .into_iter()
        .filter(|s| checker.can_use_skill(&s.name))
        .map(|s| s.summary())
        .collect();
    let response = Json(serde_json::json!({"skills": summaries})).into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

/// `GET /v1/skills/{name}` (§4.8): authenticated, scope `read`.
pub async fn get_skill(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/skills")?;

    let skill = state.skills.get(&name).ok_or_else(|| CoreError::NotFound(format!("skill '{name}'")))?;
    let response = Json(skill.summary()).into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

#[derive(Debug, Deserialize)]
pub struct SkillCallRequest {
    pub skill: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: std::collections::HashMap<String, serde_json::Value>,
}

/// `POST /v1/skills/call` (§4.8): authenticated, scopes `tool:call` plus the per-skill
/// requirement.
pub async fn call_skill(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<SkillCallRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, TOOL_CALL)?;
    let checker = PermissionChecker::new(&token.scopes);
    if !checker.can_use_skill(&req.skill) {
        state.audit.log_action(AuditAction::SkillDenied, AuditSeverity::Warning, false, Some(&token.username));
        return Err(CoreError::PermissionDenied {
            required_scope: crate::permissions::skill_required_scope(&req.skill).to_string(),
        });
    }

    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/skills/call")?;

    let skill = state
        .skills
        .get(&req.skill)
        .ok_or_else(|| CoreError::NotFound(format!("skill '{}'", req.skill)))?;
    let tool = skill
        .tools
        .iter()
        .find(|t| t.name == req.tool)
        .ok_or_else(|| CoreError::NotFound(format!("tool '{}'", req.tool)))?;

    state.audit.log_action(AuditAction::SkillAccessed, AuditSeverity::Info, true, Some(&token.username));

    // Per §7's propagation policy, a handler failure becomes a result string, not an HTTP
    // failure — the cluster/skill registry is still alive.
    let result = match (tool.handler)(req.arguments.clone()) {
        Ok(output) => {
            state.audit.log_action(AuditAction::ToolCalled, AuditSeverity::Info, true, Some(&token.username));
            serde_json::json!({"success": true, "result": output})
        }
        Err(e) => {
            state.audit.log_action(AuditAction::ToolFailed, AuditSeverity::Error, false, Some(&token.username));
            serde_json::json!({"success": false, "error": e.to_string()})
        }
    };
    let response = Json(result).into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}
