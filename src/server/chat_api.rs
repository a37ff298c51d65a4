use super::error::CoreError;
use super::middleware::{apply_rate_limit_headers, authenticate, check_rate_limit, client_id, require_scope};
use super::state::ServerState;
use crate::agent::Agent;
use crate::audit::{AuditAction, AuditEvent, AuditSeverity};
use crate::permissions::{CHAT, CHAT_STREAM};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_smart_tools")]
    pub smart_tools: bool,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    10
}
fn default_smart_tools() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
}

/// `POST /v1/chat` (§4.8): authenticated, scope `chat` (or `chat:stream` when streaming).
/// Non-streaming returns one response; streaming emits `data: <json>\n\n` chunks terminated
/// by `data: [DONE]`.
pub async fn chat_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, if req.stream { CHAT_STREAM } else { CHAT })?;

    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/chat")?;

    let mut event = AuditEvent::new(AuditAction::ChatRequest, AuditSeverity::Info, true);
    event.username = Some(token.username.clone());
    event.auth_type = Some(token.auth_type.clone());
    event.client_ip = Some(addr.ip().to_string());
    event.path = Some("/v1/chat".to_string());
    event.method = Some("POST".to_string());
    state.audit.log(&event);

    let registry = state.skills.clone();
    let tools = registry.all_tools();
    let skill_of = {
        let registry = registry.clone();
        move |name: &str| registry.skill_of(name)
    };

    let backend = state.build_backend().await;
    let agent = Agent::new(backend, tools, skill_of);

    if req.stream {
        state.audit.log_action(AuditAction::ChatStreamStart, AuditSeverity::Info, true, Some(&token.username));
        let agent = Arc::new(tokio::sync::Mutex::new(agent));
        let message = req.message.clone();
        let chunk_stream = {
            let mut guard = agent.lock().await;
            guard.run_stream(&message, req.temperature, req.max_tokens).await
        };

        let accumulated = Arc::new(Mutex::new(String::new()));
        let sse_body = {
            let accumulated = accumulated.clone();
            chunk_stream.map(move |chunk| {
                accumulated.lock().unwrap().push_str(&chunk);
                let payload = serde_json::json!({"delta": {"content": chunk}});
                Ok::<_, Infallible>(Event::default().data(payload.to_string()))
            })
        };

        let finalize = {
            let state = state.clone();
            let username = token.username.clone();
            async move {
                let content = accumulated.lock().unwrap().clone();
                agent.lock().await.record_stream_result(content).await;
                state.audit.log_action(AuditAction::ChatStreamEnd, AuditSeverity::Info, true, Some(&username));
                Ok(Event::default().data("[DONE]"))
            }
        };

        let response = Sse::new(sse_body.chain(futures_util::stream::once(finalize)))
            .keep_alive(KeepAlive::default())
            .into_response();
        Ok(apply_rate_limit_headers(response, &rl))
    } else {
        let mut agent = agent;
        let text = agent.run(&req.message, req.smart_tools, req.max_iterations).await;
        let response = Json(ChatResponse { message: text }).into_response();
        Ok(apply_rate_limit_headers(response, &rl))
    }
}
