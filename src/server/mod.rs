mod auth_api;
mod chat_api;
mod distributed_api;
mod error;
mod middleware;
mod skills_api;
mod state;

pub use error::CoreError;
pub use state::ServerState;

use crate::audit::{AuditAction, AuditSeverity};
use crate::config::Config;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Builds the router and binds the listener (§4.8 route table). Unauthenticated routes (`/`,
/// `/health`) bypass rate limiting entirely, matching §4.8's exemption list.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let host = config.api.host.clone();
    let port = config.api.port;
    let state = Arc::new(ServerState::new(config)?);

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/chat", post(chat_api::chat_handler))
        .route("/v1/skills", get(skills_api::list_skills))
        .route("/v1/skills/{name}", get(skills_api::get_skill))
        .route("/v1/skills/call", post(skills_api::call_skill))
        .route("/v1/auth/login", post(auth_api::login))
        .route("/v1/auth/me", get(auth_api::introspect))
        .route("/v1/auth/keys", post(auth_api::create_api_key))
        .route("/v1/auth/keys", get(auth_api::list_api_keys))
        .route("/v1/auth/keys/{key_id}", delete(auth_api::revoke_api_key))
        .route("/v1/distributed/status", get(distributed_api::cluster_status))
        .route("/v1/distributed/nodes", post(distributed_api::add_node))
        .route("/v1/distributed/nodes/{id}", delete(distributed_api::remove_node))
        .route("/v1/distributed/requirements", post(distributed_api::check_model_requirements))
        .route("/v1/distributed/load", post(distributed_api::load_model))
        .route("/v1/distributed/unload", post(distributed_api::unload_model))
        .route("/v1/distributed/assignments", get(distributed_api::layer_assignments))
        .route("/v1/distributed/p2p/sync", post(distributed_api::p2p_sync))
        .route("/v1/distributed/generate", post(distributed_api::generate))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    state.audit.log_action(AuditAction::ServerStart, AuditSeverity::Info, true, None);
    info!("core-agent server listening on http://{host}:{port}");
    let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    state.audit.log_action(AuditAction::ServerStop, AuditSeverity::Info, result.is_ok(), None);
    result?;
    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({"name": "core-agent", "version": env!("CARGO_PKG_VERSION")}))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    uptime_seconds: f64,
    llm_provider: String,
    loaded_model: Option<String>,
    skill_count: usize,
    node_count: usize,
}

/// `GET /v1/status` (§4.8): authenticated, scope `read`. Reports uptime, the configured LLM
/// provider, the currently loaded distributed model (if any), and skill/node counts.
async fn status_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = middleware::authenticate(&state, &headers)?;
    middleware::require_scope(&token, crate::permissions::READ)?;
    let cid = middleware::client_id(&state, &headers, &addr.ip().to_string());
    let rl = middleware::check_rate_limit(&state, &cid, "/v1/status")?;

    let cluster_info = state.cluster.get_cluster_info();
    let node_count = cluster_info.get("node_count").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

    let response = Json(StatusResponse {
        uptime_seconds: state.uptime_seconds(),
        llm_provider: state.config.llm.provider.clone(),
        loaded_model: state.loaded_model.read().unwrap().clone(),
        skill_count: state.skills.len(),
        node_count,
    })
    .into_response();
    Ok(middleware::apply_rate_limit_headers(response, &rl))
}
