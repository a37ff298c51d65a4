//! Distributed inference endpoints (§4.7/§4.8): cluster status, node CRUD, model requirements
//! check, model load/unload, layer assignments, generation.

use super::error::CoreError;
use super::middleware::{apply_rate_limit_headers, authenticate, check_rate_limit, client_id, require_scope};
use super::state::ServerState;
use crate::distributed::cluster::{ClusterNode, NodeCapabilities, NodeStatus};
use crate::distributed::inference::DistributedInferenceCoordinator;
use crate::distributed::partition::{can_cluster_run_model, estimate_model_requirements};
use crate::permissions::{ADMIN, READ};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn cluster_status(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/status")?;
    Ok(apply_rate_limit_headers(Json(state.cluster.get_cluster_info()).into_response(), &rl))
}

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

pub async fn add_node(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<AddNodeRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, ADMIN)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/nodes")?;

    state.cluster.add_node(ClusterNode {
        node_id: req.node_id,
        host: req.host,
        port: req.port,
        capabilities: NodeCapabilities::unknown(),
        status: NodeStatus::Online,
        assigned_layers: None,
        current_model: None,
    });
    Ok(apply_rate_limit_headers(Json(serde_json::json!({"added": true})).into_response(), &rl))
}

pub async fn remove_node(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, ADMIN)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/nodes")?;

    let removed = state
        .cluster
        .remove_node(&node_id)
        .map_err(|e| CoreError::InvalidRequest(e.to_string()))?;
    if !removed {
        return Err(CoreError::NotFound(format!("node '{node_id}'")));
    }
    Ok(apply_rate_limit_headers(Json(serde_json::json!({"removed": true})).into_response(), &rl))
}

#[derive(Debug, Deserialize)]
pub struct ModelCheckRequest {
    pub model: String,
}

/// Reports whether the cluster has enough aggregate memory to run `model`, and by how much
/// it falls short otherwise — matching §7's "carries numeric shortfall" requirement.
pub async fn check_model_requirements(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<ModelCheckRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/requirements")?;

    let requirements = estimate_model_requirements(&req.model);
    let total_memory = state.cluster.get_total_memory();
    let can_run = can_cluster_run_model(total_memory, &requirements);
    let required = requirements.memory_gb_4bit * 1.2;
    let shortfall = (required - total_memory).max(0.0);
    let response = Json(serde_json::json!({
        "model": req.model,
        "can_run": can_run,
        "required_memory_gb": required,
        "available_memory_gb": total_memory,
        "shortfall_gb": shortfall,
        "estimated_layers": requirements.estimated_layers,
    }))
    .into_response();
    Ok(apply_rate_limit_headers(response, &rl))
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model: String,
    pub total_layers: Option<u32>,
}

/// Partitions and "loads" a model (§4.7 steps 1-4). Coordinator failures are returned as
/// `{success=false, error}` in the body rather than as HTTP failures, per §7.
pub async fn load_model(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LoadModelRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, ADMIN)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/load")?;

    let requirements = estimate_model_requirements(&req.model);
    let total_layers = req.total_layers.unwrap_or(requirements.estimated_layers);
    let total_memory = state.cluster.get_total_memory();
    if !can_cluster_run_model(total_memory, &requirements) {
        let response = Json(serde_json::json!({
            "success": false,
            "error": format!("cluster has {total_memory:.1}GB, needs {:.1}GB", requirements.memory_gb_4bit * 1.2),
        }))
        .into_response();
        return Ok(apply_rate_limit_headers(response, &rl));
    }

    let response = match state.cluster.assign_layers(&req.model, total_layers) {
        Ok(partitions) => {
            *state.loaded_model.write().unwrap() = Some(req.model.clone());
            Json(serde_json::json!({
                "success": true,
                "model": req.model,
                "assignments": partitions.iter().map(|p| serde_json::json!({
                    "node_id": p.node_id,
                    "start_layer": p.start_layer,
                    "end_layer": p.end_layer,
                })).collect::<Vec<_>>(),
            }))
            .into_response()
        }
        Err(e) => Json(serde_json::json!({"success": false, "error": e.to_string()})).into_response(),
    };
    Ok(apply_rate_limit_headers(response, &rl))
}

pub async fn unload_model(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, ADMIN)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/unload")?;

    state.cluster.clear_assignments();
    *state.loaded_model.write().unwrap() = None;
    Ok(apply_rate_limit_headers(Json(serde_json::json!({"unloaded": true})).into_response(), &rl))
}

pub async fn layer_assignments(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/assignments")?;
    Ok(apply_rate_limit_headers(Json(state.cluster.get_cluster_info()).into_response(), &rl))
}

/// P2P cluster discovery sync: accepts a peer's self-announcement and records it as a node.
/// Only relevant when `cluster.discovery = "p2p"`; under "manual" discovery this endpoint
/// still accepts registrations but nothing probes for peers automatically.
#[derive(Debug, Deserialize)]
pub struct P2pSyncRequest {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

pub async fn p2p_sync(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<P2pSyncRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, ADMIN)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/p2p/sync")?;

    state.cluster.add_node(ClusterNode {
        node_id: req.node_id,
        host: req.host,
        port: req.port,
        capabilities: NodeCapabilities::unknown(),
        status: NodeStatus::Online,
        assigned_layers: None,
        current_model: None,
    });
    Ok(apply_rate_limit_headers(Json(state.cluster.get_cluster_info()).into_response(), &rl))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stream: bool,
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

/// `POST /v1/distributed/generate` (§4.7 Distributed.generate): runs one generation against
/// the currently loaded model, partitioned across the cluster by the coordinator. Rejects with
/// `model_not_loaded` (503) when no model has been loaded via `/v1/distributed/load`, matching
/// §6's streaming envelope when `stream` is set. `top_p` is accepted for wire compatibility;
/// the `Backend` port has no sampling knob for it yet.
pub async fn generate(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<axum::response::Response, CoreError> {
    let token = authenticate(&state, &headers)?;
    require_scope(&token, READ)?;
    let cid = client_id(&state, &headers, &addr.ip().to_string());
    let rl = check_rate_limit(&state, &cid, "/v1/distributed/generate")?;

    let model = state.loaded_model.read().unwrap().clone().ok_or(CoreError::ModelNotLoaded)?;
    let GenerateRequest {
        prompt,
        max_tokens,
        temperature,
        stream,
        ..
    } = req;

    let backend = Arc::new(tokio::sync::Mutex::new(state.build_backend().await));

    if stream {
        let chunk_stream = { backend.lock().await.chat_stream(&prompt, temperature, max_tokens).await };
        let sse_stream = chunk_stream.map(move |chunk| {
            let payload = serde_json::json!({"delta": {"content": chunk}});
            Ok::<_, Infallible>(Event::default().data(payload.to_string()))
        });
        let response = Sse::new(sse_stream.chain(futures_util::stream::once(async { Ok(Event::default().data("[DONE]")) })))
            .keep_alive(KeepAlive::default())
            .into_response();
        Ok(apply_rate_limit_headers(response, &rl))
    } else {
        let coordinator = DistributedInferenceCoordinator::new(&state.cluster);
        let result = coordinator
            .generate(&model, &prompt, max_tokens, move |p, mt| {
                let backend = backend.clone();
                let p = p.to_string();
                Box::pin(async move {
                    let mut backend = backend.lock().await;
                    let message = backend.chat(&p, &[], temperature, mt).await;
                    Ok(message.content.unwrap_or_default())
                })
            })
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let response = Json(result).into_response();
        Ok(apply_rate_limit_headers(response, &rl))
    }
}
