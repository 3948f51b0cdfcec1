//! Node management endpoints: listing, join, approve/reject/kick, removal.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Digest;

use crate::core::Core;
use crate::store::STATES_DOC;
use crate::types::{NodeRecord, NodeState, StatesDoc, TrustStatus};

use super::error_response;

pub fn routes() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/self", get(self_node))
        .route("/api/v1/nodes/join", post(join_network))
        .route("/api/v1/nodes/join-status", get(join_status))
        .route("/api/v1/nodes/{node_id}", get(get_node).delete(remove_node))
        .route("/api/v1/nodes/{node_id}/approve", post(approve_node))
        .route("/api/v1/nodes/{node_id}/reject", post(reject_node))
        .route("/api/v1/nodes/{node_id}/kick", post(kick_node))
}

fn fingerprint(public_key: &str) -> String {
    if public_key.is_empty() {
        return String::new();
    }
    hex::encode(sha2::Sha256::digest(public_key.as_bytes()))[..16].to_string()
}

fn node_view(record: &NodeRecord, state: Option<&NodeState>, is_self: bool) -> Value {
    let mut view = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
    if let Some(obj) = view.as_object_mut() {
        obj.insert(
            "status".into(),
            serde_json::to_value(state.map(|s| s.status).unwrap_or_default()).unwrap_or(Value::Null),
        );
        obj.insert(
            "last_seen".into(),
            json!(state.map(|s| s.last_seen).unwrap_or(0.0)),
        );
        obj.insert(
            "system_info".into(),
            state.map(|s| s.system_info.clone()).unwrap_or(Value::Null),
        );
        obj.insert("is_self".into(), json!(is_self));
        obj.insert(
            "public_key_fingerprint".into(),
            json!(fingerprint(&record.public_key)),
        );
    }
    view
}

fn trust_rank(status: TrustStatus) -> u8 {
    match status {
        TrustStatus::Local => 0,
        TrustStatus::Trusted => 1,
        TrustStatus::Pending => 2,
        TrustStatus::WaitingApproval => 3,
        TrustStatus::Kicked => 4,
    }
}

async fn list_nodes(State(core): State<Arc<Core>>) -> Json<Value> {
    let nodes = core.registry.all().await;
    let states: StatesDoc = core.store.read(STATES_DOC, StatesDoc::new()).await;
    let self_id = core.identity.node_id();

    let mut entries: Vec<(bool, u8, f64, Value)> = nodes
        .values()
        .map(|rec| {
            let state = states.get(&rec.node_id);
            let is_self = rec.node_id == self_id;
            (
                is_self,
                trust_rank(rec.trust_status),
                state.map(|s| s.last_seen).unwrap_or(0.0),
                node_view(rec, state, is_self),
            )
        })
        .collect();

    // Self first, then by trust standing, then most recently seen.
    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(a.1.cmp(&b.1))
            .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
    });

    let list: Vec<Value> = entries.into_iter().map(|(_, _, _, v)| v).collect();
    Json(json!({"nodes": list, "total": list.len()}))
}

async fn self_node(State(core): State<Arc<Core>>) -> Json<Value> {
    let states: StatesDoc = core.store.read(STATES_DOC, StatesDoc::new()).await;
    let state = states.get(core.identity.node_id());

    Json(json!({
        "node_id": core.identity.node_id(),
        "name": core.identity.name(),
        "mode": core.identity.mode(),
        "connectable": core.identity.connectable(),
        "is_temp_full": core.identity.is_temp_full(),
        "status": "online",
        "system_info": state.map(|s| s.system_info.clone()).unwrap_or(Value::Null),
        "trust_status": TrustStatus::Local,
    }))
}

async fn get_node(
    State(core): State<Arc<Core>>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(record) = core.registry.get(&node_id).await else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "node not found", "node_id": node_id})),
        ));
    };
    let states: StatesDoc = core.store.read(STATES_DOC, StatesDoc::new()).await;
    let is_self = node_id == core.identity.node_id();
    Ok(Json(node_view(&record, states.get(&node_id), is_self)))
}

// ── Join flow ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JoinBody {
    #[serde(default)]
    host: String,
}

async fn join_network(
    State(core): State<Arc<Core>>,
    Json(body): Json<JoinBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let outcome = core
        .join
        .join_network(&body.host)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "status": outcome.status,
        "message": outcome.message,
        "node": outcome.node,
    })))
}

async fn join_status(State(core): State<Arc<Core>>) -> Json<Value> {
    let view = core.join.status();
    Json(json!({
        "status": view.status,
        "target_id": view.target_id,
        "target_url": view.target_url,
        "message": view.message,
    }))
}

// ── Operator actions ───────────────────────────────────────────────────

async fn approve_node(
    State(core): State<Arc<Core>>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    core.registry
        .approve(&node_id, core.identity.node_id())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("node {node_id} approved")
    })))
}

async fn reject_node(
    State(core): State<Arc<Core>>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    core.registry
        .reject(&node_id, core.identity.node_id())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("join request from {node_id} rejected")
    })))
}

async fn kick_node(
    State(core): State<Arc<Core>>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    core.registry
        .kick(&node_id, core.identity.node_id())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("node {node_id} kicked from the network")
    })))
}

async fn remove_node(
    State(core): State<Arc<Core>>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    core.registry
        .remove(&node_id, core.identity.node_id())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("node {node_id} removed locally")
    })))
}
