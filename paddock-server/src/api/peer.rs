//! Peer RPC endpoints.
//!
//! The signed endpoints (`sync`, `heartbeat`, `chat-push`) take the raw
//! request bytes so the hash check and the JSON decode see exactly what was
//! signed. The bootstrap endpoints (`handshake`, `join-request`,
//! `join-status`) are unsigned: a joining node has no trust to present yet.
//! Signature failures are always a 403 with the reason in the body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Digest;

use crate::clock;
use crate::core::Core;
use crate::identity::{
    HDR_BODY_HASH, HDR_NODE_ID, HDR_NODE_SIG, HDR_NODE_TS, NodeIdentity, RequestSignature,
};
use crate::types::{NodeRecord, TrustStatus};
use crate::wire::{ChatPushRequest, HeartbeatRequest, JoinDecision, JoinResponse, SyncRequest};

use super::error_response;

pub fn routes() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/v1/peer/handshake", get(handshake))
        .route("/api/v1/peer/join-request", post(join_request))
        .route("/api/v1/peer/join-status", get(join_status))
        .route("/api/v1/peer/sync", post(sync))
        .route("/api/v1/peer/heartbeat", post(heartbeat))
        .route("/api/v1/peer/chat-push", post(chat_push))
        .route("/api/v1/peer/trigger-sync", post(trigger_sync))
}

// ── Signature verification ─────────────────────────────────────────────

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn forbidden(msg: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::FORBIDDEN, Json(json!({"error": msg.into()})))
}

/// Verify the four signature headers against the raw body and the sender's
/// registered public key. Returns the authenticated sender id.
async fn verify_signed(
    core: &Core,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, (StatusCode, Json<Value>)> {
    let node_id = header(headers, HDR_NODE_ID);
    let timestamp = header(headers, HDR_NODE_TS);
    let body_hash = header(headers, HDR_BODY_HASH);
    let signature = header(headers, HDR_NODE_SIG);

    if node_id.is_empty() {
        return Err(forbidden("missing node id"));
    }
    if timestamp.is_empty() || body_hash.is_empty() || signature.is_empty() {
        return Err(forbidden("missing signature headers"));
    }

    let Some(record) = core.registry.get(&node_id).await else {
        return Err(forbidden(format!("unknown node: {node_id}")));
    };

    match record.trust_status {
        TrustStatus::Kicked => {
            return Err(forbidden(format!("node is kicked: {node_id}")));
        }
        TrustStatus::Trusted | TrustStatus::Local => {}
        other => {
            return Err(forbidden(format!(
                "node not trusted: {node_id} (status={})",
                other.as_str()
            )));
        }
    }

    if record.public_key.is_empty() {
        return Err(forbidden(format!("node has no public key: {node_id}")));
    }

    let sig = RequestSignature {
        node_id: node_id.clone(),
        timestamp,
        body_hash,
        signature,
    };
    NodeIdentity::verify_request(&sig, body, &record.public_key)
        .map_err(|e| forbidden(e.to_string()))?;

    Ok(node_id)
}

// ── Bootstrap endpoints ────────────────────────────────────────────────

async fn handshake(State(core): State<Arc<Core>>) -> impl IntoResponse {
    Json(core.identity.handshake_info())
}

async fn join_request(
    State(core): State<Arc<Core>>,
    Json(info): Json<crate::wire::HandshakeInfo>,
) -> Result<Json<JoinResponse>, (StatusCode, Json<Value>)> {
    if info.node_id.is_empty() || info.public_key.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "node_id and public_key are required"})),
        ));
    }

    if let Some(existing) = core.registry.get(&info.node_id).await {
        match existing.trust_status {
            TrustStatus::Kicked => {
                return Err((
                    StatusCode::FORBIDDEN,
                    Json(json!({"status": "kicked", "message": "this node has been kicked from the network"})),
                ));
            }
            TrustStatus::Trusted => {
                return Ok(Json(JoinResponse {
                    status: JoinDecision::Trusted,
                    message: "node is already part of the network".into(),
                    nodes: Some(core.registry.trusted_snapshot().await),
                }));
            }
            TrustStatus::Pending => {
                return Ok(Json(JoinResponse {
                    status: JoinDecision::Pending,
                    message: "join request already submitted, waiting for approval".into(),
                    nodes: None,
                }));
            }
            _ => {}
        }
    }

    let record = NodeRecord {
        node_id: info.node_id.clone(),
        name: if info.name.is_empty() {
            info.node_id.clone()
        } else {
            info.name.clone()
        },
        mode: info.mode,
        connectable: info.connectable,
        host: info.host.clone(),
        port: info.port,
        public_url: info.public_url.clone(),
        registered_at: clock::now(),
        public_key: info.public_key.clone(),
        trust_status: TrustStatus::Pending,
        kicked_at: None,
        extra: serde_json::Map::new(),
    };
    core.registry
        .save_pending(record)
        .await
        .map_err(error_response)?;

    let fingerprint = hex::encode(sha2::Sha256::digest(info.public_key.as_bytes()));
    tracing::info!(
        node = %info.node_id,
        name = %info.name,
        key_fingerprint = &fingerprint[..16],
        "join request received, pending approval"
    );

    Ok(Json(JoinResponse {
        status: JoinDecision::Pending,
        message: "join request submitted, waiting for operator approval".into(),
        nodes: None,
    }))
}

#[derive(Deserialize)]
struct JoinStatusQuery {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    public_key: String,
}

async fn join_status(
    State(core): State<Arc<Core>>,
    Query(q): Query<JoinStatusQuery>,
) -> Result<Json<JoinResponse>, (StatusCode, Json<Value>)> {
    if q.node_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "node_id query parameter is required"})),
        ));
    }

    let Some(record) = core.registry.get(&q.node_id).await else {
        return Ok(Json(JoinResponse {
            status: JoinDecision::Unknown,
            message: "no join request on record for that node".into(),
            nodes: None,
        }));
    };

    // Only the owner of the registered key may poll its status.
    if !q.public_key.is_empty() && record.public_key != q.public_key {
        return Err(forbidden("public key mismatch"));
    }

    let resp = match record.trust_status {
        TrustStatus::Trusted | TrustStatus::Local => JoinResponse {
            status: JoinDecision::Trusted,
            message: "approved".into(),
            nodes: Some(core.registry.trusted_snapshot().await),
        },
        TrustStatus::Kicked => JoinResponse {
            status: JoinDecision::Kicked,
            message: "this node has been kicked from the network".into(),
            nodes: None,
        },
        _ => JoinResponse {
            status: JoinDecision::Pending,
            message: "waiting for operator approval".into(),
            nodes: None,
        },
    };
    Ok(Json(resp))
}

// ── Signed endpoints ───────────────────────────────────────────────────

async fn sync(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<crate::wire::SyncResponse>, (StatusCode, Json<Value>)> {
    let sender = verify_signed(&core, &headers, &body).await?;

    let req: SyncRequest = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("bad sync body: {e}")})),
        )
    })?;
    if req.node_id != sender {
        return Err(forbidden("body node_id does not match signature"));
    }

    tracing::debug!(peer = %sender, since = req.since, "sync request received");
    let resp = core.engine.handle_sync(req).await.map_err(error_response)?;
    Ok(Json(resp))
}

async fn heartbeat(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<crate::wire::HeartbeatResponse>, (StatusCode, Json<Value>)> {
    let sender = verify_signed(&core, &headers, &body).await?;

    let req: HeartbeatRequest = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("bad heartbeat body: {e}")})),
        )
    })?;
    if req.node_id != sender {
        return Err(forbidden("body node_id does not match signature"));
    }

    tracing::debug!(peer = %sender, since = req.since, "heartbeat received");
    let resp = core
        .engine
        .handle_heartbeat(req)
        .await
        .map_err(error_response)?;
    Ok(Json(resp))
}

async fn chat_push(
    State(core): State<Arc<Core>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sender = verify_signed(&core, &headers, &body).await?;

    let req: ChatPushRequest = serde_json::from_slice(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("bad chat-push body: {e}")})),
        )
    })?;
    if req.node_id != sender {
        return Err(forbidden("body node_id does not match signature"));
    }
    if req.message.id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message without id"})),
        ));
    }

    let inserted = core
        .hub
        .ingest_remote(req.message)
        .await
        .map_err(error_response)?;
    tracing::debug!(peer = %sender, inserted, "chat push received");
    Ok(Json(json!({"ok": true})))
}

// ── Manual trigger (app auth) ──────────────────────────────────────────

#[derive(Deserialize)]
struct TriggerQuery {
    #[serde(default)]
    token: String,
}

async fn trigger_sync(
    State(core): State<Arc<Core>>,
    Query(q): Query<TriggerQuery>,
    headers: HeaderMap,
) -> Result<Json<crate::wire::TriggerSyncReport>, (StatusCode, Json<Value>)> {
    let token = if q.token.is_empty() {
        header(&headers, "x-app-token")
    } else {
        q.token
    };
    if !core.auth.validate(&token) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid app token"})),
        ));
    }

    tracing::info!("manual sync triggered");
    Ok(Json(core.engine.trigger_sync_now().await))
}
