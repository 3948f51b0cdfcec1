//! Chat endpoints: history, REST send, and the WebSocket subscriber.
//!
//! A WebSocket client authenticates with the app token before it is
//! accepted; a missing or invalid token closes the socket with code 4001.
//! Subscriber lifecycle: connected → authenticated → active → disconnected.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::clock;
use crate::core::Core;
use crate::store::CHAT_DOC;
use crate::types::ChatMessage;

use super::error_response;

/// WebSocket close code for a missing or invalid token.
const CLOSE_UNAUTHORIZED: u16 = 4001;

pub fn routes() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/v1/chat/messages", get(get_messages).post(send_message))
        .route("/api/v1/chat/ws", get(ws_upgrade))
}

// ── REST ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    after: Option<f64>,
}

async fn get_messages(
    State(core): State<Arc<Core>>,
    Query(q): Query<HistoryQuery>,
) -> Json<Value> {
    let mut messages: Vec<ChatMessage> = core.store.read(CHAT_DOC, Vec::new()).await;

    if let Some(after) = q.after
        && after > 0.0
    {
        messages.retain(|m| m.timestamp > after);
    }

    let limit = q.limit.unwrap_or(100);
    if messages.len() > limit {
        let skip = messages.len() - limit;
        messages.drain(..skip);
    }

    Json(json!({"total": messages.len(), "messages": messages}))
}

#[derive(Deserialize)]
struct SendBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    client_id: Option<String>,
}

async fn send_message(
    State(core): State<Arc<Core>>,
    Json(body): Json<SendBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let msg = core
        .hub
        .send_local(&body.content, body.client_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({"ok": true, "message": msg})))
}

// ── WebSocket ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    State(core): State<Arc<Core>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, core, q.token))
}

#[derive(Deserialize)]
struct WsInbound {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    client_id: Option<String>,
}

async fn handle_socket(mut socket: WebSocket, core: Arc<Core>, token: String) {
    if !core.auth.validate(&token) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (subscriber_id, mut rx) = core.hub.subscribe();
    tracing::info!(
        subscriber = subscriber_id,
        total = core.hub.subscriber_count(),
        "chat websocket connected"
    );

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let inbound: WsInbound = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::debug!("ignoring unparseable ws frame: {e}");
                                continue;
                            }
                        };
                        match inbound.kind.as_str() {
                            "message" => {
                                if let Err(e) = core.hub.send_local(&inbound.content, inbound.client_id).await {
                                    let err = json!({"type": "error", "error": e.to_string()}).to_string();
                                    if socket.send(Message::Text(err.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            "ping" => {
                                let pong = json!({"type": "pong", "ts": clock::now()}).to_string();
                                if socket.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong frames handled by axum
                    Some(Err(_)) => break,
                }
            }
            payload = rx.recv() => {
                match payload {
                    Some(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    core.hub.unsubscribe(subscriber_id);
    tracing::info!(
        subscriber = subscriber_id,
        total = core.hub.subscriber_count(),
        "chat websocket disconnected"
    );
}
