//! Router assembly for the HTTP/WebSocket surface.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::api;
use crate::core::Core;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .merge(api::peer::routes())
        .merge(api::nodes::routes())
        .merge(api::chat::routes())
        .merge(api::snippets::routes())
        .layer(CorsLayer::permissive())
        .with_state(core)
}

async fn health(State(core): State<Arc<Core>>) -> Json<Value> {
    let nodes = core.registry.all().await;
    Json(json!({
        "node_id": core.identity.node_id(),
        "name": core.identity.name(),
        "mode": core.identity.mode(),
        "connectable": core.identity.connectable(),
        "version": core.engine.version(),
        "uptime_secs": core.uptime_secs(),
        "known_nodes": nodes.len(),
        "chat_subscribers": core.hub.subscriber_count(),
    }))
}
