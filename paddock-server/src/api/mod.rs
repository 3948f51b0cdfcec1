//! HTTP API modules, one per surface.

pub mod chat;
pub mod nodes;
pub mod peer;
pub mod snippets;

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::error::PeerError;

/// Map engine errors onto HTTP responses with an `{error}` body. Handlers
/// never leak internals beyond the error's own message.
pub fn error_response(e: PeerError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        PeerError::InvariantViolation(_) => StatusCode::BAD_REQUEST,
        PeerError::Malformed(_) => StatusCode::FORBIDDEN,
        PeerError::AuthRejected(_) => StatusCode::FORBIDDEN,
        PeerError::NotFound(_) => StatusCode::NOT_FOUND,
        PeerError::Transient(_) => StatusCode::BAD_GATEWAY,
        PeerError::Storage(_) | PeerError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}
