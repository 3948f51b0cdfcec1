//! Snippet endpoints: shared key/value cards (accounts, server credentials,
//! commands, notes) replicated across the mesh.
//!
//! Deletion is a tombstone so it survives merges; list responses never show
//! tombstones.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::clock;
use crate::core::Core;
use crate::store::SNIPPETS_DOC;
use crate::types::{Snippet, SnippetCategory, SnippetField};

use super::error_response;
use crate::error::PeerError;

pub fn routes() -> Router<Arc<Core>> {
    Router::new()
        .route("/api/v1/snippets", get(list_snippets).post(create_snippet))
        .route(
            "/api/v1/snippets/{snippet_id}",
            axum::routing::put(update_snippet).delete(delete_snippet),
        )
}

fn parse_category(raw: &str) -> Option<SnippetCategory> {
    match raw {
        "account" => Some(SnippetCategory::Account),
        "server" => Some(SnippetCategory::Server),
        "command" => Some(SnippetCategory::Command),
        "note" => Some(SnippetCategory::Note),
        _ => None,
    }
}

#[derive(Deserialize)]
struct FieldInput {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    sensitive: bool,
}

fn validate_fields(fields: Vec<FieldInput>) -> Vec<SnippetField> {
    fields
        .into_iter()
        .filter(|f| !f.key.trim().is_empty())
        .map(|f| SnippetField {
            key: f.key.trim().to_string(),
            value: f.value,
            sensitive: f.sensitive,
        })
        .collect()
}

// ── Handlers ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    category: String,
}

async fn list_snippets(
    State(core): State<Arc<Core>>,
    Query(q): Query<ListQuery>,
) -> Json<Value> {
    let mut snippets: Vec<Snippet> = core.store.read(SNIPPETS_DOC, Vec::new()).await;
    snippets.retain(|s| !s.deleted);

    if let Some(category) = parse_category(&q.category) {
        snippets.retain(|s| s.category == category);
    }

    // Newest first.
    snippets.sort_by(|a, b| {
        b.created_at
            .partial_cmp(&a.created_at)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Json(json!({"total": snippets.len(), "snippets": snippets}))
}

#[derive(Deserialize)]
struct CreateBody {
    #[serde(default)]
    title: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    fields: Vec<FieldInput>,
    #[serde(default)]
    hidden: bool,
}

async fn create_snippet(
    State(core): State<Arc<Core>>,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let title = body.title.trim().to_string();
    if title.is_empty() {
        return Err(error_response(PeerError::InvariantViolation(
            "title must not be empty".into(),
        )));
    }

    let now = clock::now();
    let snippet = Snippet {
        id: ulid::Ulid::new().to_string(),
        category: parse_category(&body.category).unwrap_or_default(),
        title,
        fields: validate_fields(body.fields),
        hidden: body.hidden,
        created_at: now,
        updated_at: now,
        deleted: false,
        extra: serde_json::Map::new(),
    };

    let stored = snippet.clone();
    core.store
        .update(SNIPPETS_DOC, Vec::new(), move |mut snippets: Vec<Snippet>| {
            snippets.push(stored);
            snippets
        })
        .await
        .map_err(error_response)?;

    tracing::info!(snippet = %snippet.id, title = %snippet.title, "snippet created");
    Ok(Json(json!({"ok": true, "snippet": snippet})))
}

#[derive(Deserialize)]
struct UpdateBody {
    title: Option<String>,
    category: Option<String>,
    fields: Option<Vec<FieldInput>>,
    hidden: Option<bool>,
}

async fn update_snippet(
    State(core): State<Arc<Core>>,
    Path(snippet_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(title) = &body.title
        && title.trim().is_empty()
    {
        return Err(error_response(PeerError::InvariantViolation(
            "title must not be empty".into(),
        )));
    }

    let mut updated: Option<Snippet> = None;
    let updated_ref = &mut updated;
    let id = snippet_id.clone();
    let fields = body.fields.map(validate_fields);
    let category = body.category.as_deref().and_then(parse_category);

    core.store
        .update(SNIPPETS_DOC, Vec::new(), move |mut snippets: Vec<Snippet>| {
            if let Some(s) = snippets.iter_mut().find(|s| s.id == id && !s.deleted) {
                if let Some(title) = body.title {
                    s.title = title.trim().to_string();
                }
                if let Some(category) = category {
                    s.category = category;
                }
                if let Some(fields) = fields {
                    s.fields = fields;
                }
                if let Some(hidden) = body.hidden {
                    s.hidden = hidden;
                }
                s.updated_at = clock::now();
                *updated_ref = Some(s.clone());
            }
            snippets
        })
        .await
        .map_err(error_response)?;

    match updated {
        Some(snippet) => {
            tracing::info!(snippet = %snippet_id, "snippet updated");
            Ok(Json(json!({"ok": true, "snippet": snippet})))
        }
        None => Err(error_response(PeerError::NotFound(snippet_id))),
    }
}

async fn delete_snippet(
    State(core): State<Arc<Core>>,
    Path(snippet_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut found = false;
    let found_ref = &mut found;
    let id = snippet_id.clone();

    core.store
        .update(SNIPPETS_DOC, Vec::new(), move |mut snippets: Vec<Snippet>| {
            if let Some(s) = snippets.iter_mut().find(|s| s.id == id) {
                s.deleted = true;
                s.updated_at = clock::now();
                *found_ref = true;
            }
            snippets
        })
        .await
        .map_err(error_response)?;

    if !found {
        return Err(error_response(PeerError::NotFound(snippet_id)));
    }
    tracing::info!(snippet = %snippet_id, "snippet tombstoned");
    Ok(Json(json!({"ok": true})))
}
