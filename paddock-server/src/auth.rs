//! App authentication token.
//!
//! A single random token generated at first bootstrap and stored in the
//! `auth` document. The chat WebSocket and the manual trigger-sync endpoint
//! require it; the full user/session layer of the web UI lives outside this
//! crate.

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::store::{AUTH_DOC, Store};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthDoc {
    #[serde(default)]
    app_token: String,
    #[serde(default)]
    created_at: f64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct AuthService {
    token: String,
}

impl AuthService {
    pub async fn bootstrap(store: &Store) -> anyhow::Result<Self> {
        let mut doc: AuthDoc = store.read(AUTH_DOC, AuthDoc::default()).await;
        if doc.app_token.is_empty() {
            doc.app_token = generate_token();
            doc.created_at = clock::now();
            store
                .write(AUTH_DOC, &doc)
                .await
                .map_err(|e| anyhow::anyhow!("cannot persist auth token: {e}"))?;
            tracing::info!("generated app token (see auth.json in the data directory)");
        }
        Ok(Self { token: doc.app_token })
    }

    pub fn validate(&self, candidate: &str) -> bool {
        !self.token.is_empty() && candidate == self.token
    }
}

fn generate_token() -> String {
    use base64::Engine;
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
