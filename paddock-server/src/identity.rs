//! Node identity: id, secp256k1 keypair, role, and request signatures.
//!
//! The keypair and node id are generated once on first boot and persisted
//! in the `identity` document; they are never rotated. Signed requests
//! carry four headers:
//!
//! ```text
//! X-Node-Id:   sender node id
//! X-Node-Ts:   wall clock, fractional seconds
//! X-Body-Hash: hex sha256 of the exact body bytes
//! X-Node-Sig:  base64 secp256k1 signature over the canonical message
//! ```
//!
//! The canonical message is the UTF-8 JSON object
//! `{"body_hash":...,"node_id":...,"timestamp":...}` with keys in that
//! (lexicographic) order; `serde_json::Value` objects serialize with sorted
//! keys, which is what makes the encoding canonical.

use std::sync::Arc;

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock;
use crate::config::{ConfiguredMode, ServerConfig};
use crate::error::PeerError;
use crate::store::{IDENTITY_DOC, NODES_DOC, Store};
use crate::types::{NodeMode, NodeRecord, NodesDoc, TrustStatus};
use crate::wire::HandshakeInfo;

pub const HDR_NODE_ID: &str = "x-node-id";
pub const HDR_NODE_TS: &str = "x-node-ts";
pub const HDR_BODY_HASH: &str = "x-body-hash";
pub const HDR_NODE_SIG: &str = "x-node-sig";

/// Accepted clock skew between signer and verifier, in seconds.
pub const REPLAY_WINDOW_SECS: f64 = 60.0;

/// The four signature headers of a signed peer request.
#[derive(Debug, Clone)]
pub struct RequestSignature {
    pub node_id: String,
    pub timestamp: String,
    pub body_hash: String,
    pub signature: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityDoc {
    #[serde(default)]
    node_id: String,
    /// Hex-encoded secp256k1 secret scalar.
    #[serde(default)]
    secret_key: String,
    #[serde(default)]
    created_at: f64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

struct ModeState {
    mode: NodeMode,
    /// Mode to restore when a temp-full promotion ends.
    original: Option<NodeMode>,
}

pub struct NodeIdentity {
    node_id: String,
    name: String,
    host: String,
    port: u16,
    public_url: String,
    primary_server: String,
    connectable: bool,
    mode: parking_lot::Mutex<ModeState>,
    signing_key: SigningKey,
    public_key_hex: String,
    store: Arc<Store>,
}

impl NodeIdentity {
    /// Load or create the node identity. Only called at startup; an
    /// unreadable or unparseable identity document aborts the process.
    pub async fn bootstrap(config: &ServerConfig, store: Arc<Store>) -> anyhow::Result<Self> {
        let mut doc: IdentityDoc = store.read(IDENTITY_DOC, IdentityDoc::default()).await;
        let mut dirty = false;

        let node_id = match &config.node_id {
            Some(id) => id.clone(),
            None if !doc.node_id.is_empty() => doc.node_id.clone(),
            None => {
                let id = generate_node_id();
                tracing::info!(node_id = %id, "first boot, generated node id");
                doc.node_id = id.clone();
                doc.created_at = clock::now();
                dirty = true;
                id
            }
        };

        let signing_key = if doc.secret_key.is_empty() {
            let key = SigningKey::random(&mut OsRng);
            doc.secret_key = hex::encode(key.to_bytes());
            dirty = true;
            tracing::info!("first boot, generated secp256k1 keypair");
            key
        } else {
            let bytes = hex::decode(&doc.secret_key)
                .map_err(|e| anyhow::anyhow!("identity document: bad secret key hex: {e}"))?;
            SigningKey::from_slice(&bytes)
                .map_err(|e| anyhow::anyhow!("identity document: invalid secret key: {e}"))?
        };

        if dirty {
            store
                .write(IDENTITY_DOC, &doc)
                .await
                .map_err(|e| anyhow::anyhow!("cannot persist identity: {e}"))?;
        }

        let public_key_hex = hex::encode(signing_key.verifying_key().to_sec1_bytes());
        let name = config
            .node_name
            .clone()
            .or_else(|| sysinfo::System::host_name())
            .unwrap_or_else(|| node_id.clone());

        let mode = resolve_mode(config);

        Ok(Self {
            node_id,
            name,
            host: config.host.clone(),
            port: config.port,
            public_url: config.public_url.clone().unwrap_or_default(),
            primary_server: config.primary_server.clone().unwrap_or_default(),
            connectable: config.connectable,
            mode: parking_lot::Mutex::new(ModeState { mode, original: None }),
            signing_key,
            public_key_hex,
            store,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    pub fn connectable(&self) -> bool {
        self.connectable
    }

    pub fn primary_server(&self) -> &str {
        &self.primary_server
    }

    pub fn mode(&self) -> NodeMode {
        self.mode.lock().mode
    }

    /// Full-capability check: a temp-full node acts as full.
    pub fn is_full(&self) -> bool {
        matches!(self.mode(), NodeMode::Full | NodeMode::TempFull)
    }

    pub fn is_relay(&self) -> bool {
        self.mode() == NodeMode::Relay
    }

    pub fn is_temp_full(&self) -> bool {
        self.mode() == NodeMode::TempFull
    }

    /// Public identity offered to joining peers.
    pub fn handshake_info(&self) -> HandshakeInfo {
        HandshakeInfo {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            mode: self.mode(),
            connectable: self.connectable,
            host: self.host.clone(),
            port: self.port,
            public_url: self.public_url.clone(),
            public_key: self.public_key_hex.clone(),
        }
    }

    /// The record this node registers for itself.
    pub fn self_record(&self, registered_at: f64) -> NodeRecord {
        NodeRecord {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            mode: self.mode(),
            connectable: self.connectable,
            host: self.host.clone(),
            port: self.port,
            public_url: self.public_url.clone(),
            registered_at,
            public_key: self.public_key_hex.clone(),
            trust_status: TrustStatus::Local,
            kicked_at: None,
            extra: serde_json::Map::new(),
        }
    }

    // ── Signing ────────────────────────────────────────────────────────

    /// Sign a request body, producing the four signature headers.
    pub fn sign_request(&self, body: &[u8]) -> Result<RequestSignature, PeerError> {
        use base64::Engine;

        let timestamp = format!("{}", clock::now());
        let body_hash = hex::encode(Sha256::digest(body));
        let message = canonical_message(&self.node_id, &timestamp, &body_hash)?;
        let signature: Signature = self.signing_key.sign(&message);
        Ok(RequestSignature {
            node_id: self.node_id.clone(),
            timestamp,
            body_hash,
            signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        })
    }

    /// Verify an inbound signed request against the sender's known public
    /// key: body hash, replay window, then the signature itself.
    pub fn verify_request(
        sig: &RequestSignature,
        body: &[u8],
        public_key_hex: &str,
    ) -> Result<(), PeerError> {
        use base64::Engine;

        let actual_hash = hex::encode(Sha256::digest(body));
        if actual_hash != sig.body_hash {
            return Err(PeerError::Malformed("body hash mismatch".into()));
        }

        let ts: f64 = sig
            .timestamp
            .parse()
            .map_err(|_| PeerError::Malformed("unparseable timestamp".into()))?;
        if (clock::now() - ts).abs() > REPLAY_WINDOW_SECS {
            return Err(PeerError::Malformed("timestamp outside replay window".into()));
        }

        let key_bytes = hex::decode(public_key_hex)
            .map_err(|_| PeerError::Malformed("bad public key hex".into()))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|_| PeerError::Malformed("invalid public key".into()))?;

        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(&sig.signature)
            .map_err(|_| PeerError::Malformed("bad signature encoding".into()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| PeerError::Malformed("invalid signature".into()))?;

        let message = canonical_message(&sig.node_id, &sig.timestamp, &sig.body_hash)?;
        verifying_key
            .verify(&message, &signature)
            .map_err(|_| PeerError::Malformed("signature verification failed".into()))
    }

    // ── Failover mode switching ────────────────────────────────────────

    /// Promote to temp-full when every hub is unreachable. No-op for a node
    /// that is already full.
    pub async fn promote_to_temp_full(&self) {
        {
            let mut state = self.mode.lock();
            if matches!(state.mode, NodeMode::Full | NodeMode::TempFull) {
                return;
            }
            state.original = Some(state.mode);
            state.mode = NodeMode::TempFull;
        }
        self.update_self_mode_in_store().await;
        tracing::warn!("all hubs unreachable, promoted to temp-full");
    }

    /// Restore the pre-promotion mode once a hub is reachable again.
    pub async fn demote_from_temp_full(&self) {
        {
            let mut state = self.mode.lock();
            if state.mode != NodeMode::TempFull {
                return;
            }
            state.mode = state.original.take().unwrap_or(NodeMode::Relay);
        }
        self.update_self_mode_in_store().await;
        tracing::info!(mode = self.mode().as_str(), "hub recovered, demoted from temp-full");
    }

    async fn update_self_mode_in_store(&self) {
        let node_id = self.node_id.clone();
        let mode = self.mode();
        let result = self
            .store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                if let Some(rec) = nodes.get_mut(&node_id) {
                    rec.mode = mode;
                    rec.registered_at = clock::bump(rec.registered_at);
                }
                nodes
            })
            .await;
        if let Err(e) = result {
            tracing::error!("failed to persist mode change: {e}");
        }
    }
}

/// Canonical signing message: JSON object with lexicographically sorted keys.
fn canonical_message(
    node_id: &str,
    timestamp: &str,
    body_hash: &str,
) -> Result<Vec<u8>, PeerError> {
    Ok(serde_json::to_vec(&serde_json::json!({
        "body_hash": body_hash,
        "node_id": node_id,
        "timestamp": timestamp,
    }))?)
}

fn generate_node_id() -> String {
    let hostname = sysinfo::System::host_name()
        .unwrap_or_else(|| "node".to_string())
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .take(16)
        .collect::<String>();
    let suffix: [u8; 2] = rand::random();
    format!("{hostname}-{}", hex::encode(suffix))
}

fn resolve_mode(config: &ServerConfig) -> NodeMode {
    let has_primary = config
        .primary_server
        .as_deref()
        .is_some_and(|s| !s.is_empty());
    match config.mode {
        ConfiguredMode::Full => NodeMode::Full,
        ConfiguredMode::Relay => {
            if has_primary {
                NodeMode::Relay
            } else {
                tracing::warn!("relay mode configured without primary-server, falling back to full");
                NodeMode::Full
            }
        }
        ConfiguredMode::Auto => {
            if has_primary {
                tracing::info!("primary-server configured, running as relay");
                NodeMode::Relay
            } else {
                if !config.connectable {
                    tracing::warn!("no primary-server and not connectable, running full but isolated");
                }
                NodeMode::Full
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    async fn identity_from(args: &[&str]) -> (tempfile::TempDir, NodeIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let mut full = vec![
            "paddock-server".to_string(),
            "--data-dir".to_string(),
            dir.path().to_string_lossy().to_string(),
        ];
        full.extend(args.iter().map(|s| s.to_string()));
        let config = ServerConfig::parse_from(full);
        let store = Arc::new(Store::open(&config.data_dir).unwrap());
        let id = NodeIdentity::bootstrap(&config, store).await.unwrap();
        (dir, id)
    }

    #[tokio::test]
    async fn keypair_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::parse_from([
            "paddock-server",
            "--data-dir",
            &dir.path().to_string_lossy(),
        ]);
        let store = Arc::new(Store::open(&config.data_dir).unwrap());
        let a = NodeIdentity::bootstrap(&config, Arc::clone(&store)).await.unwrap();
        let b = NodeIdentity::bootstrap(&config, store).await.unwrap();
        assert_eq!(a.node_id(), b.node_id());
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let (_dir, id) = identity_from(&[]).await;
        let body = br#"{"node_id":"x","since":0}"#;
        let sig = id.sign_request(body).unwrap();
        NodeIdentity::verify_request(&sig, body, id.public_key_hex()).unwrap();
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let (_dir, id) = identity_from(&[]).await;
        let sig = id.sign_request(b"original").unwrap();
        let err = NodeIdentity::verify_request(&sig, b"tampered", id.public_key_hex()).unwrap_err();
        assert!(matches!(err, PeerError::Malformed(_)));
    }

    #[tokio::test]
    async fn replayed_request_outside_window_is_rejected() {
        let (_dir, id) = identity_from(&[]).await;
        let body = b"payload";
        let mut sig = id.sign_request(body).unwrap();
        // Re-sign the canonical message with an old timestamp to simulate a
        // capture-and-replay 70 seconds later.
        sig.timestamp = format!("{}", clock::now() - 70.0);
        let message = canonical_message(&sig.node_id, &sig.timestamp, &sig.body_hash).unwrap();
        let signature: Signature = id.signing_key.sign(&message);
        use base64::Engine;
        sig.signature = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let err = NodeIdentity::verify_request(&sig, body, id.public_key_hex()).unwrap_err();
        assert!(err.to_string().contains("replay window"), "{err}");
    }

    #[tokio::test]
    async fn foreign_key_is_rejected() {
        let (_dir, id) = identity_from(&[]).await;
        let (_dir2, other) = identity_from(&[]).await;
        let body = b"payload";
        let sig = id.sign_request(body).unwrap();
        let err = NodeIdentity::verify_request(&sig, body, other.public_key_hex()).unwrap_err();
        assert!(matches!(err, PeerError::Malformed(_)));
    }

    #[tokio::test]
    async fn relay_without_primary_falls_back_to_full() {
        let (_dir, id) = identity_from(&["--mode", "relay"]).await;
        assert_eq!(id.mode(), NodeMode::Full);
    }

    #[tokio::test]
    async fn auto_with_primary_selects_relay() {
        let (_dir, id) =
            identity_from(&["--mode", "auto", "--primary-server", "http://hub:8300"]).await;
        assert_eq!(id.mode(), NodeMode::Relay);
    }

    #[tokio::test]
    async fn promote_and_demote_cycle() {
        let (_dir, id) =
            identity_from(&["--mode", "relay", "--primary-server", "http://hub:8300"]).await;
        assert!(id.is_relay());
        id.promote_to_temp_full().await;
        assert!(id.is_temp_full());
        assert!(id.is_full());
        id.demote_from_temp_full().await;
        assert!(id.is_relay());
    }

    #[tokio::test]
    async fn full_node_never_promotes() {
        let (_dir, id) = identity_from(&["--mode", "full"]).await;
        id.promote_to_temp_full().await;
        assert_eq!(id.mode(), NodeMode::Full);
    }
}
